//! Region extraction.
//!
//! After every top level statement has a placement, contiguous runs with
//! the same placement become regions, and a boundary node is inserted at
//! each mode switch. A boundary carries the sorted set of variables that
//! are live across it: assigned somewhere before the switch and used
//! somewhere after it, each tagged with its abstract value at the switch
//! point. Values crossing `ToInterpreted` must have a concrete
//! representation; values crossing `ToGraph` lose any static identity
//! the earlier analysis had for them.

use crate::infer::AbstractEnv;
use crate::ir::Stmt;
use crate::lattice::AbstractValue;
use crate::span::Span;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Execution placement of a statement or region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionMode {
    Graph,
    Interpreted,
}

/// Direction of a mode switch between adjacent regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryDirection {
    /// Graph values are projected into interpreter objects.
    ToInterpreted,
    /// Interpreter results are materialized back as graph values.
    ToGraph,
}

/// One variable transferred across a boundary, tagged with its abstract
/// value on the source side of the switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveVar {
    pub name: String,
    pub value: AbstractValue,
}

/// A mode switch point between region `index` and `index + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryNode {
    pub direction: BoundaryDirection,
    /// Variables transferred across the switch, sorted by name so the
    /// transfer order is deterministic.
    pub live: Vec<LiveVar>,
    pub span: Span,
}

impl BoundaryNode {
    /// Names of the crossing variables, in transfer order.
    pub fn live_names(&self) -> Vec<&str> {
        self.live.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn carries(&self, name: &str) -> bool {
        self.live.iter().any(|v| v.name == name)
    }
}

/// A maximal run of same-placement statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub mode: RegionMode,
    pub stmts: Vec<Stmt>,
}

impl Region {
    pub fn is_interpreted(&self) -> bool {
        self.mode == RegionMode::Interpreted
    }
}

/// The partitioned function body: `boundaries[i]` sits between
/// `regions[i]` and `regions[i + 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionPlan {
    pub regions: Vec<Region>,
    pub boundaries: Vec<BoundaryNode>,
}

impl RegionPlan {
    pub fn interpreted_region_count(&self) -> usize {
        self.regions.iter().filter(|r| r.is_interpreted()).count()
    }
}

/// Partition placed statements into regions and boundary nodes.
///
/// `envs_after[i]` is the abstract environment after statement `i`; the
/// boundary before statement `i` records each crossing variable's value
/// from `envs_after[i - 1]`. A variable with no snapshot crosses as
/// `Unknown`.
///
/// `params` seeds the set of names considered defined before the first
/// statement, so a parameter consumed only by a late region still crosses
/// every intervening boundary.
pub fn partition(
    placed: Vec<(Stmt, RegionMode)>,
    envs_after: &[AbstractEnv],
    params: &[String],
) -> RegionPlan {
    if placed.is_empty() {
        return RegionPlan {
            regions: Vec::new(),
            boundaries: Vec::new(),
        };
    }

    // used_after[i]: names read by statement i or any later statement.
    let mut used_after: Vec<BTreeSet<String>> = Vec::with_capacity(placed.len());
    let mut running: BTreeSet<String> = BTreeSet::new();
    for (stmt, _) in placed.iter().rev() {
        let mut used = Vec::new();
        stmt.collect_used(&mut used);
        running.extend(used);
        used_after.push(running.clone());
    }
    used_after.reverse();

    let mut defined: BTreeSet<String> = params.iter().cloned().collect();

    let mut regions: Vec<Region> = Vec::new();
    let mut boundaries: Vec<BoundaryNode> = Vec::new();

    for (i, (stmt, mode)) in placed.into_iter().enumerate() {
        let switches = regions.last().is_some_and(|r| r.mode != mode);
        if switches {
            let prev_mode = regions.last().map(|r| r.mode);
            let at_point = i.checked_sub(1).and_then(|j| envs_after.get(j));
            let live: Vec<LiveVar> = defined
                .intersection(&used_after[i])
                .map(|name| LiveVar {
                    name: name.clone(),
                    value: at_point
                        .and_then(|env| env.get(name))
                        .cloned()
                        .unwrap_or(AbstractValue::Unknown),
                })
                .collect();
            boundaries.push(BoundaryNode {
                direction: match prev_mode {
                    Some(RegionMode::Graph) => BoundaryDirection::ToInterpreted,
                    _ => BoundaryDirection::ToGraph,
                },
                live,
                span: stmt.span(),
            });
        }
        if switches || regions.is_empty() {
            regions.push(Region {
                mode,
                stmts: Vec::new(),
            });
        }

        let mut assigned = Vec::new();
        stmt.collect_assigned(&mut assigned);
        defined.extend(assigned);

        if let Some(region) = regions.last_mut() {
            region.stmts.push(stmt);
        }
    }

    RegionPlan {
        regions,
        boundaries,
    }
}
