//! Compilation driver.
//!
//! `compile` runs the per-statement pipeline over a function body:
//! classify, lower graphable constructs through the unroller, place the
//! rest in interpreted regions, then partition the placed statements
//! into a region plan with boundary nodes. Compilation is explicit: the
//! caller passes the abstract signature and the execution mode, and gets
//! back a plan plus the fallback log, or an error for constructs no mode
//! can run.

use crate::classify::{Classifier, Verdict};
use crate::diagnostics::{FallbackEvent, FallbackReason};
use crate::error::{CompileError, ConversionError};
use crate::extract::{partition, BoundaryDirection, Region, RegionMode, RegionPlan};
use crate::infer::{AbstractEnv, InferenceEngine};
use crate::ir::{FunctionBody, Stmt};
use crate::lattice::AbstractValue;
use crate::registry::OpRegistry;
use crate::unroll::{LowerResult, Unroller};
use serde::{Deserialize, Serialize};

/// How a compiled function is meant to run. There is no ambient global
/// mode; every compilation names its mode explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Analyze, lower, and fall back per region.
    Graph,
    /// Run the whole body under interpreted semantics, no analysis.
    Eager,
}

/// Output of one compilation: the partitioned body plus everything the
/// caller needs to report on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub name: String,
    pub params: Vec<String>,
    pub signature: Vec<AbstractValue>,
    pub mode: ExecutionMode,
    pub plan: RegionPlan,
    /// One event per construct that was demoted to interpreted execution.
    pub fallback_log: Vec<FallbackEvent>,
    /// Join of the abstracts of every return site.
    pub return_type: AbstractValue,
}

impl CompiledFunction {
    pub fn regions(&self) -> &[Region] {
        &self.plan.regions
    }

    pub fn is_fully_graphed(&self) -> bool {
        self.fallback_log.is_empty() && self.plan.interpreted_region_count() == 0
    }

    pub fn fallback_report(&self) -> crate::diagnostics::FallbackReport {
        crate::diagnostics::FallbackReport::new(self.name.clone(), self.fallback_log.clone())
    }
}

pub struct Compiler<'r> {
    registry: &'r dyn OpRegistry,
}

impl std::fmt::Debug for Compiler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler").finish_non_exhaustive()
    }
}

impl<'r> Compiler<'r> {
    pub fn new(registry: &'r dyn OpRegistry) -> Self {
        Self { registry }
    }

    pub fn compile(
        &self,
        func: &FunctionBody,
        signature: &[AbstractValue],
        mode: ExecutionMode,
    ) -> Result<CompiledFunction, CompileError> {
        if signature.len() != func.params.len() {
            return Err(CompileError::SignatureMismatch {
                expected: func.params.len(),
                given: signature.len(),
            });
        }

        match mode {
            ExecutionMode::Eager => Ok(self.compile_eager(func, signature)),
            ExecutionMode::Graph => self.compile_graph(func, signature),
        }
    }

    fn compile_eager(&self, func: &FunctionBody, signature: &[AbstractValue]) -> CompiledFunction {
        let plan = if func.stmts.is_empty() {
            RegionPlan {
                regions: Vec::new(),
                boundaries: Vec::new(),
            }
        } else {
            RegionPlan {
                regions: vec![Region {
                    mode: RegionMode::Interpreted,
                    stmts: func.stmts.clone(),
                }],
                boundaries: Vec::new(),
            }
        };
        CompiledFunction {
            name: func.name.clone(),
            params: func.params.clone(),
            signature: signature.to_vec(),
            mode: ExecutionMode::Eager,
            plan,
            fallback_log: Vec::new(),
            return_type: AbstractValue::Unknown,
        }
    }

    fn compile_graph(
        &self,
        func: &FunctionBody,
        signature: &[AbstractValue],
    ) -> Result<CompiledFunction, CompileError> {
        let engine = InferenceEngine::new(self.registry);
        let classifier = Classifier::new(engine);
        let unroller = Unroller::new(engine);

        let mut env =
            AbstractEnv::from_params(func.params.iter().map(String::as_str).zip(signature));
        let mut placed: Vec<(Stmt, RegionMode)> = Vec::new();
        // Env snapshot after each placed statement, for boundary checks.
        let mut envs_after: Vec<AbstractEnv> = Vec::new();
        let mut fallback_log: Vec<FallbackEvent> = Vec::new();
        let mut return_type = AbstractValue::Bottom;

        for stmt in &func.stmts {
            let mut verdict = classifier.classify_stmt(stmt, &env)?;

            // An operand that is merely a variable holding an interpreted
            // result can be materialized back into the graph at a
            // boundary; retry the classification as if that already
            // happened. Constructs built around an opaque expression
            // itself still fall back.
            if verdict == Verdict::RequiresFallback(FallbackReason::InterpretedOperand) {
                let rematerialized = materialize_env(&env);
                if classifier
                    .classify_stmt(stmt, &rematerialized)?
                    .is_graphable()
                {
                    env = rematerialized;
                    verdict = Verdict::Graphable;
                }
            }

            match verdict {
                Verdict::Rejected {
                    construct,
                    span,
                    reason,
                } => return Err(CompileError::rejected(construct, span, reason)),

                Verdict::RequiresFallback(reason) => {
                    self.place_interpreted(stmt, reason, &mut env, &mut placed, &mut fallback_log);
                    if matches!(stmt, Stmt::Return { .. }) {
                        return_type = return_type.join(&AbstractValue::Unknown);
                    }
                    envs_after.push(env.clone());
                }

                Verdict::Graphable => match unroller.lower_stmt(stmt, &mut env)? {
                    LowerResult::Lowered(lowered) => {
                        if let Stmt::Return { value, .. } = stmt {
                            let ret = match value {
                                Some(v) => engine.infer_expr(v, &env)?,
                                None => AbstractValue::Unknown,
                            };
                            return_type = return_type.join(&ret);
                        }
                        for s in lowered {
                            placed.push((s, RegionMode::Graph));
                            // Boundaries cannot fall inside a lowered
                            // batch, so the post-batch env stands in for
                            // every statement of it.
                            envs_after.push(env.clone());
                        }
                    }
                    LowerResult::Fallback(reason) => {
                        self.place_interpreted(
                            stmt,
                            reason,
                            &mut env,
                            &mut placed,
                            &mut fallback_log,
                        );
                        envs_after.push(env.clone());
                    }
                },
            }
        }

        let plan = partition(placed, &envs_after, &func.params);
        self.check_boundaries(&plan)?;

        if return_type.is_bottom() {
            return_type = AbstractValue::Unknown;
        }

        Ok(CompiledFunction {
            name: func.name.clone(),
            params: func.params.clone(),
            signature: signature.to_vec(),
            mode: ExecutionMode::Graph,
            plan,
            fallback_log,
            return_type,
        })
    }

    fn place_interpreted(
        &self,
        stmt: &Stmt,
        reason: FallbackReason,
        env: &mut AbstractEnv,
        placed: &mut Vec<(Stmt, RegionMode)>,
        fallback_log: &mut Vec<FallbackEvent>,
    ) {
        fallback_log.push(FallbackEvent {
            construct: stmt.construct_kind(),
            span: stmt.span(),
            reason,
        });
        let mut assigned = Vec::new();
        stmt.collect_assigned(&mut assigned);
        for name in assigned {
            env.set(&name, AbstractValue::Interpreted);
        }
        placed.push((stmt.clone(), RegionMode::Interpreted));
    }

    /// Values handed to the interpreter must have a concrete form. A
    /// tensor whose static shape is incomplete cannot be projected, and
    /// that is known at compile time.
    fn check_boundaries(&self, plan: &RegionPlan) -> Result<(), CompileError> {
        for boundary in &plan.boundaries {
            if boundary.direction != BoundaryDirection::ToInterpreted {
                continue;
            }
            for var in &boundary.live {
                if matches!(var.value, AbstractValue::Tensor { .. })
                    && !var.value.has_concrete_representation()
                {
                    return Err(CompileError::conversion(
                        boundary.span,
                        ConversionError::no_concrete_representation(&var.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Treat interpreted bindings as unknown graph values, the state they
/// take after crossing a ToGraph boundary.
fn materialize_env(env: &AbstractEnv) -> AbstractEnv {
    let mut out = env.clone();
    for name in env.names_sorted() {
        if env
            .get(&name)
            .is_some_and(AbstractValue::contains_interpreted)
        {
            out.set(&name, AbstractValue::Unknown);
        }
    }
    out
}

/// Compile `func` for the given abstract argument signature.
pub fn compile(
    registry: &dyn OpRegistry,
    func: &FunctionBody,
    signature: &[AbstractValue],
    mode: ExecutionMode,
) -> Result<CompiledFunction, CompileError> {
    Compiler::new(registry).compile(func, signature, mode)
}
