//! Loop unrolling and control-flow state merging.
//!
//! Graphable constructs are lowered here. Bounded loops over static trip
//! counts are flattened into straight-line statements; loops that keep
//! their structure (early exits, while) get their post-state computed by
//! abstract execution, joining the environments of every path that can
//! reach the point after the construct. A join that bottoms out for some
//! variable demotes the whole construct to a fallback instead of failing
//! compilation.

use crate::diagnostics::FallbackReason;
use crate::error::InferenceError;
use crate::infer::{AbstractEnv, InferenceEngine};
use crate::ir::{Expr, Iterable, Stmt};
use crate::lattice::widening::{MAX_LOOP_FIXPOINT_ITERATIONS, MAX_STATIC_UNROLL};
use crate::lattice::{AbstractValue, ScalarKind};

/// Result of lowering one graphable construct.
#[derive(Debug, Clone, PartialEq)]
pub enum LowerResult {
    /// Statements to splice into the graph region, with `env` advanced to
    /// the post-construct state.
    Lowered(Vec<Stmt>),
    /// The construct survived classification but its state merge does
    /// not; it must run interpreted instead.
    Fallback(FallbackReason),
}

/// How an abstractly executed block leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockExit {
    Normal,
    Break,
    Continue,
    Return,
}

/// Exit-state accumulator for one loop: every env observed at a `break`
/// joins into the post-loop state.
#[derive(Debug, Default)]
struct LoopState {
    break_envs: Vec<AbstractEnv>,
}

impl LoopState {
    fn record_break(&mut self, env: AbstractEnv) {
        self.break_envs.push(env);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Unroller<'r> {
    engine: InferenceEngine<'r>,
}

impl<'r> Unroller<'r> {
    pub fn new(engine: InferenceEngine<'r>) -> Self {
        Self { engine }
    }

    /// Lower one statement, advancing `env` to its post-state. Only
    /// statements already judged graphable reach this point.
    pub fn lower_stmt(
        &self,
        stmt: &Stmt,
        env: &mut AbstractEnv,
    ) -> Result<LowerResult, InferenceError> {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let abstract_value = self.engine.infer_expr(value, env)?;
                env.set(target, abstract_value);
                Ok(LowerResult::Lowered(vec![stmt.clone()]))
            }

            Stmt::Return { .. } | Stmt::Break(_) | Stmt::Continue(_) => {
                Ok(LowerResult::Lowered(vec![stmt.clone()]))
            }

            Stmt::If {
                cond,
                then_body,
                else_body,
                span,
            } => self.lower_if(cond, then_body, else_body, *span, env),

            Stmt::For {
                var,
                iter,
                body,
                span,
            } => self.lower_for(var, iter, body, *span, env),

            Stmt::While { cond, body, span } => self.lower_while(cond, body, *span, env),
        }
    }

    fn lower_block(
        &self,
        stmts: &[Stmt],
        env: &mut AbstractEnv,
    ) -> Result<LowerResult, InferenceError> {
        let mut out = Vec::new();
        for stmt in stmts {
            match self.lower_stmt(stmt, env)? {
                LowerResult::Lowered(lowered) => out.extend(lowered),
                fallback => return Ok(fallback),
            }
        }
        Ok(LowerResult::Lowered(out))
    }

    fn lower_if(
        &self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
        span: crate::span::Span,
        env: &mut AbstractEnv,
    ) -> Result<LowerResult, InferenceError> {
        let cond_abstract = self.engine.infer_expr(cond, env)?;

        // A statically known condition folds to the taken branch.
        if let AbstractValue::Scalar {
            kind: ScalarKind::Bool,
            literal: Some(lit),
        } = &cond_abstract
        {
            let taken = if lit.as_bool().unwrap_or(false) {
                then_body
            } else {
                else_body
            };
            return self.lower_block(taken, env);
        }

        let mut then_env = env.clone();
        let then_lowered = match self.lower_block(then_body, &mut then_env)? {
            LowerResult::Lowered(stmts) => stmts,
            fallback => return Ok(fallback),
        };
        let mut else_env = env.clone();
        let else_lowered = match self.lower_block(else_body, &mut else_env)? {
            LowerResult::Lowered(stmts) => stmts,
            fallback => return Ok(fallback),
        };

        then_env.merge(&else_env);
        if let Some(var) = bottomed_variable(&then_env) {
            return Ok(LowerResult::Fallback(FallbackReason::MergeDivergence(var)));
        }
        *env = then_env;

        Ok(LowerResult::Lowered(vec![Stmt::If {
            cond: cond.clone(),
            then_body: then_lowered,
            else_body: else_lowered,
            span,
        }]))
    }

    fn lower_for(
        &self,
        var: &str,
        iter: &Iterable,
        body: &[Stmt],
        span: crate::span::Span,
        env: &mut AbstractEnv,
    ) -> Result<LowerResult, InferenceError> {
        // Per-iteration binding expressions for the loop variable.
        let bindings: Vec<Expr> = match iter {
            Iterable::Range { bound, .. } => {
                let bound_abstract = self.engine.infer_expr(bound, env)?;
                let n = match bound_abstract {
                    AbstractValue::Scalar {
                        kind: ScalarKind::Int,
                        literal: Some(lit),
                    } => lit.as_int().unwrap_or(0).max(0),
                    _ => {
                        return Ok(LowerResult::Fallback(FallbackReason::RangeBoundNotStatic))
                    }
                };
                if n > MAX_STATIC_UNROLL as i64 {
                    return Ok(LowerResult::Fallback(FallbackReason::LoopBoundTooLarge(n)));
                }
                (0..n).map(Expr::int).collect()
            }
            Iterable::Zip { seqs, .. } => {
                let mut len: Option<usize> = None;
                for seq in seqs {
                    match self.engine.infer_expr(seq, env)? {
                        AbstractValue::Sequence(elems) => {
                            len = Some(len.map_or(elems.len(), |l| l.min(elems.len())));
                        }
                        _ => {
                            return Ok(LowerResult::Fallback(FallbackReason::UnknownIterable))
                        }
                    }
                }
                let len = len.unwrap_or(0);
                (0..len)
                    .map(|i| {
                        if seqs.len() == 1 {
                            Expr::TupleGet {
                                tuple: Box::new(seqs[0].clone()),
                                index: i,
                                span,
                            }
                        } else {
                            Expr::Tuple {
                                elements: seqs
                                    .iter()
                                    .map(|s| Expr::TupleGet {
                                        tuple: Box::new(s.clone()),
                                        index: i,
                                        span,
                                    })
                                    .collect(),
                                span,
                            }
                        }
                    })
                    .collect()
            }
            Iterable::Seq { seq, .. } => {
                let len = match self.engine.infer_expr(seq, env)? {
                    AbstractValue::Sequence(elems) => elems.len(),
                    _ => return Ok(LowerResult::Fallback(FallbackReason::UnknownIterable)),
                };
                (0..len)
                    .map(|i| Expr::TupleGet {
                        tuple: Box::new(seq.clone()),
                        index: i,
                        span,
                    })
                    .collect()
            }
        };

        if !block_has_early_exit(body) {
            // Flatten: bind the loop variable, then splice the body, once
            // per iteration. Nested static loops flatten recursively.
            let mut out = Vec::new();
            for binding in bindings {
                match self.lower_stmt(&Stmt::assign(var, binding), env)? {
                    LowerResult::Lowered(stmts) => out.extend(stmts),
                    fallback => return Ok(fallback),
                }
                match self.lower_block(body, env)? {
                    LowerResult::Lowered(stmts) => out.extend(stmts),
                    fallback => return Ok(fallback),
                }
            }
            return Ok(LowerResult::Lowered(out));
        }

        // Early exits keep the loop structured. Execute the iterations
        // abstractly to compute the post-state, joining every break path.
        let mut state = LoopState::default();
        let mut cur = env.clone();
        for binding in &bindings {
            let element = self.engine.infer_expr(binding, &cur)?;
            cur.set(var, element);
            match self.abstract_block(body, &mut cur, &mut state)? {
                BlockExit::Normal | BlockExit::Continue => {}
                BlockExit::Break | BlockExit::Return => break,
            }
        }
        for break_env in &state.break_envs {
            cur.merge(break_env);
        }
        if let Some(name) = bottomed_variable(&cur) {
            return Ok(LowerResult::Fallback(FallbackReason::MergeDivergence(name)));
        }
        *env = cur;

        Ok(LowerResult::Lowered(vec![Stmt::For {
            var: var.to_string(),
            iter: iter.clone(),
            body: body.to_vec(),
            span,
        }]))
    }

    fn lower_while(
        &self,
        cond: &Expr,
        body: &[Stmt],
        span: crate::span::Span,
        env: &mut AbstractEnv,
    ) -> Result<LowerResult, InferenceError> {
        // The loop may run zero times, so the entry env is already part
        // of the post-state; iterate the body transfer until it adds
        // nothing new.
        let mut cur = env.clone();
        let mut stable = false;
        for _ in 0..MAX_LOOP_FIXPOINT_ITERATIONS {
            let cond_abstract = self.engine.infer_expr(cond, &cur)?;
            if !matches!(
                cond_abstract,
                AbstractValue::Scalar {
                    kind: ScalarKind::Bool,
                    ..
                }
            ) {
                return Ok(LowerResult::Fallback(
                    FallbackReason::WhileConditionNotScalarBool,
                ));
            }

            let mut iter_env = cur.clone();
            let mut state = LoopState::default();
            self.abstract_block(body, &mut iter_env, &mut state)?;
            for break_env in &state.break_envs {
                iter_env.merge(break_env);
            }

            let mut changed = false;
            for (name, value) in iter_env.iter() {
                changed |= cur.update(name, value.clone());
            }
            // A Bottom must be caught now: the next join round would
            // absorb it (Bottom is the join identity) and hide the
            // divergence.
            if let Some(name) = bottomed_variable(&cur) {
                return Ok(LowerResult::Fallback(FallbackReason::MergeDivergence(name)));
            }
            if !changed {
                stable = true;
                break;
            }
        }
        if !stable {
            return Ok(LowerResult::Fallback(FallbackReason::FixpointDivergence));
        }
        *env = cur;

        Ok(LowerResult::Lowered(vec![Stmt::While {
            cond: cond.clone(),
            body: body.to_vec(),
            span,
        }]))
    }

    /// Abstract execution of a structured loop body: no statements are
    /// emitted, only the env evolves. Break paths are captured in `state`.
    fn abstract_block(
        &self,
        stmts: &[Stmt],
        env: &mut AbstractEnv,
        state: &mut LoopState,
    ) -> Result<BlockExit, InferenceError> {
        for stmt in stmts {
            match stmt {
                Stmt::Assign { target, value, .. } => {
                    let abstract_value = self.engine.infer_expr(value, env)?;
                    env.set(target, abstract_value);
                }
                Stmt::Break(_) => {
                    state.record_break(env.clone());
                    return Ok(BlockExit::Break);
                }
                Stmt::Continue(_) => return Ok(BlockExit::Continue),
                Stmt::Return { .. } => return Ok(BlockExit::Return),
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                    ..
                } => {
                    let cond_abstract = self.engine.infer_expr(cond, env)?;
                    if let AbstractValue::Scalar {
                        kind: ScalarKind::Bool,
                        literal: Some(lit),
                    } = &cond_abstract
                    {
                        let taken = if lit.as_bool().unwrap_or(false) {
                            then_body
                        } else {
                            else_body
                        };
                        match self.abstract_block(taken, env, state)? {
                            BlockExit::Normal => {}
                            exit => return Ok(exit),
                        }
                        continue;
                    }

                    let mut then_env = env.clone();
                    let then_exit = self.abstract_block(then_body, &mut then_env, state)?;
                    let mut else_env = env.clone();
                    let else_exit = self.abstract_block(else_body, &mut else_env, state)?;
                    match (then_exit, else_exit) {
                        (BlockExit::Normal, BlockExit::Normal) => {
                            then_env.merge(&else_env);
                            *env = then_env;
                        }
                        // Only the non-exiting side reaches the next
                        // statement; the exiting side's env was captured
                        // where it left.
                        (BlockExit::Normal, _) => *env = then_env,
                        (_, BlockExit::Normal) => *env = else_env,
                        (exit, _) => return Ok(exit),
                    }
                }
                // Nested loops with early exits were diverted during
                // classification, so these only carry normal completion.
                Stmt::For {
                    var, iter, body, ..
                } => {
                    let mut scratch = env.clone();
                    let element = match iter {
                        Iterable::Range { .. } => AbstractValue::scalar(ScalarKind::Int),
                        _ => AbstractValue::Unknown,
                    };
                    scratch.set(var, element);
                    let mut inner = LoopState::default();
                    self.abstract_block(body, &mut scratch, &mut inner)?;
                    env.merge(&scratch);
                }
                Stmt::While { body, .. } => {
                    let mut scratch = env.clone();
                    let mut inner = LoopState::default();
                    self.abstract_block(body, &mut scratch, &mut inner)?;
                    env.merge(&scratch);
                }
            }
        }
        Ok(BlockExit::Normal)
    }
}

/// First variable whose merged abstract is Bottom, in sorted order so the
/// reported name is deterministic.
fn bottomed_variable(env: &AbstractEnv) -> Option<String> {
    env.names_sorted()
        .into_iter()
        .find(|name| env.get(name).is_some_and(AbstractValue::is_bottom))
}

/// break/continue/return directly in this block or inside its if arms.
/// Exits captured by a deeper loop do not count.
fn block_has_early_exit(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Return { .. } => true,
        Stmt::If {
            then_body,
            else_body,
            ..
        } => block_has_early_exit(then_body) || block_has_early_exit(else_body),
        Stmt::For { .. } | Stmt::While { .. } | Stmt::Assign { .. } => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{AbstractValue as A, DType, Dim};
    use crate::registry::BuiltinRegistry;
    use crate::span::Span;

    fn unroller(registry: &BuiltinRegistry) -> Unroller<'_> {
        Unroller::new(InferenceEngine::new(registry))
    }

    fn lowered(result: LowerResult) -> Vec<Stmt> {
        match result {
            LowerResult::Lowered(stmts) => stmts,
            LowerResult::Fallback(reason) => panic!("unexpected fallback: {reason}"),
        }
    }

    #[test]
    fn test_static_range_flattens_to_straight_line() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("y", A::tensor(DType::I32, &[]));
        env.set("x", A::tensor(DType::I32, &[]));
        let stmt = Stmt::for_range(
            "i",
            Expr::int(3),
            vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x")))],
        );
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        // Three iterations, each a loop-var bind plus the body statement.
        assert_eq!(out.len(), 6);
        assert!(matches!(&out[0], Stmt::Assign { target, .. } if target == "i"));
        assert!(matches!(&out[1], Stmt::Assign { target, .. } if target == "y"));
        assert_eq!(
            env.get("y"),
            Some(&A::Tensor {
                dtype: DType::I32,
                shape: Some(vec![])
            })
        );
    }

    #[test]
    fn test_zero_trip_range_emits_nothing() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        let stmt = Stmt::for_range("i", Expr::int(0), vec![Stmt::assign("y", Expr::int(1))]);
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert!(out.is_empty());
        assert_eq!(env.get("y"), None);
    }

    #[test]
    fn test_zip_unrolls_by_shortest_sequence() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set(
            "t",
            A::Sequence(vec![A::int(1), A::int(2), A::int(3)]),
        );
        env.set("u", A::Sequence(vec![A::int(10), A::int(20)]));
        env.set("s", A::int(0));
        let stmt = Stmt::for_zip(
            "p",
            vec![Expr::var("t"), Expr::var("u")],
            vec![Stmt::assign(
                "s",
                Expr::add(
                    Expr::var("s"),
                    Expr::TupleGet {
                        tuple: Box::new(Expr::var("p")),
                        index: 0,
                        span: Span::synthetic(),
                    },
                ),
            )],
        );
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_break_path_joins_into_post_state() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("y", A::tensor(DType::I32, &[]));
        env.set("c", A::scalar(ScalarKind::Bool));
        // y keeps its tensor type on both the break path and the normal
        // path, so the merged post-state stays precise.
        let stmt = Stmt::for_range(
            "i",
            Expr::int(4),
            vec![
                Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("y"))),
                Stmt::If {
                    cond: Expr::var("c"),
                    then_body: vec![Stmt::Break(Span::synthetic())],
                    else_body: vec![],
                    span: Span::synthetic(),
                },
            ],
        );
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert_eq!(out.len(), 1, "loop with break stays structured");
        assert!(matches!(&out[0], Stmt::For { .. }));
        assert!(
            matches!(env.get("y"), Some(A::Tensor { dtype: DType::I32, .. })),
            "got {:?}",
            env.get("y")
        );
    }

    #[test]
    fn test_divergent_merge_demotes_to_fallback() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("c", A::scalar(ScalarKind::Bool));
        // y is an int on one path and a str on the other; the join is
        // Bottom, so the branch cannot be lowered.
        let stmt = Stmt::If {
            cond: Expr::var("c"),
            then_body: vec![Stmt::assign("y", Expr::int(1))],
            else_body: vec![Stmt::assign("y", Expr::str("one"))],
            span: Span::synthetic(),
        };
        let result = unroller(&registry).lower_stmt(&stmt, &mut env).unwrap();
        assert_eq!(
            result,
            LowerResult::Fallback(FallbackReason::MergeDivergence("y".to_string()))
        );
    }

    #[test]
    fn test_static_bool_condition_folds_branch() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        let stmt = Stmt::If {
            cond: Expr::bool(false),
            then_body: vec![Stmt::assign("y", Expr::int(1))],
            else_body: vec![Stmt::assign("y", Expr::int(2))],
            span: Span::synthetic(),
        };
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(env.get("y"), Some(&A::int(2)));
    }

    #[test]
    fn test_while_reaches_fixpoint_and_widens_literal() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("n", A::int(0));
        env.set("flag", A::scalar(ScalarKind::Bool));
        let stmt = Stmt::While {
            cond: Expr::var("flag"),
            body: vec![Stmt::assign("n", Expr::add(Expr::var("n"), Expr::int(1)))],
            span: Span::synthetic(),
        };
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert_eq!(out.len(), 1);
        // The counter's literal cannot survive an unknown trip count.
        assert_eq!(env.get("n"), Some(&A::scalar(ScalarKind::Int)));
    }

    #[test]
    fn test_mutating_shape_in_while_demotes_to_fallback() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::F32, &[2]));
        env.set("flag", A::scalar(ScalarKind::Bool));
        env.set("s", A::scalar(ScalarKind::Str));
        // Reassigning t to an incompatible kind in the body makes the
        // entry/exit join Bottom.
        let stmt = Stmt::While {
            cond: Expr::var("flag"),
            body: vec![Stmt::assign("t", Expr::var("s"))],
            span: Span::synthetic(),
        };
        let result = unroller(&registry).lower_stmt(&stmt, &mut env).unwrap();
        assert_eq!(
            result,
            LowerResult::Fallback(FallbackReason::MergeDivergence("t".to_string()))
        );
    }

    #[test]
    fn test_flattened_seq_loop_tracks_per_iteration_shapes() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set(
            "t",
            A::Sequence(vec![
                A::tensor(DType::F32, &[2]),
                A::tensor(DType::F32, &[3]),
            ]),
        );
        env.set("acc", A::Unknown);
        let stmt = Stmt::For {
            var: "x".to_string(),
            iter: Iterable::Seq {
                seq: Expr::var("t"),
                span: Span::synthetic(),
            },
            body: vec![Stmt::assign("acc", Expr::var("x"))],
            span: Span::synthetic(),
        };
        let out = lowered(unroller(&registry).lower_stmt(&stmt, &mut env).unwrap());
        assert_eq!(out.len(), 4);
        // Last binding wins in the flattened form.
        assert_eq!(
            env.get("acc"),
            Some(&A::Tensor {
                dtype: DType::F32,
                shape: Some(vec![Dim::Known(3)])
            })
        );
    }
}
