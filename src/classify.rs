//! Graph-representability classifier.
//!
//! For each syntactic construct the classifier decides one of three
//! verdicts given the abstract types of its operands:
//!
//! - `Graphable`: lowers into graph nodes.
//! - `RequiresFallback`: a valid program exists but the segment must run
//!   under interpreted semantics. Never an error.
//! - `Rejected`: no execution mode can satisfy the construct. Aborts the
//!   whole compilation.
//!
//! The decision policy is the matrix in [`crate::diagnostics`]; the one
//! hard rejection every caller should know about is the range bound: the
//! graph's loop primitive cannot express a trip count sourced from a
//! runtime tensor value, so `for _ in range(tensor)` is `Rejected`, not a
//! fallback.

use crate::diagnostics::{FallbackReason, RejectReason};
use crate::error::InferenceError;
use crate::infer::{AbstractEnv, InferenceEngine};
use crate::ir::{ConstructKind, Expr, Iterable, Stmt};
use crate::lattice::widening::MAX_STATIC_UNROLL;
use crate::lattice::{AbstractValue, ScalarKind};
use crate::span::Span;
use serde::{Deserialize, Serialize};

/// Outcome of classifying one construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Graphable,
    RequiresFallback(FallbackReason),
    Rejected {
        construct: ConstructKind,
        span: Span,
        reason: RejectReason,
    },
}

impl Verdict {
    pub fn is_graphable(&self) -> bool {
        matches!(self, Verdict::Graphable)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Verdict::Rejected { .. })
    }

    /// Severity order: Rejected dominates RequiresFallback dominates
    /// Graphable. The first reason encountered is kept.
    fn combine(self, other: Verdict) -> Verdict {
        match (&self, &other) {
            (Verdict::Rejected { .. }, _) => self,
            (_, Verdict::Rejected { .. }) => other,
            (Verdict::RequiresFallback(_), _) => self,
            (_, Verdict::RequiresFallback(_)) => other,
            _ => Verdict::Graphable,
        }
    }
}

/// Classifies constructs against the abstract environment at their
/// program point.
#[derive(Debug, Clone, Copy)]
pub struct Classifier<'r> {
    engine: InferenceEngine<'r>,
}

impl<'r> Classifier<'r> {
    pub fn new(engine: InferenceEngine<'r>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> InferenceEngine<'r> {
        self.engine
    }

    /// Classify one statement under `env`.
    pub fn classify_stmt(
        &self,
        stmt: &Stmt,
        env: &AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        match stmt {
            Stmt::Assign { value, .. } => self.classify_expr(value, env),

            Stmt::Return { value, .. } => match value {
                Some(v) => self.classify_expr(v, env),
                None => Ok(Verdict::Graphable),
            },

            Stmt::Break(_) | Stmt::Continue(_) => Ok(Verdict::Graphable),

            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => self.classify_if(cond, then_body, else_body, env),

            Stmt::While { cond, body, span } => self.classify_while(cond, body, *span, env),

            Stmt::For {
                var,
                iter,
                body,
                span,
            } => self.classify_for(var, iter, body, *span, env),
        }
    }

    /// Classify an expression: verdicts are driven by the abstracts of its
    /// operands, never by concrete values.
    pub fn classify_expr(
        &self,
        expr: &Expr,
        env: &AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        match expr {
            Expr::Literal(..) => Ok(Verdict::Graphable),

            Expr::Opaque { .. } => Ok(Verdict::RequiresFallback(
                FallbackReason::InterpretedOperand,
            )),

            Expr::Var(name, _) => match env.get(name) {
                Some(v) if v.contains_interpreted() => Ok(Verdict::RequiresFallback(
                    FallbackReason::InterpretedOperand,
                )),
                _ => Ok(Verdict::Graphable),
            },

            Expr::Binary {
                op: _,
                left,
                right,
                span,
            } => {
                let verdict = self
                    .classify_expr(left, env)?
                    .combine(self.classify_expr(right, env)?);
                if !verdict.is_graphable() {
                    return Ok(verdict);
                }
                let lhs = self.engine.infer_expr(left, env)?;
                let rhs = self.engine.infer_expr(right, env)?;
                Ok(self.classify_mixed_arithmetic(&lhs, &rhs, *span))
            }

            Expr::Call { op, args, .. } => {
                let mut verdict = Verdict::Graphable;
                for a in args {
                    verdict = verdict.combine(self.classify_expr(a, env)?);
                }
                if !verdict.is_graphable() {
                    return Ok(verdict);
                }
                let mut dtypes = Vec::with_capacity(args.len());
                for a in args {
                    let abstract_value = self.engine.infer_expr(a, env)?;
                    if matches!(abstract_value, AbstractValue::Unknown) {
                        // Nothing to resolve against yet; inference keeps
                        // the result Unknown.
                        return Ok(Verdict::Graphable);
                    }
                    match abstract_value.registry_dtype() {
                        Some(d) => dtypes.push(d),
                        None => {
                            return Ok(Verdict::RequiresFallback(FallbackReason::UnknownCallee(
                                op.clone(),
                            )))
                        }
                    }
                }
                match self.engine.registry().resolve(op, &dtypes) {
                    Ok(_) => Ok(Verdict::Graphable),
                    Err(crate::registry::RegistryError::NotFound(_)) => Ok(
                        Verdict::RequiresFallback(FallbackReason::UnknownCallee(op.clone())),
                    ),
                    // A registered operator with an invalid dtype
                    // combination is a genuine inference failure; let the
                    // engine raise it during lowering.
                    Err(crate::registry::RegistryError::InvalidSignature { .. }) => {
                        Ok(Verdict::Graphable)
                    }
                }
            }

            Expr::GetAttr { object, name, .. } => {
                let verdict = self.classify_expr(object, env)?;
                if !verdict.is_graphable() {
                    return Ok(verdict);
                }
                let obj = self.engine.infer_expr(object, env)?;
                if obj.contains_interpreted() {
                    return Ok(Verdict::RequiresFallback(
                        FallbackReason::InterpretedOperand,
                    ));
                }
                match self.engine.static_attr_name(name, env)? {
                    None => Ok(Verdict::RequiresFallback(
                        FallbackReason::UnresolvedAttributeName,
                    )),
                    Some(attr) => match obj.registry_dtype() {
                        Some(dtype) if self.engine.registry().supports(&attr, &[dtype]) => {
                            Ok(Verdict::Graphable)
                        }
                        _ => Ok(Verdict::RequiresFallback(
                            FallbackReason::NoGraphOperatorForAttribute(attr),
                        )),
                    },
                }
            }

            Expr::Tuple { elements, .. } => {
                let mut verdict = Verdict::Graphable;
                for e in elements {
                    verdict = verdict.combine(self.classify_expr(e, env)?);
                }
                Ok(verdict)
            }

            Expr::TupleGet { tuple, .. } => self.classify_expr(tuple, env),
        }
    }

    /// Mixed tensor/native arithmetic: graphable when one operand is
    /// convertible via an implicit cast, rejected otherwise.
    fn classify_mixed_arithmetic(
        &self,
        lhs: &AbstractValue,
        rhs: &AbstractValue,
        span: Span,
    ) -> Verdict {
        let (tensor_dtype, scalar_kind) = match (lhs, rhs) {
            (AbstractValue::Tensor { dtype, .. }, AbstractValue::Scalar { kind, .. })
            | (AbstractValue::Scalar { kind, .. }, AbstractValue::Tensor { dtype, .. }) => {
                (*dtype, *kind)
            }
            _ => return Verdict::Graphable,
        };
        if scalar_kind.is_numeric() && tensor_dtype.is_numeric() {
            Verdict::Graphable
        } else {
            Verdict::Rejected {
                construct: ConstructKind::Assignment,
                span,
                reason: RejectReason::NoImplicitCast {
                    left: lhs.to_string(),
                    right: rhs.to_string(),
                },
            }
        }
    }

    fn classify_if(
        &self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
        env: &AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        let cond_verdict = self.classify_expr(cond, env)?;
        if !cond_verdict.is_graphable() {
            return Ok(cond_verdict);
        }
        let cond_abstract = self.engine.infer_expr(cond, env)?;
        if !is_graph_condition(&cond_abstract) {
            return Ok(Verdict::RequiresFallback(FallbackReason::OpaqueCondition));
        }

        // Both branches must be individually graphable.
        let mut then_env = env.clone();
        let mut else_env = env.clone();
        let verdict = self
            .classify_block(then_body, &mut then_env)?
            .combine(self.classify_block(else_body, &mut else_env)?);
        Ok(verdict)
    }

    fn classify_while(
        &self,
        cond: &Expr,
        body: &[Stmt],
        _span: Span,
        env: &AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        let cond_verdict = self.classify_expr(cond, env)?;
        if !cond_verdict.is_graphable() {
            return Ok(cond_verdict);
        }
        let cond_abstract = self.engine.infer_expr(cond, env)?;
        if !matches!(
            cond_abstract,
            AbstractValue::Scalar {
                kind: ScalarKind::Bool,
                ..
            }
        ) {
            return Ok(Verdict::RequiresFallback(
                FallbackReason::WhileConditionNotScalarBool,
            ));
        }
        if nested_loop_has_early_exit(body) {
            return Ok(Verdict::RequiresFallback(FallbackReason::NestedEarlyExit));
        }
        let mut body_env = env.clone();
        self.classify_block(body, &mut body_env)
    }

    fn classify_for(
        &self,
        var: &str,
        iter: &Iterable,
        body: &[Stmt],
        span: Span,
        env: &AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        let element = match iter {
            Iterable::Range { bound, .. } => {
                let bound_verdict = self.classify_expr(bound, env)?;
                if let Verdict::Rejected { .. } = bound_verdict {
                    return Ok(bound_verdict);
                }
                let bound_abstract = self.engine.infer_expr(bound, env)?;
                match &bound_abstract {
                    AbstractValue::Tensor { .. } => {
                        // Hard rejection: the graph loop primitive cannot
                        // source a trip count from a runtime tensor.
                        return Ok(Verdict::Rejected {
                            construct: ConstructKind::ForLoop,
                            span,
                            reason: RejectReason::TensorValuedRangeBound,
                        });
                    }
                    AbstractValue::Scalar {
                        kind: ScalarKind::Int,
                        literal,
                    } => match literal {
                        Some(lit) => {
                            let n = lit.as_int().unwrap_or(0);
                            if n > MAX_STATIC_UNROLL as i64 {
                                return Ok(Verdict::RequiresFallback(
                                    FallbackReason::LoopBoundTooLarge(n),
                                ));
                            }
                        }
                        None => {
                            return Ok(Verdict::RequiresFallback(
                                FallbackReason::RangeBoundNotStatic,
                            ))
                        }
                    },
                    AbstractValue::Scalar { kind, .. } => {
                        return Ok(Verdict::Rejected {
                            construct: ConstructKind::ForLoop,
                            span,
                            reason: RejectReason::NonIntegerRangeBound(*kind),
                        });
                    }
                    AbstractValue::Interpreted => {
                        return Ok(Verdict::RequiresFallback(
                            FallbackReason::InterpretedOperand,
                        ))
                    }
                    AbstractValue::Unknown => {
                        return Ok(Verdict::RequiresFallback(
                            FallbackReason::RangeBoundNotStatic,
                        ))
                    }
                    AbstractValue::Sequence(_) | AbstractValue::Bottom => {
                        return Ok(Verdict::RequiresFallback(FallbackReason::UnknownIterable))
                    }
                }
                AbstractValue::scalar(ScalarKind::Int)
            }

            Iterable::Zip { seqs, .. } => {
                let mut verdict = Verdict::Graphable;
                for s in seqs {
                    verdict = verdict.combine(self.classify_expr(s, env)?);
                }
                if !verdict.is_graphable() {
                    return Ok(verdict);
                }
                for s in seqs {
                    let abstract_value = self.engine.infer_expr(s, env)?;
                    match abstract_value {
                        AbstractValue::Sequence(_) => {}
                        AbstractValue::Interpreted => {
                            return Ok(Verdict::RequiresFallback(
                                FallbackReason::InterpretedOperand,
                            ))
                        }
                        _ => {
                            return Ok(Verdict::RequiresFallback(
                                FallbackReason::UnknownIterable,
                            ))
                        }
                    }
                }
                AbstractValue::Unknown
            }

            Iterable::Seq { seq, .. } => {
                let verdict = self.classify_expr(seq, env)?;
                if !verdict.is_graphable() {
                    return Ok(verdict);
                }
                match self.engine.infer_expr(seq, env)? {
                    AbstractValue::Sequence(_) => AbstractValue::Unknown,
                    AbstractValue::Interpreted => {
                        return Ok(Verdict::RequiresFallback(
                            FallbackReason::InterpretedOperand,
                        ))
                    }
                    _ => {
                        return Ok(Verdict::RequiresFallback(FallbackReason::UnknownIterable))
                    }
                }
            }
        };

        if nested_loop_has_early_exit(body) {
            return Ok(Verdict::RequiresFallback(FallbackReason::NestedEarlyExit));
        }

        let mut body_env = env.clone();
        body_env.set(var, element);
        self.classify_block(body, &mut body_env)
    }

    /// Classify a statement block, evolving a scratch environment so later
    /// statements see the effects of earlier ones. The evolution here is
    /// conservative; the unroller recomputes precise abstracts for
    /// constructs that are actually lowered.
    pub fn classify_block(
        &self,
        stmts: &[Stmt],
        env: &mut AbstractEnv,
    ) -> Result<Verdict, InferenceError> {
        let mut verdict = Verdict::Graphable;
        for stmt in stmts {
            let v = self.classify_stmt(stmt, env)?;
            self.apply_approx_effect(stmt, &v, env)?;
            verdict = verdict.combine(v);
            if verdict.is_rejected() {
                return Ok(verdict);
            }
        }
        Ok(verdict)
    }

    fn apply_approx_effect(
        &self,
        stmt: &Stmt,
        verdict: &Verdict,
        env: &mut AbstractEnv,
    ) -> Result<(), InferenceError> {
        if matches!(verdict, Verdict::RequiresFallback(_)) {
            let mut assigned = Vec::new();
            stmt.collect_assigned(&mut assigned);
            for name in assigned {
                env.set(&name, AbstractValue::Interpreted);
            }
            return Ok(());
        }
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let abstract_value = self.engine.infer_expr(value, env)?;
                env.set(target, abstract_value);
            }
            Stmt::For { .. } | Stmt::While { .. } | Stmt::If { .. } => {
                let mut assigned = Vec::new();
                stmt.collect_assigned(&mut assigned);
                for name in assigned {
                    env.update(&name, AbstractValue::Unknown);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Return { .. } => {}
        }
        Ok(())
    }
}

/// A condition the graph can branch on: a scalar bool or a bool tensor.
fn is_graph_condition(value: &AbstractValue) -> bool {
    matches!(
        value,
        AbstractValue::Scalar {
            kind: ScalarKind::Bool,
            ..
        } | AbstractValue::Tensor {
            dtype: crate::lattice::DType::Bool,
            ..
        }
    )
}

/// True when a nested loop below this block contains break/continue. The
/// interaction of a nested early exit with outer-loop state merging is
/// handled conservatively: the outer construct falls back.
fn nested_loop_has_early_exit(body: &[Stmt]) -> bool {
    fn loop_body_has_exit(stmts: &[Stmt]) -> bool {
        stmts.iter().any(|s| match s {
            Stmt::Break(_) | Stmt::Continue(_) => true,
            Stmt::If {
                then_body,
                else_body,
                ..
            } => loop_body_has_exit(then_body) || loop_body_has_exit(else_body),
            // A deeper loop captures its own exits.
            _ => false,
        })
    }
    fn walk(stmts: &[Stmt]) -> bool {
        stmts.iter().any(|s| match s {
            Stmt::For { body, .. } | Stmt::While { body, .. } => {
                loop_body_has_exit(body) || walk(body)
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => walk(then_body) || walk(else_body),
            _ => false,
        })
    }
    walk(body)
}
