//! Type/shape inference engine.
//!
//! [`InferenceEngine::infer_expr`] computes the output [`AbstractValue`] of
//! an expression given the abstracts of its inputs. It is a pure function
//! of its inputs: deterministic, side-effect free, and terminating (loop
//! bodies are bounded by the unroller, never by this engine recursing).
//!
//! Operator calls are validated against the operator registry; dtype and
//! rank mismatches surface as [`InferenceError`]s tagged with the
//! offending span.

pub mod env;

pub use env::AbstractEnv;

use crate::error::{InferenceError, InferenceReason};
use crate::ir::{BinaryOp, Expr, Literal};
use crate::lattice::{AbstractValue, DType, Dim, ScalarKind, ScalarLiteral};
use crate::registry::{OpRegistry, RegistryError};
use crate::span::Span;

/// Inference over one expression tree.
#[derive(Clone, Copy)]
pub struct InferenceEngine<'r> {
    registry: &'r dyn OpRegistry,
}

impl std::fmt::Debug for InferenceEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine").finish_non_exhaustive()
    }
}

impl<'r> InferenceEngine<'r> {
    pub fn new(registry: &'r dyn OpRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'r dyn OpRegistry {
        self.registry
    }

    /// Infer the abstract value of `expr` under `env`.
    pub fn infer_expr(
        &self,
        expr: &Expr,
        env: &AbstractEnv,
    ) -> Result<AbstractValue, InferenceError> {
        match expr {
            Expr::Literal(lit, _) => Ok(literal_abstract(lit)),

            Expr::Var(name, span) => env.get(name).cloned().ok_or_else(|| {
                InferenceError::new(*span, InferenceReason::UnknownVariable(name.clone()))
            }),

            Expr::Binary {
                op,
                left,
                right,
                span,
            } => {
                let lhs = self.infer_expr(left, env)?;
                let rhs = self.infer_expr(right, env)?;
                self.infer_binary(*op, &lhs, &rhs, *span)
            }

            Expr::Call { op, args, span } => {
                let mut abstracts = Vec::with_capacity(args.len());
                for a in args {
                    abstracts.push(self.infer_expr(a, env)?);
                }
                self.infer_call(op, &abstracts, *span)
            }

            Expr::GetAttr { object, name, span } => {
                let obj = self.infer_expr(object, env)?;
                let name_abstract = self.infer_expr(name, env)?;
                self.infer_getattr(&obj, &name_abstract, *span)
            }

            Expr::Tuple { elements, .. } => {
                let mut abstracts = Vec::with_capacity(elements.len());
                for e in elements {
                    abstracts.push(self.infer_expr(e, env)?);
                }
                Ok(AbstractValue::Sequence(abstracts))
            }

            Expr::TupleGet { tuple, index, span } => {
                match self.infer_expr(tuple, env)? {
                    AbstractValue::Sequence(elems) => {
                        elems.get(*index).cloned().ok_or_else(|| {
                            InferenceError::new(
                                *span,
                                InferenceReason::TupleIndexOutOfBounds {
                                    index: *index,
                                    len: elems.len(),
                                },
                            )
                        })
                    }
                    AbstractValue::Unknown => Ok(AbstractValue::Unknown),
                    AbstractValue::Interpreted => Ok(AbstractValue::Interpreted),
                    other => Err(InferenceError::new(
                        *span,
                        InferenceReason::InvalidOperand(other.to_string()),
                    )),
                }
            }

            Expr::Opaque { .. } => Ok(AbstractValue::Interpreted),
        }
    }

    /// Infer a binary operation over already-inferred operand abstracts.
    pub fn infer_binary(
        &self,
        op: BinaryOp,
        lhs: &AbstractValue,
        rhs: &AbstractValue,
        span: Span,
    ) -> Result<AbstractValue, InferenceError> {
        use AbstractValue as A;

        // Opaque operands keep the whole expression opaque; the classifier
        // routes it to interpreted execution.
        if lhs.contains_interpreted() || rhs.contains_interpreted() {
            return Ok(A::Interpreted);
        }
        if matches!(lhs, A::Unknown) || matches!(rhs, A::Unknown) {
            return Ok(A::Unknown);
        }

        match (lhs, rhs) {
            (
                A::Scalar {
                    kind: ka,
                    literal: la,
                },
                A::Scalar {
                    kind: kb,
                    literal: lb,
                },
            ) => self.infer_scalar_binary(op, *ka, la.as_ref(), *kb, lb.as_ref(), span),

            (
                A::Tensor {
                    dtype: da,
                    shape: sa,
                },
                A::Tensor {
                    dtype: db,
                    shape: sb,
                },
            ) => {
                if da != db {
                    return Err(InferenceError::new(
                        span,
                        InferenceReason::DtypeMismatch {
                            left: *da,
                            right: *db,
                        },
                    ));
                }
                let shape = unify_shapes(sa.as_deref(), sb.as_deref(), span)?;
                let dtype = if op.is_comparison() { DType::Bool } else { *da };
                Ok(A::Tensor { dtype, shape })
            }

            // Mixed tensor/native-scalar arithmetic via implicit cast.
            (A::Tensor { dtype, shape }, A::Scalar { kind, .. })
            | (A::Scalar { kind, .. }, A::Tensor { dtype, shape }) => {
                let castable = kind.is_numeric() && dtype.is_numeric();
                if !castable {
                    return Err(InferenceError::new(
                        span,
                        InferenceReason::InvalidOperand(format!(
                            "{kind} scalar with {dtype} tensor"
                        )),
                    ));
                }
                let dtype = if op.is_comparison() { DType::Bool } else { *dtype };
                Ok(A::Tensor {
                    dtype,
                    shape: shape.clone(),
                })
            }

            (a, b) => {
                let bad = if matches!(a, A::Sequence(_) | A::Bottom) { a } else { b };
                Err(InferenceError::new(
                    span,
                    InferenceReason::InvalidOperand(bad.to_string()),
                ))
            }
        }
    }

    fn infer_scalar_binary(
        &self,
        op: BinaryOp,
        ka: ScalarKind,
        la: Option<&ScalarLiteral>,
        kb: ScalarKind,
        lb: Option<&ScalarLiteral>,
        span: Span,
    ) -> Result<AbstractValue, InferenceError> {
        // String concatenation is the one non-numeric scalar operation the
        // graph understands; it feeds static attribute-name resolution.
        if ka == ScalarKind::Str || kb == ScalarKind::Str {
            if ka != kb || op != BinaryOp::Add {
                return Err(InferenceError::new(
                    span,
                    InferenceReason::InvalidOperand(format!("{ka} {op:?} {kb}")),
                ));
            }
            let literal = match (la, lb) {
                (Some(ScalarLiteral::Str(a)), Some(ScalarLiteral::Str(b))) => {
                    Some(ScalarLiteral::Str(format!("{a}{b}")))
                }
                _ => None,
            };
            return Ok(AbstractValue::Scalar {
                kind: ScalarKind::Str,
                literal,
            });
        }

        if op.is_comparison() {
            let literal = match (la, lb) {
                (Some(a), Some(b)) if ka == kb => fold_comparison(op, a, b),
                _ => None,
            };
            return Ok(AbstractValue::Scalar {
                kind: ScalarKind::Bool,
                literal,
            });
        }

        if !ka.is_numeric() || !kb.is_numeric() {
            return Err(InferenceError::new(
                span,
                InferenceReason::InvalidOperand(format!("{ka} {op:?} {kb}")),
            ));
        }

        // True division always yields float; other ops promote int to
        // float when either side is float.
        let kind = if op == BinaryOp::Div
            || ka == ScalarKind::Float
            || kb == ScalarKind::Float
        {
            ScalarKind::Float
        } else {
            ScalarKind::Int
        };

        let literal = match (la, lb) {
            (Some(a), Some(b)) => fold_arithmetic(op, a, b),
            _ => None,
        };
        Ok(AbstractValue::Scalar { kind, literal })
    }

    /// Infer a graph-native operator call over operand abstracts.
    pub fn infer_call(
        &self,
        op: &str,
        args: &[AbstractValue],
        span: Span,
    ) -> Result<AbstractValue, InferenceError> {
        if args.iter().any(AbstractValue::contains_interpreted) {
            return Ok(AbstractValue::Interpreted);
        }
        if args.iter().any(|a| matches!(a, AbstractValue::Unknown)) {
            return Ok(AbstractValue::Unknown);
        }

        let mut dtypes = Vec::with_capacity(args.len());
        for a in args {
            match a.registry_dtype() {
                Some(d) => dtypes.push(d),
                None => {
                    return Err(InferenceError::new(
                        span,
                        InferenceReason::InvalidOperand(a.to_string()),
                    ))
                }
            }
        }

        let outputs = self.registry.resolve(op, &dtypes).map_err(|e| match e {
            RegistryError::NotFound(name) => {
                InferenceError::new(span, InferenceReason::UnknownOperator(name))
            }
            RegistryError::InvalidSignature { op, inputs } => {
                InferenceError::new(span, InferenceReason::InvalidOperatorSignature { op, inputs })
            }
        })?;
        let out_dtype = *outputs.first().ok_or_else(|| {
            InferenceError::new(span, InferenceReason::UnknownOperator(op.to_string()))
        })?;

        // Tensor inputs keep tensor-ness; pure scalar calls stay scalar.
        let mut tensor_shape: Option<Option<Vec<Dim>>> = None;
        for a in args {
            if let AbstractValue::Tensor { shape, .. } = a {
                tensor_shape = Some(match tensor_shape {
                    None => shape.clone(),
                    Some(acc) => unify_shapes(acc.as_deref(), shape.as_deref(), span)?,
                });
            }
        }

        match tensor_shape {
            Some(shape) => Ok(AbstractValue::Tensor {
                dtype: out_dtype,
                shape,
            }),
            None => Ok(AbstractValue::Scalar {
                kind: dtype_scalar_kind(out_dtype),
                literal: None,
            }),
        }
    }

    /// Infer `getattr(object, name)`. A statically-resolvable name naming
    /// a registered operator behaves exactly like a direct call of that
    /// operator; anything else is opaque to the graph.
    pub fn infer_getattr(
        &self,
        object: &AbstractValue,
        name: &AbstractValue,
        span: Span,
    ) -> Result<AbstractValue, InferenceError> {
        if object.contains_interpreted() {
            return Ok(AbstractValue::Interpreted);
        }
        let Some(attr) = name.as_static_str() else {
            return Ok(AbstractValue::Interpreted);
        };
        match object.registry_dtype() {
            Some(dtype) if self.registry.supports(attr, &[dtype]) => {
                self.infer_call(attr, std::slice::from_ref(object), span)
            }
            _ => Ok(AbstractValue::Interpreted),
        }
    }

    /// Resolve an attribute-name expression to a static string, if the
    /// expression folds to a string literal (including constant
    /// concatenation).
    pub fn static_attr_name(
        &self,
        name: &Expr,
        env: &AbstractEnv,
    ) -> Result<Option<String>, InferenceError> {
        let abstract_name = self.infer_expr(name, env)?;
        Ok(abstract_name.as_static_str().map(str::to_string))
    }
}

/// The abstract of a source literal.
pub fn literal_abstract(lit: &Literal) -> AbstractValue {
    match lit {
        Literal::Int(v) => AbstractValue::int(*v),
        Literal::Float(v) => AbstractValue::float(*v),
        Literal::Bool(v) => AbstractValue::bool(*v),
        Literal::Str(v) => AbstractValue::str(v.clone()),
    }
}

fn dtype_scalar_kind(dtype: DType) -> ScalarKind {
    match dtype {
        DType::I32 | DType::I64 => ScalarKind::Int,
        DType::F32 | DType::F64 => ScalarKind::Float,
        DType::Bool => ScalarKind::Bool,
    }
}

/// Positional shape unification for elementwise operations. Rank mismatch
/// is an inference failure; a differing known dimension degrades to
/// `Dim::Unknown` (the merge policy of the lattice).
fn unify_shapes(
    a: Option<&[Dim]>,
    b: Option<&[Dim]>,
    span: Span,
) -> Result<Option<Vec<Dim>>, InferenceError> {
    match (a, b) {
        (Some(x), Some(y)) => {
            if x.len() != y.len() {
                return Err(InferenceError::new(
                    span,
                    InferenceReason::RankMismatch {
                        left: x.len(),
                        right: y.len(),
                    },
                ));
            }
            Ok(Some(
                x.iter()
                    .zip(y.iter())
                    .map(|(m, n)| if m == n { *m } else { Dim::Unknown })
                    .collect(),
            ))
        }
        _ => Ok(None),
    }
}

fn fold_arithmetic(op: BinaryOp, a: &ScalarLiteral, b: &ScalarLiteral) -> Option<ScalarLiteral> {
    use ScalarLiteral as L;
    match (a, b) {
        (L::Int(x), L::Int(y)) => match op {
            BinaryOp::Add => x.checked_add(*y).map(L::Int),
            BinaryOp::Sub => x.checked_sub(*y).map(L::Int),
            BinaryOp::Mul => x.checked_mul(*y).map(L::Int),
            BinaryOp::Div => {
                if *y == 0 {
                    None
                } else {
                    Some(L::Float(*x as f64 / *y as f64))
                }
            }
            _ => None,
        },
        (L::Float(x), L::Float(y)) => match op {
            BinaryOp::Add => Some(L::Float(x + y)),
            BinaryOp::Sub => Some(L::Float(x - y)),
            BinaryOp::Mul => Some(L::Float(x * y)),
            BinaryOp::Div => Some(L::Float(x / y)),
            _ => None,
        },
        (L::Int(x), L::Float(y)) => fold_arithmetic(op, &L::Float(*x as f64), &L::Float(*y)),
        (L::Float(x), L::Int(y)) => fold_arithmetic(op, &L::Float(*x), &L::Float(*y as f64)),
        _ => None,
    }
}

fn fold_comparison(op: BinaryOp, a: &ScalarLiteral, b: &ScalarLiteral) -> Option<ScalarLiteral> {
    use ScalarLiteral as L;
    let ord = match (a, b) {
        (L::Int(x), L::Int(y)) => x.partial_cmp(y),
        (L::Float(x), L::Float(y)) => x.partial_cmp(y),
        (L::Bool(x), L::Bool(y)) => x.partial_cmp(y),
        _ => None,
    }?;
    let result = match op {
        BinaryOp::Lt => ord.is_lt(),
        BinaryOp::Le => ord.is_le(),
        BinaryOp::Gt => ord.is_gt(),
        BinaryOp::Ge => ord.is_ge(),
        BinaryOp::Eq => ord.is_eq(),
        BinaryOp::Ne => ord.is_ne(),
        _ => return None,
    };
    Some(L::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::AbstractValue as A;
    use crate::registry::BuiltinRegistry;

    fn engine(registry: &BuiltinRegistry) -> InferenceEngine<'_> {
        InferenceEngine::new(registry)
    }

    #[test]
    fn test_literal_arithmetic_folds() {
        let registry = BuiltinRegistry::new();
        let env = AbstractEnv::new();
        let expr = Expr::add(Expr::int(2), Expr::int(1));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::int(3));
    }

    #[test]
    fn test_string_concat_folds_to_static_str() {
        let registry = BuiltinRegistry::new();
        let env = AbstractEnv::new();
        let expr = Expr::add(Expr::str("a"), Expr::str("bs"));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result.as_static_str(), Some("abs"));
    }

    #[test]
    fn test_tensor_scalar_mixed_arithmetic_casts() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::F32, &[2, 2]));
        let expr = Expr::add(Expr::var("t"), Expr::int(1));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::tensor(DType::F32, &[2, 2]));
    }

    #[test]
    fn test_tensor_str_arithmetic_fails() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::F32, &[2]));
        let expr = Expr::add(Expr::var("t"), Expr::str("x"));
        let err = engine(&registry).infer_expr(&expr, &env).unwrap_err();
        assert!(matches!(err.reason, InferenceReason::InvalidOperand(_)));
    }

    #[test]
    fn test_tensor_rank_mismatch_fails() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("a", A::tensor(DType::F32, &[2]));
        env.set("b", A::tensor(DType::F32, &[2, 2]));
        let expr = Expr::add(Expr::var("a"), Expr::var("b"));
        let err = engine(&registry).infer_expr(&expr, &env).unwrap_err();
        assert!(matches!(
            err.reason,
            InferenceReason::RankMismatch { left: 1, right: 2 }
        ));
    }

    #[test]
    fn test_tensor_dtype_mismatch_fails() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("a", A::tensor(DType::F32, &[2]));
        env.set("b", A::tensor(DType::I64, &[2]));
        let expr = Expr::add(Expr::var("a"), Expr::var("b"));
        let err = engine(&registry).infer_expr(&expr, &env).unwrap_err();
        assert!(matches!(err.reason, InferenceReason::DtypeMismatch { .. }));
    }

    #[test]
    fn test_comparison_yields_bool() {
        let registry = BuiltinRegistry::new();
        let env = AbstractEnv::new();
        let expr = Expr::binary(BinaryOp::Lt, Expr::int(1), Expr::int(2));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::bool(true));
    }

    #[test]
    fn test_call_resolves_through_registry() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::I32, &[3]));
        let expr = Expr::call("abs", vec![Expr::var("t")]);
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::tensor(DType::I32, &[3]));
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::I32, &[3]));
        let expr = Expr::call("conv3d", vec![Expr::var("t")]);
        let err = engine(&registry).infer_expr(&expr, &env).unwrap_err();
        assert!(matches!(err.reason, InferenceReason::UnknownOperator(_)));
    }

    #[test]
    fn test_interpreted_operand_stays_opaque() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("o", A::Interpreted);
        let expr = Expr::add(Expr::var("o"), Expr::int(1));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::Interpreted);
    }

    #[test]
    fn test_getattr_static_name_matches_call() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("x", A::tensor(DType::I32, &[2]));

        let concat = Expr::getattr(Expr::var("x"), Expr::add(Expr::str("a"), Expr::str("bs")));
        let literal = Expr::getattr(Expr::var("x"), Expr::str("abs"));
        let via_call = Expr::call("abs", vec![Expr::var("x")]);

        let e = engine(&registry);
        let a = e.infer_expr(&concat, &env).unwrap();
        let b = e.infer_expr(&literal, &env).unwrap();
        let c = e.infer_expr(&via_call, &env).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_getattr_unresolvable_name_is_opaque() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("x", A::tensor(DType::I32, &[2]));
        env.set("n", A::scalar(ScalarKind::Str));
        let expr = Expr::getattr(Expr::var("x"), Expr::var("n"));
        let result = engine(&registry).infer_expr(&expr, &env).unwrap();
        assert_eq!(result, A::Interpreted);
    }

    #[test]
    fn test_infer_is_deterministic() {
        let registry = BuiltinRegistry::new();
        let mut env = AbstractEnv::new();
        env.set("t", A::tensor(DType::F64, &[4, 4]));
        let expr = Expr::call("mul", vec![Expr::var("t"), Expr::var("t")]);
        let e = engine(&registry);
        assert_eq!(
            e.infer_expr(&expr, &env).unwrap(),
            e.infer_expr(&expr, &env).unwrap()
        );
    }
}
