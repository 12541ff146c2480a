//! Lattice operations on abstract values.
//!
//! - join (⊔): least upper bound, used when control-flow paths merge
//! - meet (⊓): greatest lower bound, used to refine a value against an
//!   expectation
//! - is_subtype (⊑): containment of abstracted value sets
//!
//! `join` of incompatible kinds does not widen to `Unknown`: it returns
//! `Bottom`, the signal that the merge cannot stay in the graph. `Unknown`
//! only enters a join when one of the operands already is `Unknown`.

use super::types::{AbstractValue, Dim};

impl AbstractValue {
    /// Join operation (⊔): least upper bound of two abstracts.
    ///
    /// # Laws
    /// ```text
    /// join(a, a) = a
    /// join(a, b) = join(b, a)
    /// join(join(a, b), c) = join(a, join(b, c))
    /// join(Bottom, a) = a
    /// join(Unknown, a) = Unknown
    /// ```
    ///
    /// Tensors of equal rank unify per dimension (equal dims kept,
    /// differing dims become `Dim::Unknown`); a rank or dtype mismatch is
    /// `Bottom`. Scalars of different kinds are `Bottom`. Equal literals
    /// are kept, differing literals widen to the bare kind.
    pub fn join(&self, other: &AbstractValue) -> AbstractValue {
        match (self, other) {
            // Bottom is the identity element for join
            (AbstractValue::Bottom, t) | (t, AbstractValue::Bottom) => t.clone(),

            // Unknown is the absorbing element for join
            (AbstractValue::Unknown, _) | (_, AbstractValue::Unknown) => AbstractValue::Unknown,

            (
                AbstractValue::Scalar {
                    kind: ka,
                    literal: la,
                },
                AbstractValue::Scalar {
                    kind: kb,
                    literal: lb,
                },
            ) => {
                if ka != kb {
                    return AbstractValue::Bottom;
                }
                let literal = match (la, lb) {
                    (Some(a), Some(b)) if a == b => Some(a.clone()),
                    _ => None,
                };
                AbstractValue::Scalar { kind: *ka, literal }
            }

            (
                AbstractValue::Tensor {
                    dtype: da,
                    shape: sa,
                },
                AbstractValue::Tensor {
                    dtype: db,
                    shape: sb,
                },
            ) => {
                if da != db {
                    return AbstractValue::Bottom;
                }
                let shape = match (sa, sb) {
                    (Some(a), Some(b)) => {
                        if a.len() != b.len() {
                            // Rank mismatch cannot be expressed in the graph
                            return AbstractValue::Bottom;
                        }
                        Some(
                            a.iter()
                                .zip(b.iter())
                                .map(|(x, y)| if x == y { *x } else { Dim::Unknown })
                                .collect(),
                        )
                    }
                    _ => None,
                };
                AbstractValue::Tensor { dtype: *da, shape }
            }

            (AbstractValue::Sequence(a), AbstractValue::Sequence(b)) => {
                if a.len() != b.len() {
                    return AbstractValue::Bottom;
                }
                let mut elems = Vec::with_capacity(a.len());
                for (x, y) in a.iter().zip(b.iter()) {
                    let joined = x.join(y);
                    if joined.is_bottom() {
                        return AbstractValue::Bottom;
                    }
                    elems.push(joined);
                }
                AbstractValue::Sequence(elems)
            }

            (AbstractValue::Interpreted, AbstractValue::Interpreted) => {
                AbstractValue::Interpreted
            }

            // Mixed kinds (Scalar vs Tensor, Scalar vs Sequence, opaque vs
            // graph value, ...) have no common graph representation.
            _ => AbstractValue::Bottom,
        }
    }

    /// Meet operation (⊓): greatest lower bound of two abstracts.
    ///
    /// ```text
    /// meet(Unknown, a) = a
    /// meet(Bottom, a) = Bottom
    /// meet(int(3), int) = int(3)
    /// meet(int, float) = Bottom
    /// ```
    pub fn meet(&self, other: &AbstractValue) -> AbstractValue {
        match (self, other) {
            // Unknown is the identity element for meet
            (AbstractValue::Unknown, t) | (t, AbstractValue::Unknown) => t.clone(),

            // Bottom is the absorbing element for meet
            (AbstractValue::Bottom, _) | (_, AbstractValue::Bottom) => AbstractValue::Bottom,

            (
                AbstractValue::Scalar {
                    kind: ka,
                    literal: la,
                },
                AbstractValue::Scalar {
                    kind: kb,
                    literal: lb,
                },
            ) => {
                if ka != kb {
                    return AbstractValue::Bottom;
                }
                match (la, lb) {
                    (Some(a), Some(b)) => {
                        if a == b {
                            AbstractValue::Scalar {
                                kind: *ka,
                                literal: Some(a.clone()),
                            }
                        } else {
                            AbstractValue::Bottom
                        }
                    }
                    (Some(a), None) | (None, Some(a)) => AbstractValue::Scalar {
                        kind: *ka,
                        literal: Some(a.clone()),
                    },
                    (None, None) => AbstractValue::Scalar {
                        kind: *ka,
                        literal: None,
                    },
                }
            }

            (
                AbstractValue::Tensor {
                    dtype: da,
                    shape: sa,
                },
                AbstractValue::Tensor {
                    dtype: db,
                    shape: sb,
                },
            ) => {
                if da != db {
                    return AbstractValue::Bottom;
                }
                let shape = match (sa, sb) {
                    (Some(a), Some(b)) => {
                        if a.len() != b.len() {
                            return AbstractValue::Bottom;
                        }
                        let mut dims = Vec::with_capacity(a.len());
                        for (x, y) in a.iter().zip(b.iter()) {
                            let dim = match (x, y) {
                                (Dim::Unknown, d) | (d, Dim::Unknown) => *d,
                                (Dim::Known(m), Dim::Known(n)) => {
                                    if m == n {
                                        Dim::Known(*m)
                                    } else {
                                        return AbstractValue::Bottom;
                                    }
                                }
                            };
                            dims.push(dim);
                        }
                        Some(dims)
                    }
                    (Some(a), None) | (None, Some(a)) => Some(a.clone()),
                    (None, None) => None,
                };
                AbstractValue::Tensor { dtype: *da, shape }
            }

            (AbstractValue::Sequence(a), AbstractValue::Sequence(b)) => {
                if a.len() != b.len() {
                    return AbstractValue::Bottom;
                }
                let mut elems = Vec::with_capacity(a.len());
                for (x, y) in a.iter().zip(b.iter()) {
                    let met = x.meet(y);
                    if met.is_bottom() {
                        return AbstractValue::Bottom;
                    }
                    elems.push(met);
                }
                AbstractValue::Sequence(elems)
            }

            (AbstractValue::Interpreted, AbstractValue::Interpreted) => {
                AbstractValue::Interpreted
            }

            _ => AbstractValue::Bottom,
        }
    }

    /// Subtype relation (⊑): true iff every concrete value abstracted by
    /// `self` is also abstracted by `other`.
    pub fn is_subtype(&self, other: &AbstractValue) -> bool {
        match (self, other) {
            // Bottom is a subtype of everything
            (AbstractValue::Bottom, _) => true,

            // Everything is a subtype of Unknown
            (_, AbstractValue::Unknown) => true,

            (AbstractValue::Unknown, _) => false,

            (
                AbstractValue::Scalar {
                    kind: ka,
                    literal: la,
                },
                AbstractValue::Scalar {
                    kind: kb,
                    literal: lb,
                },
            ) => {
                ka == kb
                    && match (la, lb) {
                        (_, None) => true,
                        (Some(a), Some(b)) => a == b,
                        (None, Some(_)) => false,
                    }
            }

            (
                AbstractValue::Tensor {
                    dtype: da,
                    shape: sa,
                },
                AbstractValue::Tensor {
                    dtype: db,
                    shape: sb,
                },
            ) => {
                da == db
                    && match (sa, sb) {
                        (_, None) => true,
                        (None, Some(_)) => false,
                        (Some(a), Some(b)) => {
                            a.len() == b.len()
                                && a.iter().zip(b.iter()).all(|(x, y)| match (x, y) {
                                    (_, Dim::Unknown) => true,
                                    (Dim::Known(m), Dim::Known(n)) => m == n,
                                    (Dim::Unknown, Dim::Known(_)) => false,
                                })
                        }
                    }
            }

            (AbstractValue::Sequence(a), AbstractValue::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_subtype(y))
            }

            (AbstractValue::Interpreted, AbstractValue::Interpreted) => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lattice::types::{AbstractValue, DType, Dim, ScalarKind};

    #[test]
    fn test_join_idempotent() {
        let cases = [
            AbstractValue::int(42),
            AbstractValue::scalar(ScalarKind::Float),
            AbstractValue::tensor(DType::F32, &[2, 3]),
            AbstractValue::Sequence(vec![AbstractValue::int(1), AbstractValue::bool(true)]),
            AbstractValue::Interpreted,
            AbstractValue::Unknown,
            AbstractValue::Bottom,
        ];
        for v in &cases {
            assert_eq!(&v.join(v), v, "join({v}, {v}) must be {v}");
        }
    }

    #[test]
    fn test_join_commutative() {
        let a = AbstractValue::tensor(DType::F32, &[2, 3]);
        let b = AbstractValue::tensor(DType::F32, &[2, 4]);
        assert_eq!(a.join(&b), b.join(&a));

        let c = AbstractValue::int(7);
        let d = AbstractValue::scalar(ScalarKind::Int);
        assert_eq!(c.join(&d), d.join(&c));
    }

    #[test]
    fn test_join_associative() {
        let a = AbstractValue::int(1);
        let b = AbstractValue::int(2);
        let c = AbstractValue::scalar(ScalarKind::Int);
        assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn test_join_bottom_identity() {
        let t = AbstractValue::tensor(DType::I64, &[4]);
        assert_eq!(AbstractValue::Bottom.join(&t), t);
        assert_eq!(t.join(&AbstractValue::Bottom), t);
    }

    #[test]
    fn test_join_unknown_absorbing() {
        let t = AbstractValue::tensor(DType::I64, &[4]);
        assert_eq!(AbstractValue::Unknown.join(&t), AbstractValue::Unknown);
        assert_eq!(t.join(&AbstractValue::Unknown), AbstractValue::Unknown);
    }

    #[test]
    fn test_join_differing_literals_widen() {
        let result = AbstractValue::int(1).join(&AbstractValue::int(2));
        assert_eq!(result, AbstractValue::scalar(ScalarKind::Int));
    }

    #[test]
    fn test_join_scalar_kind_mismatch_is_bottom() {
        let int = AbstractValue::scalar(ScalarKind::Int);
        let float = AbstractValue::scalar(ScalarKind::Float);
        let boolean = AbstractValue::scalar(ScalarKind::Bool);
        assert!(int.join(&float).is_bottom());
        // Boolean is a distinct kind, never unified with integer
        assert!(int.join(&boolean).is_bottom());
    }

    #[test]
    fn test_join_tensor_per_dim_unification() {
        let a = AbstractValue::tensor(DType::F32, &[2, 3]);
        let b = AbstractValue::tensor(DType::F32, &[2, 5]);
        let joined = a.join(&b);
        assert_eq!(
            joined,
            AbstractValue::Tensor {
                dtype: DType::F32,
                shape: Some(vec![Dim::Known(2), Dim::Unknown]),
            }
        );
    }

    #[test]
    fn test_join_tensor_rank_mismatch_is_bottom() {
        let a = AbstractValue::tensor(DType::F32, &[2, 3]);
        let b = AbstractValue::tensor(DType::F32, &[2, 3, 1]);
        assert!(a.join(&b).is_bottom());
    }

    #[test]
    fn test_join_tensor_dtype_mismatch_is_bottom() {
        let a = AbstractValue::tensor(DType::F32, &[2]);
        let b = AbstractValue::tensor(DType::I64, &[2]);
        assert!(a.join(&b).is_bottom());
    }

    #[test]
    fn test_join_scalar_vs_sequence_is_bottom() {
        let scalar = AbstractValue::int(1);
        let seq = AbstractValue::Sequence(vec![AbstractValue::int(1)]);
        assert!(scalar.join(&seq).is_bottom());
    }

    #[test]
    fn test_join_sequence_length_mismatch_is_bottom() {
        let a = AbstractValue::Sequence(vec![AbstractValue::int(1)]);
        let b = AbstractValue::Sequence(vec![AbstractValue::int(1), AbstractValue::int(2)]);
        assert!(a.join(&b).is_bottom());
    }

    #[test]
    fn test_join_interpreted_with_tensor_is_bottom() {
        let t = AbstractValue::tensor(DType::F32, &[1]);
        assert!(AbstractValue::Interpreted.join(&t).is_bottom());
    }

    #[test]
    fn test_meet_literal_refines() {
        let lit = AbstractValue::int(3);
        let bare = AbstractValue::scalar(ScalarKind::Int);
        assert_eq!(lit.meet(&bare), lit);
        assert_eq!(bare.meet(&lit), lit);
    }

    #[test]
    fn test_meet_unknown_identity() {
        let t = AbstractValue::tensor(DType::F64, &[3]);
        assert_eq!(AbstractValue::Unknown.meet(&t), t);
    }

    #[test]
    fn test_meet_shape_refinement() {
        let known = AbstractValue::tensor(DType::F32, &[2, 3]);
        let partial = AbstractValue::Tensor {
            dtype: DType::F32,
            shape: Some(vec![Dim::Known(2), Dim::Unknown]),
        };
        assert_eq!(known.meet(&partial), known);
    }

    #[test]
    fn test_is_subtype_bottom_and_unknown() {
        let t = AbstractValue::tensor(DType::F32, &[2]);
        assert!(AbstractValue::Bottom.is_subtype(&t));
        assert!(t.is_subtype(&AbstractValue::Unknown));
        assert!(!AbstractValue::Unknown.is_subtype(&t));
    }

    #[test]
    fn test_is_subtype_literal_under_kind() {
        let lit = AbstractValue::int(3);
        let bare = AbstractValue::scalar(ScalarKind::Int);
        assert!(lit.is_subtype(&bare));
        assert!(!bare.is_subtype(&lit));
    }

    #[test]
    fn test_is_subtype_known_shape_under_unknown_dims() {
        let known = AbstractValue::tensor(DType::F32, &[2, 3]);
        let partial = AbstractValue::Tensor {
            dtype: DType::F32,
            shape: Some(vec![Dim::Known(2), Dim::Unknown]),
        };
        assert!(known.is_subtype(&partial));
        assert!(!partial.is_subtype(&known));
    }
}
