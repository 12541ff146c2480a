//! Function-body IR consumed by the graph-mode compiler.
//!
//! The IR is the already-parsed body of one traced function: straight-line
//! statements plus the control-flow constructs the classifier rules on.
//! Parsing the source language is out of scope; callers build this IR
//! programmatically and hand it to [`crate::compiler::Compiler::compile`].
//!
//! Every node carries a [`Span`] for diagnostics. All nodes are immutable
//! after construction.

use crate::runtime::ObjectHandle;
use crate::span::Span;
use serde::{Deserialize, Serialize};

/// A literal constant in the source program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Eq for Literal {}

impl std::hash::Hash for Literal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::Int(v) => v.hash(state),
            Literal::Float(v) => v.to_bits().hash(state),
            Literal::Bool(v) => v.hash(state),
            Literal::Str(v) => v.hash(state),
        }
    }
}

/// Binary operators available in traced function bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    /// True for comparison operators (result kind is boolean).
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }
}

/// An expression in a traced function body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal, Span),
    Var(String, Span),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    /// Call of a graph-native operator by name (resolved via the registry).
    Call {
        op: String,
        args: Vec<Expr>,
        span: Span,
    },
    /// `getattr(object, name)` where `name` is an arbitrary expression;
    /// graphable only when `name` folds to a static string.
    GetAttr {
        object: Box<Expr>,
        name: Box<Expr>,
        span: Span,
    },
    /// Fixed-length tuple construction.
    Tuple { elements: Vec<Expr>, span: Span },
    /// Positional element access into a tuple expression. Emitted by the
    /// unroller when lowering zip/tuple iteration.
    TupleGet {
        tuple: Box<Expr>,
        index: usize,
        span: Span,
    },
    /// A pre-existing interpreted object (e.g. a host-library array)
    /// captured by the traced function. Opaque to the graph.
    Opaque { object: ObjectHandle, span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal(_, span) | Expr::Var(_, span) => *span,
            Expr::Binary { span, .. }
            | Expr::Call { span, .. }
            | Expr::GetAttr { span, .. }
            | Expr::Tuple { span, .. }
            | Expr::TupleGet { span, .. }
            | Expr::Opaque { span, .. } => *span,
        }
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value), Span::synthetic())
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value), Span::synthetic())
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Literal::Bool(value), Span::synthetic())
    }

    pub fn str(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(value.into()), Span::synthetic())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into(), Span::synthetic())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            span: Span::synthetic(),
        }
    }

    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Add, left, right)
    }

    pub fn call(op: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            op: op.into(),
            args,
            span: Span::synthetic(),
        }
    }

    pub fn getattr(object: Expr, name: Expr) -> Self {
        Expr::GetAttr {
            object: Box::new(object),
            name: Box::new(name),
            span: Span::synthetic(),
        }
    }

    pub fn tuple(elements: Vec<Expr>) -> Self {
        Expr::Tuple {
            elements,
            span: Span::synthetic(),
        }
    }

    /// Collect variable names read by this expression, in first-use order.
    pub fn collect_used(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(..) | Expr::Opaque { .. } => {}
            Expr::Var(name, _) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Binary { left, right, .. } => {
                left.collect_used(out);
                right.collect_used(out);
            }
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_used(out);
                }
            }
            Expr::GetAttr { object, name, .. } => {
                object.collect_used(out);
                name.collect_used(out);
            }
            Expr::Tuple { elements, .. } => {
                for e in elements {
                    e.collect_used(out);
                }
            }
            Expr::TupleGet { tuple, .. } => tuple.collect_used(out),
        }
    }
}

/// The iterable of a `for` loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Iterable {
    /// `range(bound)` with an exclusive upper bound expression.
    Range { bound: Expr, span: Span },
    /// `zip(seqs...)` over fixed-length tuples. With a single sequence the
    /// loop variable binds the elements directly; with several it binds a
    /// tuple of the positional elements.
    Zip { seqs: Vec<Expr>, span: Span },
    /// Direct iteration over a fixed-length tuple expression.
    Seq { seq: Expr, span: Span },
}

impl Iterable {
    pub fn span(&self) -> Span {
        match self {
            Iterable::Range { span, .. }
            | Iterable::Zip { span, .. }
            | Iterable::Seq { span, .. } => *span,
        }
    }

    fn collect_used(&self, out: &mut Vec<String>) {
        match self {
            Iterable::Range { bound, .. } => bound.collect_used(out),
            Iterable::Zip { seqs, .. } => {
                for s in seqs {
                    s.collect_used(out);
                }
            }
            Iterable::Seq { seq, .. } => seq.collect_used(out),
        }
    }
}

/// A statement in a traced function body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stmt {
    Assign {
        target: String,
        value: Expr,
        span: Span,
    },
    For {
        var: String,
        iter: Iterable,
        body: Vec<Stmt>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    Break(Span),
    Continue(Span),
    Return { value: Option<Expr>, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assign { span, .. }
            | Stmt::For { span, .. }
            | Stmt::While { span, .. }
            | Stmt::If { span, .. }
            | Stmt::Return { span, .. } => *span,
            Stmt::Break(span) | Stmt::Continue(span) => *span,
        }
    }

    pub fn assign(target: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            target: target.into(),
            value,
            span: Span::synthetic(),
        }
    }

    pub fn ret(value: Expr) -> Self {
        Stmt::Return {
            value: Some(value),
            span: Span::synthetic(),
        }
    }

    /// `for var in range(bound)`.
    pub fn for_range(var: impl Into<String>, bound: Expr, body: Vec<Stmt>) -> Self {
        Stmt::For {
            var: var.into(),
            iter: Iterable::Range {
                bound,
                span: Span::synthetic(),
            },
            body,
            span: Span::synthetic(),
        }
    }

    /// `for var in zip(seq)`.
    pub fn for_zip(var: impl Into<String>, seqs: Vec<Expr>, body: Vec<Stmt>) -> Self {
        Stmt::For {
            var: var.into(),
            iter: Iterable::Zip {
                seqs,
                span: Span::synthetic(),
            },
            body,
            span: Span::synthetic(),
        }
    }

    /// Collect variable names this statement (transitively) assigns.
    pub fn collect_assigned(&self, out: &mut Vec<String>) {
        match self {
            Stmt::Assign { target, .. } => {
                if !out.contains(target) {
                    out.push(target.clone());
                }
            }
            Stmt::For { var, body, .. } => {
                if !out.contains(var) {
                    out.push(var.clone());
                }
                for s in body {
                    s.collect_assigned(out);
                }
            }
            Stmt::While { body, .. } => {
                for s in body {
                    s.collect_assigned(out);
                }
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                for s in then_body.iter().chain(else_body.iter()) {
                    s.collect_assigned(out);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) | Stmt::Return { .. } => {}
        }
    }

    /// Collect variable names this statement (transitively) reads.
    pub fn collect_used(&self, out: &mut Vec<String>) {
        match self {
            Stmt::Assign { value, .. } => value.collect_used(out),
            Stmt::For { iter, body, .. } => {
                iter.collect_used(out);
                for s in body {
                    s.collect_used(out);
                }
            }
            Stmt::While { cond, body, .. } => {
                cond.collect_used(out);
                for s in body {
                    s.collect_used(out);
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                cond.collect_used(out);
                for s in then_body.iter().chain(else_body.iter()) {
                    s.collect_used(out);
                }
            }
            Stmt::Return { value, .. } => {
                if let Some(v) = value {
                    v.collect_used(out);
                }
            }
            Stmt::Break(_) | Stmt::Continue(_) => {}
        }
    }
}

/// Kind of syntactic construct, as named by verdicts and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstructKind {
    ForLoop,
    WhileLoop,
    If,
    AttributeAccess,
    Call,
    Assignment,
    Return,
    Jump,
}

impl std::fmt::Display for ConstructKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConstructKind::ForLoop => "for loop",
            ConstructKind::WhileLoop => "while loop",
            ConstructKind::If => "if statement",
            ConstructKind::AttributeAccess => "attribute access",
            ConstructKind::Call => "operator call",
            ConstructKind::Assignment => "assignment",
            ConstructKind::Return => "return statement",
            ConstructKind::Jump => "break or continue",
        };
        write!(f, "{name}")
    }
}

impl Stmt {
    /// The construct kind this statement classifies as.
    pub fn construct_kind(&self) -> ConstructKind {
        match self {
            Stmt::Assign { .. } => ConstructKind::Assignment,
            Stmt::For { .. } => ConstructKind::ForLoop,
            Stmt::While { .. } => ConstructKind::WhileLoop,
            Stmt::If { .. } => ConstructKind::If,
            Stmt::Return { .. } => ConstructKind::Return,
            Stmt::Break(_) | Stmt::Continue(_) => ConstructKind::Jump,
        }
    }
}

/// The body of one traced function, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionBody {
    pub name: String,
    pub params: Vec<String>,
    pub stmts: Vec<Stmt>,
}

impl FunctionBody {
    pub fn new(name: impl Into<String>, params: Vec<&str>, stmts: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().map(str::to_string).collect(),
            stmts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_assigned_recurses_into_loops() {
        let body = Stmt::for_range(
            "i",
            Expr::int(3),
            vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x")))],
        );
        let mut assigned = Vec::new();
        body.collect_assigned(&mut assigned);
        assert_eq!(assigned, vec!["i".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_collect_used_dedupes() {
        let stmt = Stmt::assign("z", Expr::add(Expr::var("x"), Expr::var("x")));
        let mut used = Vec::new();
        stmt.collect_used(&mut used);
        assert_eq!(used, vec!["x".to_string()]);
    }

    #[test]
    fn test_break_and_continue_classify_as_jumps() {
        assert_eq!(
            Stmt::Break(Span::synthetic()).construct_kind(),
            ConstructKind::Jump
        );
        assert_eq!(
            Stmt::Continue(Span::synthetic()).construct_kind(),
            ConstructKind::Jump
        );
        assert_eq!(ConstructKind::Jump.to_string(), "break or continue");
    }

    #[test]
    fn test_spans_default_to_synthetic() {
        let e = Expr::add(Expr::int(1), Expr::int(2));
        assert_eq!(e.span(), Span::synthetic());
    }
}
