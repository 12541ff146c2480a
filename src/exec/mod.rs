//! Region executor.
//!
//! Runs a [`CompiledFunction`] over concrete values. Graph regions and
//! interpreted regions share one evaluator; the difference is that the
//! interpreted side may hold opaque objects and projects them on use,
//! while the graph side requires every value to be graph-native. At a
//! `ToInterpreted` boundary the live graph values are materialized as
//! runtime objects; at a `ToGraph` boundary the live interpreted objects
//! are projected once so the following graph region never sees a handle.

pub mod value;

use crate::compiler::CompiledFunction;
use crate::error::ConversionError;
use crate::extract::{BoundaryDirection, BoundaryNode, Region, RegionMode};
use crate::ir::{BinaryOp, Expr, Iterable, Stmt};
use crate::lattice::DType;
use crate::runtime::OpaqueRuntime;
use std::collections::HashMap;
use thiserror::Error;
use value::{TensorValue, Value};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("variable '{0}' is not defined")]
    UndefinedVariable(String),
    #[error("operator '{op}' does not apply to {left} and {right}")]
    InvalidOperands {
        op: &'static str,
        left: String,
        right: String,
    },
    #[error("'{0}' is not an executable operator")]
    UnknownOperator(String),
    #[error("tuple index {index} out of bounds for length {len}")]
    TupleIndexOutOfBounds { index: usize, len: usize },
    #[error("condition evaluated to {0}, expected bool")]
    NonBoolCondition(String),
    #[error("range bound evaluated to {0}, expected an integer")]
    NonIntegerBound(String),
    #[error("opaque object reached a graph region")]
    ObjectInGraphRegion,
    #[error("expected {expected} arguments, got {given}")]
    ArityMismatch { expected: usize, given: usize },
    #[error("tensor shapes {0:?} and {1:?} do not align")]
    ShapeMismatch(Vec<u64>, Vec<u64>),
}

/// Control-flow signal threaded through block evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Option<Value>),
}

pub struct Executor<'a> {
    runtime: &'a dyn OpaqueRuntime,
}

impl std::fmt::Debug for Executor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl<'a> Executor<'a> {
    pub fn new(runtime: &'a dyn OpaqueRuntime) -> Self {
        Self { runtime }
    }

    /// Run a compiled function over concrete arguments. Returns the value
    /// of the first `return` hit, or `None` when the body falls off the
    /// end.
    pub fn run(
        &self,
        compiled: &CompiledFunction,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ExecError> {
        if args.len() != compiled.params.len() {
            return Err(ExecError::ArityMismatch {
                expected: compiled.params.len(),
                given: args.len(),
            });
        }
        let mut env: HashMap<String, Value> = compiled
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect();

        for (i, region) in compiled.plan.regions.iter().enumerate() {
            if i > 0 {
                if let Some(boundary) = compiled.plan.boundaries.get(i - 1) {
                    self.cross_boundary(boundary, &mut env)?;
                }
            }
            match self.run_region(region, &mut env)? {
                Flow::Return(value) => return Ok(value),
                _ => continue,
            }
        }
        Ok(None)
    }

    fn cross_boundary(
        &self,
        boundary: &BoundaryNode,
        env: &mut HashMap<String, Value>,
    ) -> Result<(), ExecError> {
        match boundary.direction {
            // Interpreter results come back as graph values.
            BoundaryDirection::ToGraph => {
                for var in &boundary.live {
                    if let Some(Value::Object(handle)) = env.get(&var.name) {
                        let projected = self.runtime.project(*handle)?;
                        env.insert(var.name.clone(), projected);
                    }
                }
            }
            // Graph values enter the interpreter as runtime objects;
            // uses inside the region unwrap them on demand.
            BoundaryDirection::ToInterpreted => {
                for var in &boundary.live {
                    let concrete = match env.get(&var.name) {
                        Some(Value::Object(_)) | None => continue,
                        Some(value) => value.clone(),
                    };
                    let handle = self.runtime.materialize(&concrete)?;
                    env.insert(var.name.clone(), Value::Object(handle));
                }
            }
        }
        Ok(())
    }

    fn run_region(
        &self,
        region: &Region,
        env: &mut HashMap<String, Value>,
    ) -> Result<Flow, ExecError> {
        let interpreted = region.mode == RegionMode::Interpreted;
        self.eval_block(&region.stmts, env, interpreted)
    }

    fn eval_block(
        &self,
        stmts: &[Stmt],
        env: &mut HashMap<String, Value>,
        interpreted: bool,
    ) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match stmt {
                Stmt::Assign { target, value, .. } => {
                    let v = self.eval_expr(value, env, interpreted)?;
                    env.insert(target.clone(), v);
                }
                Stmt::Break(_) => return Ok(Flow::Break),
                Stmt::Continue(_) => return Ok(Flow::Continue),
                Stmt::Return { value, .. } => {
                    let v = match value {
                        Some(expr) => {
                            let v = self.eval_expr(expr, env, interpreted)?;
                            // Results leave the function as concrete
                            // values, never as handles.
                            Some(self.deref(v, interpreted)?)
                        }
                        None => None,
                    };
                    return Ok(Flow::Return(v));
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                    ..
                } => {
                    let taken = if self.eval_condition(cond, env, interpreted)? {
                        then_body
                    } else {
                        else_body
                    };
                    match self.eval_block(taken, env, interpreted)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                Stmt::While { cond, body, .. } => {
                    while self.eval_condition(cond, env, interpreted)? {
                        match self.eval_block(body, env, interpreted)? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break,
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                    }
                }
                Stmt::For { var, iter, body, .. } => {
                    let items = self.iterate(iter, env, interpreted)?;
                    for item in items {
                        env.insert(var.clone(), item);
                        match self.eval_block(body, env, interpreted)? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break,
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                    }
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn iterate(
        &self,
        iter: &Iterable,
        env: &mut HashMap<String, Value>,
        interpreted: bool,
    ) -> Result<Vec<Value>, ExecError> {
        match iter {
            Iterable::Range { bound, .. } => {
                let bound = self.eval_expr(bound, env, interpreted)?;
                let bound = self.deref(bound, interpreted)?;
                let n = match &bound {
                    Value::Int(n) => *n,
                    Value::Tensor(t) => match t.scalar_value() {
                        Some(v) => v as i64,
                        None => return Err(ExecError::NonIntegerBound(bound.to_string())),
                    },
                    other => return Err(ExecError::NonIntegerBound(other.to_string())),
                };
                Ok((0..n.max(0)).map(Value::Int).collect())
            }
            Iterable::Zip { seqs, .. } => {
                let mut columns = Vec::with_capacity(seqs.len());
                for seq in seqs {
                    let v = self.eval_expr(seq, env, interpreted)?;
                    columns.push(self.into_items(v, interpreted)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok((0..len)
                    .map(|i| {
                        if columns.len() == 1 {
                            columns[0][i].clone()
                        } else {
                            Value::Tuple(columns.iter().map(|c| c[i].clone()).collect())
                        }
                    })
                    .collect())
            }
            Iterable::Seq { seq, .. } => {
                let v = self.eval_expr(seq, env, interpreted)?;
                self.into_items(v, interpreted)
            }
        }
    }

    fn into_items(&self, value: Value, interpreted: bool) -> Result<Vec<Value>, ExecError> {
        match self.deref(value, interpreted)? {
            Value::Tuple(items) => Ok(items),
            other => Err(ExecError::InvalidOperands {
                op: "iterate",
                left: other.kind_name().to_string(),
                right: "-".to_string(),
            }),
        }
    }

    fn eval_condition(
        &self,
        cond: &Expr,
        env: &mut HashMap<String, Value>,
        interpreted: bool,
    ) -> Result<bool, ExecError> {
        let value = self.eval_expr(cond, env, interpreted)?;
        match self.deref(value, interpreted)? {
            Value::Bool(b) => Ok(b),
            Value::Tensor(t) if t.dtype == DType::Bool => match t.scalar_value() {
                Some(v) => Ok(v != 0.0),
                None => Err(ExecError::NonBoolCondition("ranked bool tensor".into())),
            },
            other => Err(ExecError::NonBoolCondition(other.to_string())),
        }
    }

    fn eval_expr(
        &self,
        expr: &Expr,
        env: &mut HashMap<String, Value>,
        interpreted: bool,
    ) -> Result<Value, ExecError> {
        match expr {
            Expr::Literal(lit, _) => Ok(literal_value(lit)),

            Expr::Var(name, _) => env
                .get(name)
                .cloned()
                .ok_or_else(|| ExecError::UndefinedVariable(name.clone())),

            Expr::Opaque { object, .. } => {
                if interpreted {
                    Ok(Value::Object(*object))
                } else {
                    Err(ExecError::ObjectInGraphRegion)
                }
            }

            Expr::Binary {
                op, left, right, ..
            } => {
                let l = self.eval_expr(left, env, interpreted)?;
                let r = self.eval_expr(right, env, interpreted)?;
                let l = self.deref(l, interpreted)?;
                let r = self.deref(r, interpreted)?;
                binary_value(*op, l, r)
            }

            Expr::Call { op, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let v = self.eval_expr(arg, env, interpreted)?;
                    values.push(self.deref(v, interpreted)?);
                }
                self.apply_op(op, values, interpreted)
            }

            Expr::GetAttr { object, name, .. } => {
                let obj = self.eval_expr(object, env, interpreted)?;
                let obj = self.deref(obj, interpreted)?;
                let attr = self.eval_expr(name, env, interpreted)?;
                let Value::Str(attr) = self.deref(attr, interpreted)? else {
                    return Err(ExecError::UnknownOperator("<dynamic attribute>".into()));
                };
                self.apply_op(&attr, vec![obj], interpreted)
            }

            Expr::Tuple { elements, .. } => {
                let mut items = Vec::with_capacity(elements.len());
                for e in elements {
                    items.push(self.eval_expr(e, env, interpreted)?);
                }
                Ok(Value::Tuple(items))
            }

            Expr::TupleGet { tuple, index, .. } => {
                let v = self.eval_expr(tuple, env, interpreted)?;
                match self.deref(v, interpreted)? {
                    Value::Tuple(items) => items.get(*index).cloned().ok_or(
                        ExecError::TupleIndexOutOfBounds {
                            index: *index,
                            len: items.len(),
                        },
                    ),
                    other => Err(ExecError::InvalidOperands {
                        op: "index",
                        left: other.kind_name().to_string(),
                        right: "-".to_string(),
                    }),
                }
            }
        }
    }

    /// In interpreted regions, objects are projected on use. In graph
    /// regions an object is a planner bug.
    fn deref(&self, value: Value, interpreted: bool) -> Result<Value, ExecError> {
        match value {
            Value::Object(handle) => {
                if interpreted {
                    Ok(self.runtime.project(handle)?)
                } else {
                    Err(ExecError::ObjectInGraphRegion)
                }
            }
            other => Ok(other),
        }
    }

    fn apply_op(
        &self,
        op: &str,
        args: Vec<Value>,
        interpreted: bool,
    ) -> Result<Value, ExecError> {
        let unary = |args: &[Value]| -> Result<Value, ExecError> {
            match args {
                [v] => Ok(v.clone()),
                _ => Err(ExecError::ArityMismatch {
                    expected: 1,
                    given: args.len(),
                }),
            }
        };
        match op {
            "add" | "sub" | "mul" | "div" | "equal" | "maximum" | "minimum" => {
                let [l, r]: [Value; 2] = args.try_into().map_err(|args: Vec<Value>| {
                    ExecError::ArityMismatch {
                        expected: 2,
                        given: args.len(),
                    }
                })?;
                match op {
                    "add" => binary_value(BinaryOp::Add, l, r),
                    "sub" => binary_value(BinaryOp::Sub, l, r),
                    "mul" => binary_value(BinaryOp::Mul, l, r),
                    "div" => binary_value(BinaryOp::Div, l, r),
                    "equal" => binary_value(BinaryOp::Eq, l, r),
                    "maximum" => numeric_pair("maximum", l, r, f64::max),
                    _ => numeric_pair("minimum", l, r, f64::min),
                }
            }
            "neg" => numeric_unary(unary(&args)?, |v| -v),
            "abs" => numeric_unary(unary(&args)?, f64::abs),
            "square" => numeric_unary(unary(&args)?, |v| v * v),
            "relu" => numeric_unary(unary(&args)?, |v| v.max(0.0)),
            "identity" => unary(&args),
            // Host builtins only exist under interpreted semantics.
            "int" if interpreted => match unary(&args)? {
                Value::Int(n) => Ok(Value::Int(n)),
                Value::Float(x) => Ok(Value::Int(x as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Tensor(t) => match t.scalar_value() {
                    Some(v) => Ok(Value::Int(v as i64)),
                    None => Err(ExecError::NonIntegerBound("ranked tensor".into())),
                },
                other => Err(ExecError::InvalidOperands {
                    op: "int",
                    left: other.kind_name().to_string(),
                    right: "-".to_string(),
                }),
            },
            _ => Err(ExecError::UnknownOperator(op.to_string())),
        }
    }
}

fn literal_value(lit: &crate::ir::Literal) -> Value {
    match lit {
        crate::ir::Literal::Int(n) => Value::Int(*n),
        crate::ir::Literal::Float(x) => Value::Float(*x),
        crate::ir::Literal::Bool(b) => Value::Bool(*b),
        crate::ir::Literal::Str(s) => Value::Str(s.clone()),
    }
}

fn invalid(op: &'static str, l: &Value, r: &Value) -> ExecError {
    ExecError::InvalidOperands {
        op,
        left: l.kind_name().to_string(),
        right: r.kind_name().to_string(),
    }
}

fn binary_value(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExecError> {
    use BinaryOp::*;
    if op.is_comparison() {
        return compare_value(op, l, r);
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(match op {
            Add => Value::Int(a.wrapping_add(b)),
            Sub => Value::Int(a.wrapping_sub(b)),
            Mul => Value::Int(a.wrapping_mul(b)),
            Div => Value::Float(a as f64 / b as f64),
            _ => unreachable!("comparisons handled above"),
        }),
        (Value::Str(a), Value::Str(b)) if op == Add => Ok(Value::Str(a + &b)),
        (l @ Value::Tensor(_), r) | (l, r @ Value::Tensor(_)) => tensor_binary(op, l, r),
        (l, r) => {
            let (a, b) = match (numeric(&l), numeric(&r)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(invalid(op_name(op), &l, &r)),
            };
            let v = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                _ => unreachable!("comparisons handled above"),
            };
            Ok(Value::Float(v))
        }
    }
}

fn compare_value(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExecError> {
    use BinaryOp::*;
    if matches!(l, Value::Tensor(_)) || matches!(r, Value::Tensor(_)) {
        return tensor_binary(op, l, r);
    }
    let ordering = match (&l, &r) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
        _ => match (numeric(&l), numeric(&r)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(invalid(op_name(op), &l, &r)),
        },
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(matches!(op, Ne)));
    };
    Ok(Value::Bool(match op {
        Lt => ordering.is_lt(),
        Le => ordering.is_le(),
        Gt => ordering.is_gt(),
        Ge => ordering.is_ge(),
        Eq => ordering.is_eq(),
        Ne => ordering.is_ne(),
        _ => unreachable!("arithmetic handled by caller"),
    }))
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        Value::Bool(b) => Some(f64::from(*b)),
        _ => None,
    }
}

fn op_name(op: BinaryOp) -> &'static str {
    use BinaryOp::*;
    match op {
        Add => "add",
        Sub => "sub",
        Mul => "mul",
        Div => "div",
        Lt => "lt",
        Le => "le",
        Gt => "gt",
        Ge => "ge",
        Eq => "eq",
        Ne => "ne",
    }
}

fn numeric_unary(v: Value, f: impl Fn(f64) -> f64) -> Result<Value, ExecError> {
    match v {
        Value::Int(n) => Ok(Value::Int(f(n as f64) as i64)),
        Value::Float(x) => Ok(Value::Float(f(x))),
        Value::Tensor(t) => Ok(Value::Tensor(TensorValue::new(
            t.dtype,
            t.shape,
            t.data.iter().map(|x| f(*x)).collect(),
        ))),
        other => Err(ExecError::InvalidOperands {
            op: "unary",
            left: other.kind_name().to_string(),
            right: "-".to_string(),
        }),
    }
}

fn numeric_pair(
    op: &'static str,
    l: Value,
    r: Value,
    f: impl Fn(f64, f64) -> f64 + Copy,
) -> Result<Value, ExecError> {
    match (l, r) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            if a.shape != b.shape {
                return Err(ExecError::ShapeMismatch(a.shape, b.shape));
            }
            let data = a.data.iter().zip(&b.data).map(|(x, y)| f(*x, *y)).collect();
            Ok(Value::Tensor(TensorValue::new(a.dtype, a.shape, data)))
        }
        // Both builtins taking this path are commutative.
        (Value::Tensor(a), s) | (s, Value::Tensor(a)) => {
            let Some(sv) = numeric(&s) else {
                return Err(invalid(op, &Value::Tensor(a), &s));
            };
            let data = a.data.iter().map(|x| f(*x, sv)).collect();
            Ok(Value::Tensor(TensorValue::new(a.dtype, a.shape, data)))
        }
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(f(a as f64, b as f64) as i64)),
        (l, r) => match (numeric(&l), numeric(&r)) {
            (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
            _ => Err(invalid(op, &l, &r)),
        },
    }
}

fn tensor_binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExecError> {
    let name = op_name(op);
    let is_cmp = op.is_comparison();
    let f = |a: f64, b: f64| -> f64 {
        use BinaryOp::*;
        match op {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => a / b,
            Lt => f64::from(a < b),
            Le => f64::from(a <= b),
            Gt => f64::from(a > b),
            Ge => f64::from(a >= b),
            Eq => f64::from(a == b),
            Ne => f64::from(a != b),
        }
    };
    match (l, r) {
        (Value::Tensor(a), Value::Tensor(b)) => {
            if a.shape != b.shape {
                return Err(ExecError::ShapeMismatch(a.shape, b.shape));
            }
            let data = a.data.iter().zip(&b.data).map(|(x, y)| f(*x, *y)).collect();
            let dtype = if is_cmp { DType::Bool } else { a.dtype };
            Ok(Value::Tensor(TensorValue::new(dtype, a.shape, data)))
        }
        (Value::Tensor(a), scalar) => {
            let Some(s) = numeric(&scalar) else {
                return Err(invalid(name, &Value::Tensor(a), &scalar));
            };
            let data = a.data.iter().map(|x| f(*x, s)).collect();
            let dtype = if is_cmp { DType::Bool } else { a.dtype };
            Ok(Value::Tensor(TensorValue::new(dtype, a.shape, data)))
        }
        (scalar, Value::Tensor(b)) => {
            let Some(s) = numeric(&scalar) else {
                return Err(invalid(name, &scalar, &Value::Tensor(b)));
            };
            let data = b.data.iter().map(|x| f(s, *x)).collect();
            let dtype = if is_cmp { DType::Bool } else { b.dtype };
            Ok(Value::Tensor(TensorValue::new(dtype, b.shape, data)))
        }
        (l, r) => Err(invalid(name, &l, &r)),
    }
}
