//! End-to-end control flow tests.
//!
//! Each test compiles a traced function body against an abstract
//! signature and, where the plan is runnable, executes the compiled
//! regions over concrete values.

use pretty_assertions::assert_eq;

use graphfall::compiler::{compile, ExecutionMode};
use graphfall::diagnostics::{FallbackReason, RejectReason};
use graphfall::error::{CompileError, ConversionError};
use graphfall::exec::value::{TensorValue, Value};
use graphfall::exec::Executor;
use graphfall::extract::{BoundaryDirection, RegionMode};
use graphfall::ir::{ConstructKind, Expr, FunctionBody, Stmt};
use graphfall::lattice::{AbstractValue, DType, ScalarKind};
use graphfall::registry::BuiltinRegistry;
use graphfall::runtime::{DefaultRuntime, ObjectHandle, OpaqueRuntime};
use graphfall::span::Span;
use std::sync::atomic::{AtomicUsize, Ordering};

fn tensor_sig() -> AbstractValue {
    AbstractValue::tensor(DType::I32, &[])
}

fn run(
    func: &FunctionBody,
    signature: &[AbstractValue],
    args: Vec<Value>,
    runtime: &DefaultRuntime,
) -> Option<Value> {
    let registry = BuiltinRegistry::new();
    let compiled =
        compile(&registry, func, signature, ExecutionMode::Graph).expect("compile failed");
    Executor::new(runtime)
        .run(&compiled, args)
        .expect("execution failed")
}

/// Summing over `range(3)` with tensor state unrolls fully and stays in
/// the graph.
#[test]
fn test_fixed_range_sum_over_tensors() {
    // y = x; for i in range(3): y = y + x * i; return y
    let func = FunctionBody::new(
        "loop_sum",
        vec!["x"],
        vec![
            Stmt::assign("y", Expr::var("x")),
            Stmt::for_range(
                "i",
                Expr::int(3),
                vec![Stmt::assign(
                    "y",
                    Expr::add(
                        Expr::var("y"),
                        Expr::binary(graphfall::ir::BinaryOp::Mul, Expr::var("x"), Expr::var("i")),
                    ),
                )],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let registry = BuiltinRegistry::new();
    let compiled =
        compile(&registry, &func, &[tensor_sig()], ExecutionMode::Graph).unwrap();
    assert!(compiled.is_fully_graphed());

    let runtime = DefaultRuntime::new();
    let out = run(
        &func,
        &[tensor_sig()],
        vec![Value::tensor_scalar(DType::I32, 7.0)],
        &runtime,
    );
    // 7 + 7*0 + 7*1 + 7*2 = 28
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 28.0)));
}

/// An unused loop variable still unrolls; the accumulator starts as a
/// native int and is promoted to a tensor on the first add.
#[test]
fn test_unused_loop_variable_accumulates() {
    // y = 0; for _ in range(3): y = y + x; return y
    let func = FunctionBody::new(
        "accumulate",
        vec!["x"],
        vec![
            Stmt::assign("y", Expr::int(0)),
            Stmt::for_range(
                "_",
                Expr::int(3),
                vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x")))],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let runtime = DefaultRuntime::new();
    let out = run(
        &func,
        &[tensor_sig()],
        vec![Value::tensor_scalar(DType::I32, 7.0)],
        &runtime,
    );
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 21.0)));
}

/// A range bound that is itself a tensor value has no graph loop form
/// and no interpreted recovery either.
#[test]
fn test_tensor_valued_range_bound_is_a_hard_rejection() {
    let func = FunctionBody::new(
        "tensor_bound",
        vec!["n"],
        vec![Stmt::for_range(
            "i",
            Expr::var("n"),
            vec![Stmt::assign("a", Expr::var("i"))],
        )],
    );
    let registry = BuiltinRegistry::new();
    let err = compile(&registry, &func, &[tensor_sig()], ExecutionMode::Graph).unwrap_err();
    let CompileError::Rejected {
        construct, reason, ..
    } = &err
    else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(*construct, ConstructKind::ForLoop);
    assert_eq!(*reason, RejectReason::TensorValuedRangeBound);
    assert_eq!(
        reason.to_string(),
        "range operator only supports a fixed integer bound, got a tensor-valued bound"
    );
}

/// Iterating a fixed tuple via zip unrolls by the tuple length.
#[test]
fn test_zip_over_fixed_tuple_sums_elements() {
    // s = 0-tensor; for x in zip(t): s = s + x; return s
    let func = FunctionBody::new(
        "zip_sum",
        vec!["t", "s"],
        vec![
            Stmt::for_zip(
                "x",
                vec![Expr::var("t")],
                vec![Stmt::assign("s", Expr::add(Expr::var("s"), Expr::var("x")))],
            ),
            Stmt::ret(Expr::var("s")),
        ],
    );
    let sig = vec![
        AbstractValue::Sequence(vec![tensor_sig(), tensor_sig(), tensor_sig()]),
        tensor_sig(),
    ];
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert!(compiled.is_fully_graphed());

    let runtime = DefaultRuntime::new();
    let out = run(
        &func,
        &sig,
        vec![
            Value::Tuple(vec![
                Value::tensor_scalar(DType::I32, 2.0),
                Value::tensor_scalar(DType::I32, 3.0),
                Value::tensor_scalar(DType::I32, 4.0),
            ]),
            Value::tensor_scalar(DType::I32, 0.0),
        ],
        &runtime,
    );
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 9.0)));
}

/// An assignment from an opaque host object falls back; the value
/// re-enters the graph through a boundary and the rest of the body,
/// loop included, stays graphed.
#[test]
fn test_interpreted_loop_result_reenters_graph() {
    let runtime = DefaultRuntime::new();
    let host_array = runtime.register(Value::tensor_scalar(DType::I32, 10.0));

    // acc = <host object>; for i in range(2): acc = acc + x;
    // y = acc + x; return y
    let func = FunctionBody::new(
        "host_mix",
        vec!["x"],
        vec![
            Stmt::assign(
                "acc",
                Expr::Opaque {
                    object: host_array,
                    span: Span::synthetic(),
                },
            ),
            Stmt::for_range(
                "i",
                Expr::int(2),
                vec![Stmt::assign(
                    "acc",
                    Expr::add(Expr::var("acc"), Expr::var("x")),
                )],
            ),
            Stmt::assign("y", Expr::add(Expr::var("acc"), Expr::var("x"))),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &[tensor_sig()], ExecutionMode::Graph).unwrap();

    assert!(!compiled.fallback_log.is_empty());
    assert!(compiled
        .fallback_log
        .iter()
        .all(|e| e.reason == FallbackReason::InterpretedOperand));
    let modes: Vec<_> = compiled.regions().iter().map(|r| r.mode).collect();
    assert_eq!(
        modes,
        vec![RegionMode::Interpreted, RegionMode::Graph],
        "interpreted prefix, graph suffix"
    );
    assert_eq!(
        compiled.plan.boundaries[0].direction,
        BoundaryDirection::ToGraph
    );
    assert!(compiled.plan.boundaries[0].carries("acc"));

    let out = Executor::new(&runtime)
        .run(&compiled, vec![Value::tensor_scalar(DType::I32, 1.0)])
        .unwrap();
    // acc crosses as 10, then 10 + 1 + 1 + 1 inside the graph.
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 13.0)));
}

/// A break path must merge into the post-loop state without losing the
/// variable's graph type.
#[test]
fn test_break_path_state_merges_cleanly() {
    // for i in range(4): y = y + x; if i == 2: break
    // return y
    let func = FunctionBody::new(
        "break_merge",
        vec!["x", "y"],
        vec![
            Stmt::for_range(
                "i",
                Expr::int(4),
                vec![
                    Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x"))),
                    Stmt::If {
                        cond: Expr::binary(
                            graphfall::ir::BinaryOp::Eq,
                            Expr::var("i"),
                            Expr::int(2),
                        ),
                        then_body: vec![Stmt::Break(Span::synthetic())],
                        else_body: vec![],
                        span: Span::synthetic(),
                    },
                ],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let sig = vec![tensor_sig(), tensor_sig()];
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert!(compiled.is_fully_graphed(), "break alone forces no fallback");
    assert!(matches!(
        compiled.return_type,
        AbstractValue::Tensor {
            dtype: DType::I32,
            ..
        }
    ));

    let runtime = DefaultRuntime::new();
    let out = Executor::new(&runtime)
        .run(
            &compiled,
            vec![
                Value::tensor_scalar(DType::I32, 5.0),
                Value::tensor_scalar(DType::I32, 0.0),
            ],
        )
        .unwrap();
    // Iterations i = 0, 1, 2 run before the break.
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 15.0)));
}

/// Attribute access through a constant-folded name is the same operator
/// as the direct call.
#[test]
fn test_attribute_name_folding_matches_direct_call() {
    let registry = BuiltinRegistry::new();
    let sig = vec![tensor_sig()];

    let via_attr = FunctionBody::new(
        "via_attr",
        vec!["x"],
        vec![Stmt::ret(Expr::getattr(
            Expr::var("x"),
            Expr::add(Expr::str("a"), Expr::str("bs")),
        ))],
    );
    let via_call = FunctionBody::new(
        "via_call",
        vec!["x"],
        vec![Stmt::ret(Expr::call("abs", vec![Expr::var("x")]))],
    );

    let a = compile(&registry, &via_attr, &sig, ExecutionMode::Graph).unwrap();
    let b = compile(&registry, &via_call, &sig, ExecutionMode::Graph).unwrap();
    assert!(a.is_fully_graphed());
    assert!(b.is_fully_graphed());
    assert_eq!(a.return_type, b.return_type);

    let runtime = DefaultRuntime::new();
    let executor = Executor::new(&runtime);
    let arg = vec![Value::tensor_scalar(DType::I32, -4.0)];
    assert_eq!(
        executor.run(&a, arg.clone()).unwrap(),
        executor.run(&b, arg).unwrap()
    );
}

/// An attribute name that only resolves at run time demotes the
/// statement, never errors.
#[test]
fn test_dynamic_attribute_name_falls_back() {
    let func = FunctionBody::new(
        "dyn_attr",
        vec!["x", "name"],
        vec![Stmt::ret(Expr::getattr(Expr::var("x"), Expr::var("name")))],
    );
    let sig = vec![tensor_sig(), AbstractValue::scalar(ScalarKind::Str)];
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert_eq!(compiled.fallback_log.len(), 1);
    assert_eq!(
        compiled.fallback_log[0].reason,
        FallbackReason::UnresolvedAttributeName
    );
    assert_eq!(
        compiled.fallback_log[0].reason.to_string(),
        "attribute name is not statically resolvable"
    );
}

/// Branch state merging widens differing literals instead of failing.
#[test]
fn test_branch_merge_widens_literals() {
    // if c: y = 1 else: y = 2; return y + 1
    let func = FunctionBody::new(
        "branchy",
        vec!["c"],
        vec![
            Stmt::If {
                cond: Expr::var("c"),
                then_body: vec![Stmt::assign("y", Expr::int(1))],
                else_body: vec![Stmt::assign("y", Expr::int(2))],
                span: Span::synthetic(),
            },
            Stmt::ret(Expr::add(Expr::var("y"), Expr::int(1))),
        ],
    );
    let sig = vec![AbstractValue::scalar(ScalarKind::Bool)];
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert!(compiled.is_fully_graphed());
    // Literal is widened away by the merge, kind survives.
    assert_eq!(
        compiled.return_type,
        AbstractValue::scalar(ScalarKind::Int)
    );

    let runtime = DefaultRuntime::new();
    let out = Executor::new(&runtime)
        .run(&compiled, vec![Value::Bool(false)])
        .unwrap();
    assert_eq!(out, Some(Value::Int(3)));
}

/// Mixed-kind branch results cannot merge; the branch runs interpreted.
#[test]
fn test_divergent_branch_merge_falls_back() {
    let func = FunctionBody::new(
        "divergent",
        vec!["c"],
        vec![
            Stmt::If {
                cond: Expr::var("c"),
                then_body: vec![Stmt::assign("y", Expr::int(1))],
                else_body: vec![Stmt::assign("y", Expr::str("one"))],
                span: Span::synthetic(),
            },
            Stmt::ret(Expr::var("y")),
        ],
    );
    let sig = vec![AbstractValue::scalar(ScalarKind::Bool)];
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert_eq!(compiled.fallback_log.len(), 1);
    assert_eq!(
        compiled.fallback_log[0].reason,
        FallbackReason::MergeDivergence("y".to_string())
    );
    assert_eq!(compiled.fallback_log[0].construct, ConstructKind::If);
}

/// Eager mode runs everything interpreted, including bodies graph mode
/// would reject.
#[test]
fn test_eager_mode_runs_rejected_body() {
    let func = FunctionBody::new(
        "eager_loop",
        vec!["n", "y"],
        vec![
            Stmt::for_range(
                "i",
                Expr::var("n"),
                vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::int(1)))],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let sig = vec![tensor_sig(), tensor_sig()];
    let registry = BuiltinRegistry::new();
    assert!(compile(&registry, &func, &sig, ExecutionMode::Graph).is_err());

    let compiled = compile(&registry, &func, &sig, ExecutionMode::Eager).unwrap();
    let runtime = DefaultRuntime::new();
    let out = Executor::new(&runtime)
        .run(
            &compiled,
            vec![
                Value::Tensor(TensorValue::scalar(DType::I32, 3.0)),
                Value::tensor_scalar(DType::I32, 0.0),
            ],
        )
        .unwrap();
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 3.0)));
}

/// While with a non-bool condition demotes; with a scalar bool it stays
/// in the graph.
#[test]
fn test_while_condition_policy() {
    let registry = BuiltinRegistry::new();

    let loose = FunctionBody::new(
        "while_int",
        vec!["n"],
        vec![Stmt::While {
            cond: Expr::var("n"),
            body: vec![Stmt::assign("n", Expr::var("n"))],
            span: Span::synthetic(),
        }],
    );
    let compiled = compile(
        &registry,
        &loose,
        &[AbstractValue::scalar(ScalarKind::Int)],
        ExecutionMode::Graph,
    )
    .unwrap();
    assert_eq!(
        compiled.fallback_log[0].reason,
        FallbackReason::WhileConditionNotScalarBool
    );
    assert_eq!(
        compiled.fallback_log[0].reason.to_string(),
        "while condition must stay a scalar bool"
    );

    let strict = FunctionBody::new(
        "while_bool",
        vec!["flag", "y"],
        vec![
            Stmt::While {
                cond: Expr::var("flag"),
                body: vec![
                    Stmt::assign("y", Expr::add(Expr::var("y"), Expr::int(1))),
                    Stmt::assign("flag", Expr::bool(false)),
                ],
                span: Span::synthetic(),
            },
            Stmt::ret(Expr::var("y")),
        ],
    );
    let compiled = compile(
        &registry,
        &strict,
        &[
            AbstractValue::scalar(ScalarKind::Bool),
            AbstractValue::scalar(ScalarKind::Int),
        ],
        ExecutionMode::Graph,
    )
    .unwrap();
    assert!(compiled.is_fully_graphed());

    let runtime = DefaultRuntime::new();
    let out = Executor::new(&runtime)
        .run(&compiled, vec![Value::Bool(true), Value::Int(0)])
        .unwrap();
    assert_eq!(out, Some(Value::Int(1)));
}

/// Compiling the same body against the same signature twice yields
/// structurally identical artifacts: regions, boundaries, and log.
#[test]
fn test_recompilation_is_deterministic() {
    let registry = BuiltinRegistry::new();
    let func = FunctionBody::new(
        "mixed",
        vec!["x"],
        vec![
            Stmt::assign("h", Expr::call("int", vec![Expr::var("x")])),
            Stmt::assign("y", Expr::add(Expr::var("h"), Expr::var("x"))),
            Stmt::ret(Expr::var("y")),
        ],
    );
    let sig = vec![tensor_sig()];
    let first = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    let second = compile(&registry, &func, &sig, ExecutionMode::Graph).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.plan.boundaries.len(), 1);
}

/// Entering an interpreted region hands live graph values to the
/// runtime as objects; uses inside the region unwrap them on demand.
#[test]
fn test_graph_values_materialize_on_interpreted_entry() {
    struct CountingRuntime {
        inner: DefaultRuntime,
        materialized: AtomicUsize,
    }
    impl OpaqueRuntime for CountingRuntime {
        fn materialize(&self, value: &Value) -> Result<ObjectHandle, ConversionError> {
            self.materialized.fetch_add(1, Ordering::Relaxed);
            self.inner.materialize(value)
        }
        fn project(&self, handle: ObjectHandle) -> Result<Value, ConversionError> {
            self.inner.project(handle)
        }
    }

    // y = x + x; z = int(y) + y; return z
    let func = FunctionBody::new(
        "promote",
        vec!["x"],
        vec![
            Stmt::assign("y", Expr::add(Expr::var("x"), Expr::var("x"))),
            Stmt::assign(
                "z",
                Expr::add(Expr::call("int", vec![Expr::var("y")]), Expr::var("y")),
            ),
            Stmt::ret(Expr::var("z")),
        ],
    );
    let registry = BuiltinRegistry::new();
    let compiled = compile(&registry, &func, &[tensor_sig()], ExecutionMode::Graph).unwrap();
    assert_eq!(
        compiled.plan.boundaries[0].direction,
        BoundaryDirection::ToInterpreted
    );

    let runtime = CountingRuntime {
        inner: DefaultRuntime::new(),
        materialized: AtomicUsize::new(0),
    };
    let out = Executor::new(&runtime)
        .run(&compiled, vec![Value::tensor_scalar(DType::I32, 2.0)])
        .unwrap();
    // 2 + 2 = 4 crosses as an object; int(4) + 4 = 8 inside the
    // interpreter.
    assert_eq!(out, Some(Value::tensor_scalar(DType::I32, 8.0)));
    assert_eq!(runtime.materialized.load(Ordering::Relaxed), 1);
}
