//! Specialization cache behavior under concurrent lookups.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;

use graphfall::cache::CompilationCache;
use graphfall::compiler::ExecutionMode;
use graphfall::ir::{Expr, FunctionBody, Stmt};
use graphfall::lattice::{AbstractValue, DType};
use graphfall::registry::BuiltinRegistry;

fn loop_func() -> FunctionBody {
    FunctionBody::new(
        "accumulate",
        vec!["x", "y"],
        vec![
            Stmt::for_range(
                "i",
                Expr::int(3),
                vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x")))],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    )
}

fn tensor_sig() -> Vec<AbstractValue> {
    vec![
        AbstractValue::tensor(DType::I32, &[]),
        AbstractValue::tensor(DType::I32, &[]),
    ]
}

#[test]
fn test_racing_threads_share_one_compilation() {
    let registry = Arc::new(BuiltinRegistry::new());
    let cache = Arc::new(CompilationCache::new());
    let func = Arc::new(loop_func());
    let sig = tensor_sig();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let cache = Arc::clone(&cache);
            let func = Arc::clone(&func);
            let sig = sig.clone();
            thread::spawn(move || {
                cache
                    .get_or_compile(registry.as_ref(), &func, &sig, ExecutionMode::Graph)
                    .expect("compilation should succeed")
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked"))
        .collect();

    // Every thread observes the same Arc, so the compiler ran once.
    let first = &results[0];
    for other in &results[1..] {
        assert!(Arc::ptr_eq(first, other));
    }
    assert_eq!(cache.stats().misses(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_structurally_equal_bodies_share_a_key() {
    let registry = BuiltinRegistry::new();
    let cache = CompilationCache::new();
    let sig = tensor_sig();

    // Two independently built but identical bodies.
    let a = cache
        .get_or_compile(&registry, &loop_func(), &sig, ExecutionMode::Graph)
        .unwrap();
    let b = cache
        .get_or_compile(&registry, &loop_func(), &sig, ExecutionMode::Graph)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_body_change_invalidates_the_key() {
    let registry = BuiltinRegistry::new();
    let cache = CompilationCache::new();
    let sig = tensor_sig();

    cache
        .get_or_compile(&registry, &loop_func(), &sig, ExecutionMode::Graph)
        .unwrap();

    let changed = FunctionBody::new(
        "accumulate",
        vec!["x", "y"],
        vec![
            Stmt::for_range(
                "i",
                Expr::int(4),
                vec![Stmt::assign("y", Expr::add(Expr::var("y"), Expr::var("x")))],
            ),
            Stmt::ret(Expr::var("y")),
        ],
    );
    cache
        .get_or_compile(&registry, &changed, &sig, ExecutionMode::Graph)
        .unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().misses(), 2);
}
