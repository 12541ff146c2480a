//! Specialization cache.
//!
//! A function body is compiled at most once per abstract signature and
//! mode. Concurrent callers racing on the same key share one
//! compilation: every key maps to a cell, and whichever thread wins the
//! cell runs the compiler while the rest block on the result. Failed
//! compilations are cached too, so a rejected specialization is not
//! re-analyzed on every call.

use crate::compiler::{CompiledFunction, Compiler, ExecutionMode};
use crate::error::CompileError;
use crate::ir::FunctionBody;
use crate::lattice::AbstractValue;
use crate::registry::OpRegistry;
use once_cell::sync::OnceCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identity of one specialization: the body (by structural hash) plus
/// the abstract argument signature and the execution mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecializationKey {
    body_hash: u64,
    signature: Vec<AbstractValue>,
    mode: ExecutionMode,
}

impl SpecializationKey {
    pub fn new(func: &FunctionBody, signature: &[AbstractValue], mode: ExecutionMode) -> Self {
        let mut hasher = DefaultHasher::new();
        func.hash(&mut hasher);
        Self {
            body_hash: hasher.finish(),
            signature: signature.to_vec(),
            mode,
        }
    }
}

type Slot = Arc<OnceCell<Result<Arc<CompiledFunction>, CompileError>>>;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct CompilationCache {
    slots: Mutex<HashMap<SpecializationKey, Slot>>,
    stats: CacheStats,
}

impl CompilationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up or compile the specialization for `(func, signature,
    /// mode)`. The compiler runs at most once per key, outside the map
    /// lock so unrelated keys do not serialize.
    pub fn get_or_compile(
        &self,
        registry: &dyn OpRegistry,
        func: &FunctionBody,
        signature: &[AbstractValue],
        mode: ExecutionMode,
    ) -> Result<Arc<CompiledFunction>, CompileError> {
        let key = SpecializationKey::new(func, signature, mode);

        let slot: Slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(slots.entry(key).or_default())
        };

        if let Some(cached) = slot.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return cached.clone();
        }

        let result = slot.get_or_init(|| {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Compiler::new(registry)
                .compile(func, signature, mode)
                .map(Arc::new)
        });
        result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expr, Stmt};
    use crate::lattice::{AbstractValue as A, DType};
    use crate::registry::BuiltinRegistry;

    fn sample_func() -> FunctionBody {
        FunctionBody::new(
            "double",
            vec!["x"],
            vec![Stmt::ret(Expr::add(Expr::var("x"), Expr::var("x")))],
        )
    }

    #[test]
    fn test_repeat_lookup_reuses_compilation() {
        let registry = BuiltinRegistry::new();
        let cache = CompilationCache::new();
        let func = sample_func();
        let sig = vec![A::tensor(DType::F32, &[2])];

        let first = cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Graph)
            .unwrap();
        let second = cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Graph)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_signatures_compile_separately() {
        let registry = BuiltinRegistry::new();
        let cache = CompilationCache::new();
        let func = sample_func();

        let a = cache
            .get_or_compile(
                &registry,
                &func,
                &[A::tensor(DType::F32, &[2])],
                ExecutionMode::Graph,
            )
            .unwrap();
        let b = cache
            .get_or_compile(
                &registry,
                &func,
                &[A::tensor(DType::F32, &[3])],
                ExecutionMode::Graph,
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_mode_is_part_of_the_key() {
        let registry = BuiltinRegistry::new();
        let cache = CompilationCache::new();
        let func = sample_func();
        let sig = vec![A::tensor(DType::F32, &[2])];

        cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Graph)
            .unwrap();
        let eager = cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Eager)
            .unwrap();
        assert_eq!(eager.mode, ExecutionMode::Eager);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_rejections_are_cached() {
        let registry = BuiltinRegistry::new();
        let cache = CompilationCache::new();
        let func = FunctionBody::new(
            "bad",
            vec!["n"],
            vec![Stmt::for_range("i", Expr::var("n"), vec![])],
        );
        let sig = vec![A::tensor(DType::I32, &[])];

        let first = cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Graph)
            .unwrap_err();
        let second = cache
            .get_or_compile(&registry, &func, &sig, ExecutionMode::Graph)
            .unwrap_err();
        assert_eq!(first, second);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }
}
