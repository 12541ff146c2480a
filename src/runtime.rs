//! Opaque interpreted-value runtime.
//!
//! The graph compiler treats values it cannot represent as opaque handles
//! owned by an external runtime. The [`OpaqueRuntime`] capability converts
//! values across the graph/interpreted boundary:
//!
//! - `materialize`: graph value -> interpreted object (`ToInterpreted`)
//! - `project`: interpreted object -> graph value (`ToGraph`)
//!
//! Both conversions can fail; failures surface as
//! [`ConversionError`](crate::error::ConversionError).

use crate::error::ConversionError;
use crate::exec::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Identity of one interpreted object. Opaque to the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

/// Capability to move values across the graph/interpreted boundary.
pub trait OpaqueRuntime: Send + Sync {
    /// Materialize a graph value as an interpreted object.
    fn materialize(&self, value: &Value) -> Result<ObjectHandle, ConversionError>;

    /// Attempt to construct a graph-native value from an interpreted object.
    fn project(&self, handle: ObjectHandle) -> Result<Value, ConversionError>;
}

/// In-process runtime backed by a handle table.
///
/// Objects are stored as ordinary [`Value`]s; `project` succeeds whenever
/// the stored value has a graph representation (scalar, tensor, or a tuple
/// of those).
#[derive(Debug, Default)]
pub struct DefaultRuntime {
    objects: Mutex<HashMap<u64, Value>>,
    next_id: AtomicU64,
}

impl DefaultRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-existing interpreted object, e.g. a host-library
    /// array captured by a traced function.
    pub fn register(&self, value: Value) -> ObjectHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(id, value);
        }
        ObjectHandle(id)
    }
}

impl OpaqueRuntime for DefaultRuntime {
    fn materialize(&self, value: &Value) -> Result<ObjectHandle, ConversionError> {
        Ok(self.register(value.clone()))
    }

    fn project(&self, handle: ObjectHandle) -> Result<Value, ConversionError> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| ConversionError::runtime_poisoned())?;
        match objects.get(&handle.0) {
            Some(Value::Object(inner)) => {
                // A handle wrapping another handle has no tensor/scalar
                // projection at this level.
                Err(ConversionError::no_graph_representation(format!(
                    "nested interpreted object {:?}",
                    inner
                )))
            }
            Some(value) => Ok(value.clone()),
            None => Err(ConversionError::no_graph_representation(format!(
                "unknown interpreted object {}",
                handle.0
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_then_project_roundtrip() {
        let runtime = DefaultRuntime::new();
        let handle = runtime.register(Value::Float(1.1));
        assert_eq!(runtime.project(handle).unwrap(), Value::Float(1.1));
    }

    #[test]
    fn test_project_unknown_handle_fails() {
        let runtime = DefaultRuntime::new();
        assert!(runtime.project(ObjectHandle(99)).is_err());
    }

    #[test]
    fn test_materialize_is_stable() {
        let runtime = DefaultRuntime::new();
        let a = runtime.materialize(&Value::Int(4)).unwrap();
        let b = runtime.materialize(&Value::Int(4)).unwrap();
        assert_ne!(a, b, "each materialization gets its own identity");
        assert_eq!(runtime.project(a).unwrap(), runtime.project(b).unwrap());
    }
}
