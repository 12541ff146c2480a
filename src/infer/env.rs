//! Abstract environment for inference.
//!
//! Tracks the [`AbstractValue`] of every bound variable at one program
//! point, with the merge/snapshot operations control-flow analysis needs.

use crate::lattice::AbstractValue;
use std::collections::HashMap;

/// Mapping from variable name to its abstract value at a program point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbstractEnv {
    bindings: HashMap<String, AbstractValue>,
}

impl AbstractEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment binding each parameter to its signature abstract.
    pub fn from_params<'a>(
        params: impl IntoIterator<Item = (&'a str, &'a AbstractValue)>,
    ) -> Self {
        let mut env = Self::new();
        for (name, value) in params {
            env.set(name, value.clone());
        }
        env
    }

    pub fn get(&self, name: &str) -> Option<&AbstractValue> {
        self.bindings.get(name)
    }

    /// Replace the binding for `name`.
    pub fn set(&mut self, name: &str, value: AbstractValue) {
        self.bindings.insert(name.to_string(), value);
    }

    /// Join-based update. Returns true if the binding changed.
    pub fn update(&mut self, name: &str, value: AbstractValue) -> bool {
        match self.bindings.get(name) {
            Some(existing) => {
                let joined = existing.join(&value);
                if &joined != existing {
                    self.bindings.insert(name.to_string(), joined);
                    true
                } else {
                    false
                }
            }
            None => {
                self.bindings.insert(name.to_string(), value);
                true
            }
        }
    }

    /// Merge another environment into this one, joining bindings present
    /// in both. A variable bound on only one side keeps that binding:
    /// whether it is actually reachable on the other path is a question
    /// for interpreted semantics, out of scope here.
    pub fn merge(&mut self, other: &AbstractEnv) {
        for (name, value) in &other.bindings {
            match self.bindings.get(name) {
                Some(existing) => {
                    let joined = existing.join(value);
                    self.bindings.insert(name.clone(), joined);
                }
                None => {
                    self.bindings.insert(name.clone(), value.clone());
                }
            }
        }
    }

    /// Variable names in deterministic (sorted) order.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<_> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AbstractValue)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
