//! Step registry — the worker's build-time table of step implementations.

use std::collections::HashMap;
use std::sync::Arc;

use super::step::{ResolvedStep, Step, StepResolver};
use crate::error::ResolveError;

/// Registry of available steps, keyed by `(moduleId, modulePath)`.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<(String, String), ResolvedStep>,
}

impl StepRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a regular step, invoked with `(input, context)`.
    pub fn register(
        &mut self,
        module_id: impl Into<String>,
        module_path: impl Into<String>,
        step: Arc<dyn Step>,
    ) {
        self.insert(module_id.into(), module_path.into(), step, false);
    }

    /// Register an error-catching step, invoked with `(error, input, context)`.
    pub fn register_catcher(
        &mut self,
        module_id: impl Into<String>,
        module_path: impl Into<String>,
        step: Arc<dyn Step>,
    ) {
        self.insert(module_id.into(), module_path.into(), step, true);
    }

    fn insert(
        &mut self,
        module_id: String,
        module_path: String,
        step: Arc<dyn Step>,
        error_catching: bool,
    ) {
        let previous = self.steps.insert(
            (module_id.clone(), module_path.clone()),
            ResolvedStep {
                step,
                error_catching,
            },
        );
        if previous.is_some() {
            tracing::warn!(module_id = %module_id, module_path = %module_path, "Replaced registered step");
        } else {
            tracing::debug!(module_id = %module_id, module_path = %module_path, "Registered step");
        }
    }

    /// Check if a step exists.
    pub fn has(&self, module_id: &str, module_path: &str) -> bool {
        self.steps
            .contains_key(&(module_id.to_string(), module_path.to_string()))
    }

    /// List all `(moduleId, modulePath)` pairs, sorted.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.steps.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get the number of registered steps.
    pub fn count(&self) -> usize {
        self.steps.len()
    }
}

impl StepResolver for StepRegistry {
    fn resolve(&self, module_id: &str, module_path: &str) -> Result<ResolvedStep, ResolveError> {
        self.steps
            .get(&(module_id.to_string(), module_path.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                module_id: module_id.to_string(),
                module_path: module_path.to_string(),
            })
    }
}
