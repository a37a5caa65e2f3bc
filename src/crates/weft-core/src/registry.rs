//! Registry for resolving steps and workflows by id
//!
//! The engine never consults a process-wide lookup table: a [`Registry`] is an
//! explicit object handed to a run at construction and exposed to step bodies
//! through [`StepContext::registry`](crate::step::StepContext::registry). At
//! resume time the same registry re-resolves executables by id, since snapshot
//! data never carries code.

use crate::step::Executable;
use std::collections::HashMap;
use std::sync::Arc;

/// Id-to-executable lookup, dependency-injected through run construction
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Arc<dyn Executable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executable under its own id, replacing any previous entry
    pub fn register(&mut self, executable: Arc<dyn Executable>) {
        self.entries
            .insert(executable.id().to_string(), executable);
    }

    /// Builder-style registration
    pub fn with(mut self, executable: Arc<dyn Executable>) -> Self {
        self.register(executable);
        self
    }

    /// Resolve an executable by id
    pub fn get(&self, id: &str) -> Option<Arc<dyn Executable>> {
        self.entries.get(id).cloned()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepDefinition;
    use serde_json::json;

    #[test]
    fn test_register_and_get() {
        let step = Arc::new(StepDefinition::new(
            "greet",
            json!({}),
            json!({}),
            |ctx| async move { crate::step::StepOutcome::Success(ctx.input().clone()) },
        ));

        let registry = Registry::new().with(step);
        assert!(registry.get("greet").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.ids(), vec!["greet".to_string()]);
    }
}
