//! Read-only runtime context threaded through a run
//!
//! A [`RuntimeContext`] is a typed key-value bag for dependency injection:
//! connection handles, feature flags, tenant ids - anything step bodies need
//! that is not part of the data flow. It is built before the run starts and
//! is immutable afterwards; steps read from it, never write.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable key-value bag shared by every step of a run
///
/// Cloning is cheap (the map is behind an `Arc`).
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    values: Arc<HashMap<String, Value>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, consuming and returning the context (builder style)
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value);
        self
    }

    /// Raw JSON value for a key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserialize the value for a key into a concrete type
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_value_and_get() {
        let ctx = RuntimeContext::new()
            .with_value("tenant", json!("acme"))
            .with_value("limit", json!(10));

        assert_eq!(ctx.get("tenant"), Some(&json!("acme")));
        assert_eq!(ctx.get_as::<u32>("limit"), Some(10));
        assert!(ctx.get("missing").is_none());
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_get_as_type_mismatch_is_none() {
        let ctx = RuntimeContext::new().with_value("limit", json!("not a number"));
        assert_eq!(ctx.get_as::<u32>("limit"), None);
    }

    #[test]
    fn test_clones_share_values() {
        let ctx = RuntimeContext::new().with_value("k", json!(1));
        let clone = ctx.clone();
        assert_eq!(clone.get("k"), Some(&json!(1)));
    }
}
