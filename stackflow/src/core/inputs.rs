//! Inputs resolved for a stack before its action runs.

use super::InputRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values a stack receives from upstream stacks, keyed by `(stack, key)`.
///
/// Optional inputs whose producer did not publish them are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInputs {
    values: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl ResolvedInputs {
    /// Creates an empty input set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a resolved value.
    pub fn insert(&mut self, input: &InputRef, value: serde_json::Value) {
        self.values
            .entry(input.from_stack.clone())
            .or_default()
            .insert(input.output_key.clone(), value);
    }

    /// Gets a value by producer stack and key.
    #[must_use]
    pub fn get(&self, from_stack: &str, key: &str) -> Option<&serde_json::Value> {
        self.values.get(from_stack).and_then(|outputs| outputs.get(key))
    }

    /// Gets a string value.
    #[must_use]
    pub fn get_str(&self, from_stack: &str, key: &str) -> Option<&str> {
        self.get(from_stack, key).and_then(serde_json::Value::as_str)
    }

    /// Gets a value, failing with a descriptive error when absent.
    ///
    /// Intended for use inside provisioning actions.
    pub fn require(&self, from_stack: &str, key: &str) -> anyhow::Result<&serde_json::Value> {
        self.get(from_stack, key)
            .ok_or_else(|| anyhow::anyhow!("input '{from_stack}.{key}' was not resolved"))
    }

    /// Gets a string value, failing when absent or not a string.
    pub fn require_str(&self, from_stack: &str, key: &str) -> anyhow::Result<&str> {
        self.require(from_stack, key)?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("input '{from_stack}.{key}' is not a string"))
    }

    /// Returns the number of resolved values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let mut inputs = ResolvedInputs::new();
        inputs.insert(&InputRef::new("network", "vpc_id"), json!("vpc-123"));
        inputs.insert(&InputRef::new("network", "cidr"), json!("10.0.0.0/16"));

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.get_str("network", "vpc_id"), Some("vpc-123"));
        assert!(inputs.get("network", "missing").is_none());
    }

    #[test]
    fn test_require_reports_missing_input() {
        let inputs = ResolvedInputs::new();
        let err = inputs.require("search", "endpoint").unwrap_err();
        assert!(err.to_string().contains("search.endpoint"));
    }

    #[test]
    fn test_require_str_rejects_non_string() {
        let mut inputs = ResolvedInputs::new();
        inputs.insert(&InputRef::new("search", "port"), json!(443));

        assert!(inputs.require("search", "port").is_ok());
        assert!(inputs.require_str("search", "port").is_err());
    }
}
