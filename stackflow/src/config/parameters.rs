//! Per-stack configuration options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, documented option a stack reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Option name.
    pub name: String,
    /// Whether a value must be supplied when there is no default.
    #[serde(default)]
    pub required: bool,
    /// Value used when the configuration omits the option.
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

impl ParameterSpec {
    /// A required option without a default.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// An optional option.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Option values resolved for one stack, defaults applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackParameters {
    values: BTreeMap<String, serde_json::Value>,
}

impl StackParameters {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Gets a value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    /// Gets a string value.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(serde_json::Value::as_str)
    }

    /// Gets an unsigned integer value.
    #[must_use]
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(serde_json::Value::as_u64)
    }

    /// Gets a string value, failing when absent.
    ///
    /// Intended for use inside provisioning actions.
    pub fn require_str(&self, name: &str) -> anyhow::Result<&str> {
        self.get_str(name)
            .ok_or_else(|| anyhow::anyhow!("parameter '{name}' is missing or not a string"))
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, serde_json::Value)> for StackParameters {
    fn from_iter<T: IntoIterator<Item = (String, serde_json::Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parameter_spec_builders() {
        let spec = ParameterSpec::optional("vector_dimension")
            .with_default(json!(1024))
            .with_description("Embedding dimensionality");

        assert!(!spec.required);
        assert_eq!(spec.default, Some(json!(1024)));
        assert!(ParameterSpec::required("region").required);
    }

    #[test]
    fn test_stack_parameters_accessors() {
        let params = StackParameters::new()
            .with("region", json!("ap-southeast-1"))
            .with("replicas", json!(2));

        assert_eq!(params.get_str("region"), Some("ap-southeast-1"));
        assert_eq!(params.get_u64("replicas"), Some(2));
        assert!(params.require_str("replicas").is_err());
        assert!(params.require_str("zone").is_err());
    }
}
