//! Stack declarations.

use crate::config::ParameterSpec;
use crate::provisioner::ProvisioningAction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Outputs produced by one stack, keyed by output name.
pub type StackOutputs = BTreeMap<String, serde_json::Value>;

#[allow(clippy::expect_used)]
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,127}$").expect("identifier pattern is valid")
});

/// Returns true if `value` is usable as a stack id or output key.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

/// A reference to another stack's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputRef {
    /// The producing stack.
    pub from_stack: String,
    /// The output key on the producing stack.
    pub output_key: String,
    /// Optional inputs may be absent without invalidating the graph.
    #[serde(default)]
    pub optional: bool,
}

impl InputRef {
    /// Creates a required input reference.
    #[must_use]
    pub fn new(from_stack: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            from_stack: from_stack.into(),
            output_key: output_key.into(),
            optional: false,
        }
    }

    /// Creates an optional input reference.
    #[must_use]
    pub fn optional(from_stack: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::new(from_stack, output_key)
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.from_stack, self.output_key)?;
        if self.optional {
            f.write_str("?")?;
        }
        Ok(())
    }
}

/// A unit of declared infrastructure.
///
/// A stack consumes outputs of other stacks through [`InputRef`]s and
/// publishes its own declared outputs once its action succeeds.
#[derive(Debug, Clone)]
pub struct Stack {
    /// Unique stack id.
    pub id: String,
    /// Output keys the action must produce.
    pub declared_outputs: BTreeSet<String>,
    /// Outputs of other stacks this stack consumes.
    pub required_inputs: BTreeSet<InputRef>,
    /// Non-derived options the stack reads from configuration.
    pub parameters: Vec<ParameterSpec>,
    /// The provisioning action.
    pub action: Arc<dyn ProvisioningAction>,
}

impl Stack {
    /// Creates a stack with no inputs or outputs.
    #[must_use]
    pub fn new(id: impl Into<String>, action: Arc<dyn ProvisioningAction>) -> Self {
        Self {
            id: id.into(),
            declared_outputs: BTreeSet::new(),
            required_inputs: BTreeSet::new(),
            parameters: Vec::new(),
            action,
        }
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>) -> Self {
        self.declared_outputs.insert(key.into());
        self
    }

    /// Declares several outputs.
    #[must_use]
    pub fn with_outputs(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.declared_outputs.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Adds an input reference.
    #[must_use]
    pub fn with_input(mut self, input: InputRef) -> Self {
        self.required_inputs.insert(input);
        self
    }

    /// Adds a configuration parameter.
    #[must_use]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Ids of the stacks this stack reads from, deduplicated.
    #[must_use]
    pub fn upstream_ids(&self) -> BTreeSet<&str> {
        self.required_inputs
            .iter()
            .map(|input| input.from_stack.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticAction;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("network"));
        assert!(is_valid_identifier("search-index_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("dotted.key"));
    }

    #[test]
    fn test_input_ref_display() {
        assert_eq!(InputRef::new("network", "vpc_id").to_string(), "network.vpc_id");
        assert_eq!(InputRef::optional("cache", "url").to_string(), "cache.url?");
    }

    #[test]
    fn test_stack_builder() {
        let stack = Stack::new("app", Arc::new(StaticAction::empty()))
            .with_outputs(["url", "arn"])
            .with_input(InputRef::new("network", "vpc_id"))
            .with_input(InputRef::new("network", "subnet_ids"))
            .with_input(InputRef::optional("cache", "endpoint"))
            .with_parameter(ParameterSpec::required("image"));

        assert_eq!(stack.declared_outputs.len(), 2);
        assert_eq!(stack.required_inputs.len(), 3);
        assert_eq!(stack.upstream_ids().into_iter().collect::<Vec<_>>(), vec!["cache", "network"]);
        assert_eq!(stack.parameters[0].name, "image");
    }
}
