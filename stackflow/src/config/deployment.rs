//! Top-level deployment configuration.

use super::{ControllerConfig, StackParameters};
use crate::core::Stack;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Configuration for one deployment of a stack set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment name, used in logs and persisted state.
    pub name: String,
    /// Target region passed through to every stack's parameters as `region`.
    #[serde(default)]
    pub region: Option<String>,
    /// Maximum stacks provisioned concurrently within a batch; 0 means unbounded.
    #[serde(default)]
    pub max_parallelism: usize,
    /// Where to persist outputs between runs; in memory when absent.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Tags every stack's action may attach to what it creates.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Worker invocation settings.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Option values per stack id.
    #[serde(default)]
    pub stacks: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl DeploymentConfig {
    /// Creates a config with the given name and defaults elsewhere.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
            max_parallelism: 0,
            state_file: None,
            tags: BTreeMap::new(),
            controller: ControllerConfig::default(),
            stacks: BTreeMap::new(),
        }
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the document is malformed.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` or `ConfigError::Parse`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the batch parallelism cap.
    #[must_use]
    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    /// Sets the controller settings.
    #[must_use]
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets an option value for a stack.
    #[must_use]
    pub fn with_stack_option(
        mut self,
        stack: impl Into<String>,
        option: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.stacks
            .entry(stack.into())
            .or_default()
            .insert(option.into(), value);
        self
    }

    /// Validates the configuration against the stacks it will drive.
    ///
    /// Every missing required option is reported, not just the first.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` listing each problem found.
    pub fn validate(&self, stacks: &[Stack]) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push(ConfigError::InvalidOption {
                option: "name".to_string(),
                reason: "deployment name cannot be empty".to_string(),
            });
        }
        if self.controller.request_timeout_ms == 0 {
            problems.push(ConfigError::InvalidOption {
                option: "controller.request_timeout_ms".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        for stack in stacks {
            if let Err(ConfigError::Invalid(missing)) = self.parameters_for(stack) {
                problems.extend(missing);
            }
        }

        for id in self.stacks.keys() {
            if !stacks.iter().any(|s| &s.id == id) {
                warn!(stack = %id, "Configuration has options for an unknown stack");
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Resolves a stack's options, applying defaults.
    ///
    /// The deployment region is exposed as `region` unless the stack
    /// configures its own.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` with one `MissingOption` per absent
    /// required option.
    pub fn parameters_for(&self, stack: &Stack) -> Result<StackParameters, ConfigError> {
        let configured = self.stacks.get(&stack.id);
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();

        if let Some(region) = &self.region {
            values.insert("region".to_string(), serde_json::Value::String(region.clone()));
        }

        for spec in &stack.parameters {
            let value = configured
                .and_then(|options| options.get(&spec.name))
                .cloned()
                .or_else(|| spec.default.clone())
                .or_else(|| values.get(&spec.name).cloned());

            match value {
                Some(value) => {
                    values.insert(spec.name.clone(), value);
                }
                None if spec.required => missing.push(ConfigError::MissingOption {
                    stack: stack.id.clone(),
                    option: spec.name.clone(),
                }),
                None => {}
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::Invalid(missing));
        }

        if let Some(options) = configured {
            for (name, value) in options {
                values.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }

        Ok(values.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterSpec;
    use crate::testing::StaticAction;
    use serde_json::json;
    use std::sync::Arc;

    fn stack(id: &str) -> Stack {
        Stack::new(id, Arc::new(StaticAction::empty()))
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = DeploymentConfig::from_json_str(
            r#"{
                "name": "rag-demo",
                "region": "ap-southeast-1",
                "stacks": {"index": {"index_name": "docs"}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "rag-demo");
        assert_eq!(config.max_parallelism, 0);
        assert_eq!(config.controller.max_attempts, 3);
        assert_eq!(config.stacks["index"]["index_name"], json!("docs"));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            DeploymentConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.json");
        std::fs::write(&path, r#"{"name": "dev"}"#).unwrap();

        assert_eq!(DeploymentConfig::from_file(&path).unwrap().name, "dev");
        assert!(matches!(
            DeploymentConfig::from_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validate_reports_every_missing_option() {
        let stacks = vec![
            stack("db").with_parameter(ParameterSpec::required("instance_class")),
            stack("app")
                .with_parameter(ParameterSpec::required("image"))
                .with_parameter(ParameterSpec::required("port").with_default(json!(8080))),
        ];
        let err = DeploymentConfig::new("prod").validate(&stacks).unwrap_err();

        match err {
            ConfigError::Invalid(problems) => {
                assert_eq!(problems.len(), 2);
                let text: Vec<String> = problems.iter().map(ToString::to_string).collect();
                assert!(text.iter().any(|t| t.contains("'db'") && t.contains("instance_class")));
                assert!(text.iter().any(|t| t.contains("'app'") && t.contains("image")));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        assert!(DeploymentConfig::new("  ").validate(&[]).is_err());
        assert!(DeploymentConfig::new("ok").validate(&[]).is_ok());
    }

    #[test]
    fn test_parameters_for_applies_defaults_and_region() {
        let config = DeploymentConfig::new("prod")
            .with_region("eu-west-1")
            .with_stack_option("index", "index_name", json!("docs"))
            .with_stack_option("index", "extra", json!(true));
        let index = stack("index")
            .with_parameter(ParameterSpec::required("index_name"))
            .with_parameter(ParameterSpec::optional("vector_dimension").with_default(json!(1024)))
            .with_parameter(ParameterSpec::required("region"));

        let params = config.parameters_for(&index).unwrap();

        assert_eq!(params.get_str("index_name"), Some("docs"));
        assert_eq!(params.get_u64("vector_dimension"), Some(1024));
        assert_eq!(params.get_str("region"), Some("eu-west-1"));
        assert_eq!(params.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_stack_option_overrides_region() {
        let config = DeploymentConfig::new("prod")
            .with_region("eu-west-1")
            .with_stack_option("edge", "region", json!("us-east-1"));
        let edge = stack("edge").with_parameter(ParameterSpec::required("region"));

        assert_eq!(config.parameters_for(&edge).unwrap().get_str("region"), Some("us-east-1"));
    }
}
