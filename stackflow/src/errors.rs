//! Error types for the stackflow orchestrator.
//!
//! Graph-construction errors are fatal before any side effect happens.
//! Provisioning, teardown and worker errors are reported with the stack or
//! logical resource they belong to so an operator can act on them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::provisioner::{PartialFailure, TeardownFailure};

/// The main error type for stackflow operations.
#[derive(Debug, Error)]
pub enum StackflowError {
    /// The stack set does not form a valid graph.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// Configuration failed startup validation.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A deploy run stopped before every stack completed.
    #[error("{0}")]
    PartialFailure(Box<PartialFailure>),

    /// A destroy run stopped before every stack was torn down.
    #[error("{0}")]
    Teardown(Box<TeardownFailure>),

    /// Persisted state could not be read or written.
    #[error("{0}")]
    State(#[from] StateError),

    /// An external resource lifecycle failed.
    #[error("{0}")]
    ExternalResource(#[from] ExternalResourceError),

    /// A schedule expression could not be parsed.
    #[error("{0}")]
    Cron(#[from] CronError),

    /// Another deploy or destroy is running against the same deployment.
    #[error("A run is already in progress for deployment '{0}'")]
    RunInProgress(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StackflowError {
    /// Process exit code for this error.
    ///
    /// `1` for runs that started and failed, `2` for anything rejected
    /// before a run could start.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PartialFailure(_) | Self::Teardown(_) | Self::ExternalResource(_) => 1,
            _ => 2,
        }
    }
}

impl From<PartialFailure> for StackflowError {
    fn from(err: PartialFailure) -> Self {
        Self::PartialFailure(Box::new(err))
    }
}

impl From<TeardownFailure> for StackflowError {
    fn from(err: TeardownFailure) -> Self {
        Self::Teardown(Box::new(err))
    }
}

/// Diagnostic metadata attached to graph errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when the stack dependency edges form a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cycle detected in stack graph: {}", cycle.join(" -> "))]
pub struct CycleError {
    /// Stack ids on the cycle, in edge order, first id repeated at the end.
    pub cycle: Vec<String>,
}

impl CycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }

    /// Returns true if the given stack lies on the cycle.
    #[must_use]
    pub fn contains(&self, stack: &str) -> bool {
        self.cycle.iter().any(|s| s == stack)
    }
}

/// Error raised when a required input points at an output nobody declares.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stack '{stack}' requires '{from_stack}.{output_key}' which no stack declares")]
pub struct DanglingReferenceError {
    /// The consuming stack.
    pub stack: String,
    /// The referenced producer stack.
    pub from_stack: String,
    /// The referenced output key.
    pub output_key: String,
}

impl DanglingReferenceError {
    /// Creates a new dangling reference error.
    #[must_use]
    pub fn new(
        stack: impl Into<String>,
        from_stack: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            stack: stack.into(),
            from_stack: from_stack.into(),
            output_key: output_key.into(),
        }
    }
}

/// Errors raised while building a [`crate::graph::StackGraph`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The induced edge set contains a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// A non-optional input does not resolve.
    #[error("{0}")]
    DanglingReference(#[from] DanglingReferenceError),

    /// Two stacks share an id.
    #[error("Duplicate stack id '{0}'")]
    DuplicateStack(String),

    /// A stack id is empty or contains unsupported characters.
    #[error("Invalid stack id '{0}'")]
    InvalidStackId(String),

    /// A declared output key is empty or contains unsupported characters.
    #[error("Stack '{stack}' declares invalid output key '{key}'")]
    InvalidOutputKey {
        /// The declaring stack.
        stack: String,
        /// The offending key.
        key: String,
    },
}

impl GraphError {
    /// Returns diagnostic metadata for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::Cycle(err) => ErrorInfo::new(
                "GRAPH-001-CYCLE",
                format!("Stack graph contains a dependency cycle: {}", err.cycle.join(" -> ")),
            )
            .with_fix_hint("Remove one of the output references on the cycle."),
            Self::DanglingReference(err) => ErrorInfo::new(
                "GRAPH-002-DANGLING",
                format!("Output '{}.{}' is not declared", err.from_stack, err.output_key),
            )
            .with_fix_hint("Declare the output on the producing stack or mark the input optional.")
            .with_context_entry("stack", &err.stack),
            Self::DuplicateStack(id) => {
                ErrorInfo::new("GRAPH-003-DUPLICATE", format!("Stack '{id}' is declared twice"))
                    .with_fix_hint("Give every stack a unique id.")
            }
            Self::InvalidStackId(id) => {
                ErrorInfo::new("GRAPH-004-INVALID_ID", format!("Stack id '{id}' is not valid"))
                    .with_fix_hint(
                        "Stack ids start with a letter and contain only letters, digits, '-' or '_'.",
                    )
            }
            Self::InvalidOutputKey { stack, key } => ErrorInfo::new(
                "GRAPH-005-INVALID_OUTPUT",
                format!("Output key '{key}' is not valid"),
            )
            .with_context_entry("stack", stack),
        }
    }
}

/// A required input was missing from the output registry at provisioning time.
///
/// Graph validation should make this unreachable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stack '{stack}' could not resolve input '{from_stack}.{output_key}'")]
pub struct UnresolvedInputError {
    /// The consuming stack.
    pub stack: String,
    /// The producer stack.
    pub from_stack: String,
    /// The missing output key.
    pub output_key: String,
}

/// A stack's provisioning action failed.
#[derive(Debug, Error)]
#[error("Provisioning stack '{stack}' failed: {error:#}")]
pub struct ProvisionError {
    /// The failing stack.
    pub stack: String,
    /// The collaborator error.
    pub error: anyhow::Error,
}

/// A stack's teardown action failed.
#[derive(Debug, Error)]
#[error("Tearing down stack '{stack}' failed: {error:#}")]
pub struct TeardownError {
    /// The failing stack.
    pub stack: String,
    /// The collaborator error.
    pub error: anyhow::Error,
}

/// Why a single stack did not complete during a run.
#[derive(Debug, Error)]
pub enum StackFailure {
    /// The provisioning action returned an error.
    #[error("{0}")]
    Provision(#[from] ProvisionError),

    /// A required input was not present in the registry.
    #[error("{0}")]
    UnresolvedInput(#[from] UnresolvedInputError),

    /// The action returned an output set that does not match its declaration.
    #[error("{0}")]
    OutputMismatch(#[from] OutputMismatchError),

    /// The stack's outputs were already committed in this run.
    #[error("{0}")]
    OutputConflict(#[from] OutputConflictError),

    /// The stack's parameters could not be resolved.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run was aborted before this stack was dispatched.
    #[error("Run aborted before stack was dispatched: {reason}")]
    Aborted {
        /// The abort reason.
        reason: String,
    },

    /// The task running the stack panicked.
    #[error("Stack task panicked: {0}")]
    Panicked(String),
}

/// The outputs returned by an action differ from the declared output set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stack '{stack}' returned mismatched outputs (missing: {missing:?}, undeclared: {undeclared:?})")]
pub struct OutputMismatchError {
    /// The stack.
    pub stack: String,
    /// Declared keys the action did not return.
    pub missing: Vec<String>,
    /// Returned keys the stack never declared.
    pub undeclared: Vec<String>,
}

/// A stack tried to commit outputs twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Outputs for stack '{stack}' are already committed")]
pub struct OutputConflictError {
    /// The stack.
    pub stack: String,
}

impl OutputConflictError {
    /// Creates a new output conflict error.
    #[must_use]
    pub fn new(stack: impl Into<String>) -> Self {
        Self { stack: stack.into() }
    }
}

/// Configuration errors, raised at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option has no value and no default.
    #[error("Stack '{stack}' is missing required option '{option}'")]
    MissingOption {
        /// The stack declaring the option.
        stack: String,
        /// The option name.
        option: String,
    },

    /// An option value is not acceptable.
    #[error("Invalid option '{option}': {reason}")]
    InvalidOption {
        /// The option name.
        option: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Several problems were found at once.
    #[error("Invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ConfigError>),

    /// The configuration document could not be parsed.
    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("Configuration IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted state errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the state file failed.
    #[error("State IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The state document could not be (de)serialized.
    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state document uses a format this version cannot read.
    #[error("Unsupported state format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
}

/// Errors returned by a single worker invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerError {
    /// The worker reported a retryable failure.
    #[error("Transient worker error: {0}")]
    Transient(String),

    /// The worker reported a failure that retrying will not fix.
    #[error("Permanent worker error: {0}")]
    Permanent(String),

    /// The invocation did not answer before its deadline.
    #[error("Worker invocation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },
}

impl WorkerError {
    /// Returns true if the error counts against the retry budget.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }
}

/// A payload failed schema validation before dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid {kind} payload field '{field}': {reason}")]
pub struct PayloadError {
    /// The payload kind.
    pub kind: String,
    /// The offending field.
    pub field: String,
    /// Why it was rejected.
    pub reason: String,
}

impl PayloadError {
    /// Creates a new payload error.
    #[must_use]
    pub fn new(kind: impl Into<String>, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A cron expression could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CronError {
    /// The expression does not have five fields.
    #[error("Cron expression '{expression}' has {found} fields, expected 5")]
    FieldCount {
        /// The expression.
        expression: String,
        /// Fields found.
        found: usize,
    },

    /// A field value is malformed or out of range.
    #[error("Invalid cron {field} field '{value}': {reason}")]
    InvalidField {
        /// Field name, e.g. "minute".
        field: &'static str,
        /// The offending text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An `@` alias that is not recognised.
    #[error("Unknown cron alias '{0}'")]
    UnknownAlias(String),
}

/// Errors raised by the external resource controller.
#[derive(Debug, Clone, Error)]
pub enum ExternalResourceError {
    /// The lifecycle transition ended in `Failed`; the request was dead-lettered.
    #[error("Resource '{logical_id}' failed after {attempts} attempt(s): {last_error}")]
    Failed {
        /// The logical resource id.
        logical_id: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// The last worker error.
        last_error: WorkerError,
    },

    /// A resource's backing collection has not reached `Created`.
    #[error("Resource '{logical_id}' depends on '{depends_on}' which is not created")]
    DependencyNotReady {
        /// The dependent resource.
        logical_id: String,
        /// The backing resource.
        depends_on: String,
    },

    /// The requested state change is not allowed from the current state.
    #[error("Resource '{logical_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The logical resource id.
        logical_id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A physical id was reassigned to a different value.
    #[error("Resource '{logical_id}' already has physical id '{existing}', refusing '{proposed}'")]
    PhysicalIdChanged {
        /// The logical resource id.
        logical_id: String,
        /// The id assigned first.
        existing: String,
        /// The conflicting id.
        proposed: String,
    },

    /// A request was malformed before dispatch.
    #[error("{0}")]
    InvalidPayload(#[from] PayloadError),

    /// The resource store failed.
    #[error("Resource store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stack", "network");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stack"), Some(&"network".to_string()));
    }

    #[test]
    fn test_cycle_error_display() {
        let err = CycleError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert!(err.contains("b"));
        assert!(!err.contains("d"));
        assert_eq!(GraphError::from(err).error_info().code, "GRAPH-001-CYCLE");
    }

    #[test]
    fn test_dangling_reference_info() {
        let err = GraphError::from(DanglingReferenceError::new("app", "network", "vpc_id"));

        assert!(err.to_string().contains("network.vpc_id"));
        let info = err.error_info();
        assert_eq!(info.code, "GRAPH-002-DANGLING");
        assert_eq!(info.context.get("stack"), Some(&"app".to_string()));
    }

    #[test]
    fn test_worker_error_transience() {
        assert!(WorkerError::Transient("busy".into()).is_transient());
        assert!(WorkerError::Timeout { timeout_ms: 10 }.is_transient());
        assert!(!WorkerError::Permanent("bad request".into()).is_transient());
    }

    #[test]
    fn test_exit_codes() {
        let graph: StackflowError = GraphError::DuplicateStack("a".into()).into();
        assert_eq!(graph.exit_code(), 2);

        let busy = StackflowError::RunInProgress("prod".into());
        assert_eq!(busy.exit_code(), 2);
    }

    #[test]
    fn test_config_error_aggregate_display() {
        let err = ConfigError::Invalid(vec![
            ConfigError::MissingOption {
                stack: "db".into(),
                option: "region".into(),
            },
            ConfigError::MissingOption {
                stack: "app".into(),
                option: "image".into(),
            },
        ]);

        let text = err.to_string();
        assert!(text.contains("'db' is missing required option 'region'"));
        assert!(text.contains("'app' is missing required option 'image'"));
    }
}
