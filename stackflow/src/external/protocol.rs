//! Request and response shapes of the worker protocol.

use super::ExternalResource;
use crate::errors::{ExternalResourceError, PayloadError, WorkerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Lifecycle operation requested from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create the resource.
    Create,
    /// Update the resource in place.
    Update,
    /// Delete the resource.
    Delete,
}

impl Operation {
    /// Returns the operation name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the idempotency token for one transition of a resource.
#[must_use]
pub fn idempotency_token(logical_id: &str, operation: Operation, generation: u64) -> String {
    let combined = format!("{logical_id}:{operation}:{generation}");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("idem:{}", hex::encode(&result[..16]))
}

/// One lifecycle transition being driven through a worker.
///
/// Lives from the start of a transition until a terminal response arrives.
/// Every attempt reuses the same idempotency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// The operation.
    pub operation: Operation,
    /// Logical resource id.
    pub logical_id: String,
    /// Physical id for update and delete.
    pub physical_id: Option<String>,
    /// Payload document.
    pub payload: serde_json::Value,
    /// Stable token for this transition.
    pub idempotency_token: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Deadline of the current attempt.
    pub deadline: DateTime<Utc>,
}

impl WorkRequest {
    /// Builds the request for the resource's current transition.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::InvalidPayload` if an update or delete
    /// has no physical id to reference.
    pub fn new(
        operation: Operation,
        resource: &ExternalResource,
        timeout: Duration,
    ) -> Result<Self, ExternalResourceError> {
        let physical_id = match operation {
            Operation::Create => None,
            Operation::Update | Operation::Delete => Some(
                resource
                    .assigned_physical_id()
                    .ok_or_else(|| {
                        PayloadError::new(
                            &resource.kind,
                            "physical_id",
                            format!("{operation} requires a physical id"),
                        )
                    })?
                    .to_string(),
            ),
        };

        Ok(Self {
            operation,
            logical_id: resource.logical_id.clone(),
            physical_id,
            payload: resource.desired_payload.clone(),
            idempotency_token: idempotency_token(
                &resource.logical_id,
                operation,
                resource.generation,
            ),
            attempt: 1,
            deadline: deadline_after(timeout),
        })
    }

    /// Advances to the next attempt with a fresh deadline.
    pub fn next_attempt(&mut self, timeout: Duration) {
        self.attempt += 1;
        self.deadline = deadline_after(timeout);
    }

    /// The document sent to the worker for the current attempt.
    #[must_use]
    pub fn to_worker_request(&self) -> WorkerRequest {
        WorkerRequest {
            operation: self.operation,
            logical_id: self.logical_id.clone(),
            physical_id: self.physical_id.clone(),
            payload: self.payload.clone(),
            idempotency_token: self.idempotency_token.clone(),
            attempt: self.attempt,
        }
    }
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a worker receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// The operation.
    pub operation: Operation,
    /// Logical resource id.
    pub logical_id: String,
    /// Physical id for update and delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Payload document.
    pub payload: serde_json::Value,
    /// Stable token for the transition.
    pub idempotency_token: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Outcome class of a worker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// The operation took effect, or had already taken effect for this token.
    Success,
    /// Retrying may help.
    TransientError,
    /// Retrying will not help.
    PermanentError,
}

/// What a worker answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Outcome class.
    pub status: WorkerStatus,
    /// Physical id of the created resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkerResponse {
    /// A success carrying a physical id.
    #[must_use]
    pub fn created(physical_id: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Success,
            physical_id: Some(physical_id.into()),
            detail: None,
        }
    }

    /// A success without a physical id.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: WorkerStatus::Success,
            physical_id: None,
            detail: None,
        }
    }

    /// A transient failure.
    #[must_use]
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::TransientError,
            physical_id: None,
            detail: Some(detail.into()),
        }
    }

    /// A permanent failure.
    #[must_use]
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::PermanentError,
            physical_id: None,
            detail: Some(detail.into()),
        }
    }

    /// Sets the detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Splits the response into success or a worker error.
    ///
    /// # Errors
    ///
    /// Returns the matching `WorkerError` for error statuses.
    pub fn into_result(self) -> Result<Self, WorkerError> {
        match self.status {
            WorkerStatus::Success => Ok(self),
            WorkerStatus::TransientError => Err(WorkerError::Transient(self.detail_or_default())),
            WorkerStatus::PermanentError => Err(WorkerError::Permanent(self.detail_or_default())),
        }
    }

    fn detail_or_default(self) -> String {
        self.detail.unwrap_or_else(|| "no detail".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ResourceState;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_token_is_deterministic() {
        let a = idempotency_token("docs-index", Operation::Create, 1);
        let b = idempotency_token("docs-index", Operation::Create, 1);

        assert_eq!(a, b);
        assert!(a.starts_with("idem:"));
        assert_eq!(a.len(), "idem:".len() + 32);
        assert_ne!(a, idempotency_token("docs-index", Operation::Delete, 1));
        assert_ne!(a, idempotency_token("docs-index", Operation::Create, 2));
    }

    #[test]
    fn test_update_requires_physical_id() {
        let resource = ExternalResource::declare("idx", "search_index", json!({}));
        let err = WorkRequest::new(Operation::Update, &resource, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ExternalResourceError::InvalidPayload(_)));
    }

    #[test]
    fn test_attempts_keep_token() {
        let mut resource = ExternalResource::declare("idx", "search_index", json!({"a": 1}));
        resource.transition(ResourceState::Creating).unwrap();

        let mut request = WorkRequest::new(Operation::Create, &resource, Duration::from_secs(60)).unwrap();
        let first = request.to_worker_request();
        request.next_attempt(Duration::from_secs(60));
        let second = request.to_worker_request();

        assert_eq!(first.attempt, 1);
        assert_eq!(second.attempt, 2);
        assert_eq!(first.idempotency_token, second.idempotency_token);
        assert!(request.deadline > Utc::now());
    }

    #[test]
    fn test_response_wire_format() {
        let response: WorkerResponse =
            serde_json::from_str(r#"{"status": "success", "physical_id": "phys-abc"}"#).unwrap();
        assert_eq!(response, WorkerResponse::created("phys-abc"));

        let request = WorkerRequest {
            operation: Operation::Delete,
            logical_id: "idx".into(),
            physical_id: Some("phys-abc".into()),
            payload: json!({}),
            idempotency_token: "idem:00".into(),
            attempt: 1,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["operation"], json!("delete"));
    }

    #[test]
    fn test_into_result_classifies_errors() {
        assert!(WorkerResponse::ok().into_result().is_ok());
        assert_eq!(
            WorkerResponse::transient("throttled").into_result().unwrap_err(),
            WorkerError::Transient("throttled".into())
        );
        assert!(!WorkerResponse::permanent("mapping conflict")
            .into_result()
            .unwrap_err()
            .is_transient());
    }
}
