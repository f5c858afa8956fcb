//! Lifecycle state of one external resource.

use crate::errors::{ExternalResourceError, WorkerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an external resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Declared but never created.
    NotExists,
    /// A create request is in flight.
    Creating,
    /// The resource exists with its physical id.
    Created,
    /// An update request is in flight.
    Updating,
    /// A delete request is in flight.
    Deleting,
    /// The resource was deleted.
    Deleted,
    /// The last transition failed; see `last_error`.
    Failed,
}

impl ResourceState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotExists => "not_exists",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }

    /// Returns true while a worker request is outstanding.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }

    /// Returns true for states in which the physical id is exposed.
    #[must_use]
    pub const fn exposes_physical_id(&self) -> bool {
        matches!(self, Self::Created | Self::Updating | Self::Deleting)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource provisioned through the worker protocol.
///
/// The physical id is visible only while the resource is `Created`,
/// `Updating` or `Deleting`. Once assigned it is kept until the resource is
/// recreated after `Deleted`, and a different id is never accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResource {
    /// Stable logical id.
    pub logical_id: String,
    /// Payload kind, e.g. `search_index`.
    pub kind: String,
    /// Payload the next transition should apply.
    pub desired_payload: serde_json::Value,
    /// Payload of the last successful create or update.
    pub last_applied_payload: Option<serde_json::Value>,
    /// Logical id of the backing resource that must be `Created` first.
    #[serde(default)]
    pub depends_on: Option<String>,
    /// Bumped each time a new transition starts; part of the idempotency token.
    pub generation: u64,
    /// Error that moved the resource to `Failed`.
    #[serde(default)]
    pub last_error: Option<WorkerError>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
    state: ResourceState,
    assigned_physical_id: Option<String>,
}

impl ExternalResource {
    /// Declares a resource that does not exist yet.
    #[must_use]
    pub fn declare(
        logical_id: impl Into<String>,
        kind: impl Into<String>,
        desired_payload: serde_json::Value,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            kind: kind.into(),
            desired_payload,
            last_applied_payload: None,
            depends_on: None,
            generation: 0,
            last_error: None,
            updated_at: Utc::now(),
            state: ResourceState::NotExists,
            assigned_physical_id: None,
        }
    }

    /// Sets the backing resource.
    #[must_use]
    pub fn with_depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on = Some(logical_id.into());
        self
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ResourceState {
        self.state
    }

    /// Physical id, if the current state exposes one.
    #[must_use]
    pub fn physical_id(&self) -> Option<&str> {
        if self.state.exposes_physical_id() {
            self.assigned_physical_id.as_deref()
        } else {
            None
        }
    }

    /// Physical id assigned by the last successful create, whatever the state.
    #[must_use]
    pub fn assigned_physical_id(&self) -> Option<&str> {
        self.assigned_physical_id.as_deref()
    }

    /// Returns true if the desired payload differs from what was last applied.
    #[must_use]
    pub fn has_drifted(&self) -> bool {
        self.last_applied_payload.as_ref() != Some(&self.desired_payload)
    }

    /// Returns true if moving to `to` is allowed from the current state.
    #[must_use]
    pub fn can_transition(&self, to: ResourceState) -> bool {
        use ResourceState as S;

        let has_id = self.assigned_physical_id.is_some();
        match (self.state, to) {
            (S::NotExists | S::Deleted, S::Creating)
            | (S::Creating | S::Updating, S::Created | S::Failed)
            | (S::Created | S::Updating, S::Deleting)
            | (S::Created, S::Updating)
            | (S::Deleting, S::Deleted | S::Failed) => true,
            (S::Failed, S::Creating | S::Deleted) => !has_id,
            (S::Failed, S::Updating | S::Deleting) => has_id,
            _ => false,
        }
    }

    /// Moves to `to`.
    ///
    /// Starting a transition from a settled state bumps `generation`.
    /// Recreating after `Deleted` forgets the old physical id.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::InvalidTransition` if the move is not allowed.
    pub fn transition(&mut self, to: ResourceState) -> Result<(), ExternalResourceError> {
        if !self.can_transition(to) {
            return Err(ExternalResourceError::InvalidTransition {
                logical_id: self.logical_id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        if to.is_in_flight() && !self.state.is_in_flight() {
            self.generation += 1;
        }
        if self.state == ResourceState::Deleted && to == ResourceState::Creating {
            self.assigned_physical_id = None;
            self.last_applied_payload = None;
        }
        if to != ResourceState::Failed {
            self.last_error = None;
        }

        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records the physical id returned by a successful create.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::PhysicalIdChanged` if a different id
    /// was assigned earlier.
    pub fn assign_physical_id(&mut self, physical_id: &str) -> Result<(), ExternalResourceError> {
        match &self.assigned_physical_id {
            Some(existing) if existing != physical_id => {
                Err(ExternalResourceError::PhysicalIdChanged {
                    logical_id: self.logical_id.clone(),
                    existing: existing.clone(),
                    proposed: physical_id.to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.assigned_physical_id = Some(physical_id.to_string());
                Ok(())
            }
        }
    }

    /// Moves to `Failed`, keeping the error.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::InvalidTransition` if no request was in flight.
    pub fn fail(&mut self, error: WorkerError) -> Result<(), ExternalResourceError> {
        self.transition(ResourceState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resource() -> ExternalResource {
        ExternalResource::declare("docs-index", "search_index", json!({"index_name": "docs"}))
    }

    fn created() -> ExternalResource {
        let mut resource = resource();
        resource.transition(ResourceState::Creating).unwrap();
        resource.assign_physical_id("phys-abc").unwrap();
        resource.transition(ResourceState::Created).unwrap();
        resource
    }

    #[test]
    fn test_physical_id_only_exposed_while_live() {
        let mut resource = resource();
        resource.transition(ResourceState::Creating).unwrap();
        resource.assign_physical_id("phys-abc").unwrap();
        assert_eq!(resource.physical_id(), None);

        resource.transition(ResourceState::Created).unwrap();
        assert_eq!(resource.physical_id(), Some("phys-abc"));

        resource.transition(ResourceState::Deleting).unwrap();
        assert_eq!(resource.physical_id(), Some("phys-abc"));

        resource.transition(ResourceState::Deleted).unwrap();
        assert_eq!(resource.physical_id(), None);
        assert_eq!(resource.assigned_physical_id(), Some("phys-abc"));
    }

    #[test]
    fn test_physical_id_never_changes() {
        let mut resource = created();
        assert!(resource.assign_physical_id("phys-abc").is_ok());

        let err = resource.assign_physical_id("phys-xyz").unwrap_err();
        assert!(matches!(err, ExternalResourceError::PhysicalIdChanged { .. }));
        assert_eq!(resource.assigned_physical_id(), Some("phys-abc"));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut resource = resource();
        assert!(resource.transition(ResourceState::Created).is_err());
        assert!(resource.transition(ResourceState::Deleting).is_err());

        resource.transition(ResourceState::Creating).unwrap();
        assert!(resource.transition(ResourceState::Deleting).is_err());
        assert!(resource.transition(ResourceState::Updating).is_err());
    }

    #[test]
    fn test_generation_bumps_per_transition_not_per_redelivery() {
        let mut resource = resource();
        resource.transition(ResourceState::Creating).unwrap();
        assert_eq!(resource.generation, 1);
        resource.assign_physical_id("phys-abc").unwrap();
        resource.transition(ResourceState::Created).unwrap();
        assert_eq!(resource.generation, 1);

        resource.transition(ResourceState::Updating).unwrap();
        assert_eq!(resource.generation, 2);
        resource.transition(ResourceState::Deleting).unwrap();
        assert_eq!(resource.generation, 2);
    }

    #[test]
    fn test_recreate_after_delete_clears_id() {
        let mut resource = created();
        resource.transition(ResourceState::Deleting).unwrap();
        resource.transition(ResourceState::Deleted).unwrap();
        resource.transition(ResourceState::Creating).unwrap();

        assert_eq!(resource.assigned_physical_id(), None);
        assert!(resource.assign_physical_id("phys-new").is_ok());
    }

    #[test]
    fn test_failed_recovery_depends_on_assigned_id() {
        let mut never_created = resource();
        never_created.transition(ResourceState::Creating).unwrap();
        never_created.fail(WorkerError::Permanent("bad mapping".into())).unwrap();
        assert_eq!(never_created.last_error, Some(WorkerError::Permanent("bad mapping".into())));
        assert!(never_created.can_transition(ResourceState::Creating));
        assert!(!never_created.can_transition(ResourceState::Deleting));

        let mut failed_update = created();
        failed_update.transition(ResourceState::Updating).unwrap();
        failed_update.fail(WorkerError::Timeout { timeout_ms: 10 }).unwrap();
        assert_eq!(failed_update.physical_id(), None);
        assert!(failed_update.can_transition(ResourceState::Deleting));
        assert!(!failed_update.can_transition(ResourceState::Creating));

        failed_update.transition(ResourceState::Deleting).unwrap();
        assert_eq!(failed_update.physical_id(), Some("phys-abc"));
        assert_eq!(failed_update.last_error, None);
    }

    #[test]
    fn test_drift_detection() {
        let mut resource = created();
        assert!(resource.has_drifted());
        resource.last_applied_payload = Some(resource.desired_payload.clone());
        assert!(!resource.has_drifted());
        resource.desired_payload = json!({"index_name": "docs-v2"});
        assert!(resource.has_drifted());
    }
}
