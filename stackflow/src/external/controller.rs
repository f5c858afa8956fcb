//! Drives external resources through the worker protocol.

use super::{
    DeadLetter, DeadLetterQueue, ExternalResource, InMemoryDeadLetterQueue,
    InMemoryResourceStore, Operation, ResourcePayload, ResourceState, ResourceStore, RetryPolicy,
    WorkRequest, Worker, WorkerResponse,
};
use crate::config::ControllerConfig;
use crate::errors::{ExternalResourceError, WorkerError};
use crate::events::{
    EventSink, NoOpEventSink, RESOURCE_DEAD_LETTERED, RESOURCE_RETRY, RESOURCE_TRANSITION,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Runs create, update and delete transitions for external resources.
///
/// Each transition is one [`WorkRequest`]: every attempt carries the same
/// idempotency token, times out after the request timeout, and transient
/// failures are retried within the [`RetryPolicy`]. A request that fails for
/// good leaves the resource `Failed` and lands on the dead-letter queue.
///
/// Resource state is written to the [`ResourceStore`] at every state change,
/// so a redelivered or resumed transition picks up where it stopped.
/// Transitions on the same logical id are serialized.
pub struct ExternalResourceController {
    worker: Arc<dyn Worker>,
    store: Arc<dyn ResourceStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
    request_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for ExternalResourceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalResourceController")
            .field("policy", &self.policy)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ExternalResourceController {
    /// Creates a controller with in-memory state and dead-letter storage.
    #[must_use]
    pub fn new(worker: Arc<dyn Worker>, config: &ControllerConfig) -> Self {
        Self {
            worker,
            store: Arc::new(InMemoryResourceStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterQueue::new()),
            events: Arc::new(NoOpEventSink),
            policy: config.retry_policy(),
            request_timeout: config.request_timeout(),
            locks: DashMap::new(),
        }
    }

    /// Sets the resource store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = store;
        self
    }

    /// Sets the dead-letter queue.
    #[must_use]
    pub fn with_dead_letter_queue(mut self, queue: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = queue;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Overrides the retry policy derived from the config.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Loads a resource.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::Store` if the store fails.
    pub async fn get(&self, logical_id: &str) -> Result<Option<ExternalResource>, ExternalResourceError> {
        self.store.get(logical_id).await
    }

    /// Lists every known resource.
    ///
    /// # Errors
    ///
    /// Returns `ExternalResourceError::Store` if the store fails.
    pub async fn list(&self) -> Result<Vec<ExternalResource>, ExternalResourceError> {
        self.store.list().await
    }

    /// Brings a resource to `Created` with the given payload.
    ///
    /// Creates it if it does not exist, updates it if the payload drifted,
    /// and does nothing if it is already `Created` with this payload. A
    /// resource found mid-transition first has that transition finished with
    /// its original token and payload, then is compared against this one. `depends_on` names a backing resource that must be
    /// `Created` before this one is created.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` before dispatch, `DependencyNotReady` if the
    /// backing resource is not created, `InvalidTransition` while a delete
    /// is in flight, and `Failed` once the transition was dead-lettered.
    pub async fn apply(
        &self,
        logical_id: &str,
        payload: &dyn ResourcePayload,
        depends_on: Option<&str>,
    ) -> Result<ExternalResource, ExternalResourceError> {
        payload.validate()?;

        let lock = self.lock_for(logical_id);
        let _guard = lock.lock().await;

        let mut resource = match self.store.get(logical_id).await? {
            Some(resource) => resource,
            None => ExternalResource::declare(logical_id, payload.kind(), payload.to_document()),
        };

        // Finish an interrupted transition with the payload it was started with.
        let in_flight = match resource.state() {
            ResourceState::Creating => Some(Operation::Create),
            ResourceState::Updating => Some(Operation::Update),
            _ => None,
        };
        if let Some(operation) = in_flight {
            debug!(logical_id = %logical_id, operation = %operation, "Resuming interrupted transition");
            resource = self.drive(resource, operation).await?;
        }

        resource.kind = payload.kind().to_string();
        resource.desired_payload = payload.to_document();
        resource.depends_on = depends_on.map(str::to_string);

        let operation = match resource.state() {
            ResourceState::Created if !resource.has_drifted() => {
                debug!(logical_id = %logical_id, "Resource is up to date");
                return Ok(resource);
            }
            ResourceState::Created => {
                self.record(&mut resource, ResourceState::Updating).await?;
                Operation::Update
            }
            ResourceState::Failed if resource.assigned_physical_id().is_some() => {
                self.record(&mut resource, ResourceState::Updating).await?;
                Operation::Update
            }
            ResourceState::NotExists | ResourceState::Deleted | ResourceState::Failed => {
                self.check_dependency(&resource).await?;
                self.record(&mut resource, ResourceState::Creating).await?;
                Operation::Create
            }
            ResourceState::Creating | ResourceState::Updating | ResourceState::Deleting => {
                return Err(ExternalResourceError::InvalidTransition {
                    logical_id: logical_id.to_string(),
                    from: resource.state().to_string(),
                    to: ResourceState::Created.to_string(),
                });
            }
        };

        self.drive(resource, operation).await
    }

    /// Deletes a resource by its physical id.
    ///
    /// Deleting an unknown, never-created or already deleted resource is a
    /// successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` while a create is in flight and `Failed`
    /// once the delete was dead-lettered.
    pub async fn delete(&self, logical_id: &str) -> Result<Option<ExternalResource>, ExternalResourceError> {
        let lock = self.lock_for(logical_id);
        let _guard = lock.lock().await;

        let Some(mut resource) = self.store.get(logical_id).await? else {
            debug!(logical_id = %logical_id, "Delete of unknown resource is a no-op");
            return Ok(None);
        };

        match resource.state() {
            ResourceState::NotExists | ResourceState::Deleted => {
                debug!(logical_id = %logical_id, state = %resource.state(), "Delete is a no-op");
                Ok(Some(resource))
            }
            ResourceState::Failed if resource.assigned_physical_id().is_none() => {
                self.record(&mut resource, ResourceState::Deleted).await?;
                Ok(Some(resource))
            }
            ResourceState::Deleting => self.drive(resource, Operation::Delete).await.map(Some),
            ResourceState::Creating => Err(ExternalResourceError::InvalidTransition {
                logical_id: logical_id.to_string(),
                from: ResourceState::Creating.to_string(),
                to: ResourceState::Deleting.to_string(),
            }),
            ResourceState::Created | ResourceState::Updating | ResourceState::Failed => {
                self.record(&mut resource, ResourceState::Deleting).await?;
                self.drive(resource, Operation::Delete).await.map(Some)
            }
        }
    }

    fn lock_for(&self, logical_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(logical_id.to_string()).or_default().clone()
    }

    async fn check_dependency(&self, resource: &ExternalResource) -> Result<(), ExternalResourceError> {
        let Some(parent) = &resource.depends_on else {
            return Ok(());
        };
        let ready = self
            .store
            .get(parent)
            .await?
            .is_some_and(|p| p.state() == ResourceState::Created);
        if ready {
            Ok(())
        } else {
            Err(ExternalResourceError::DependencyNotReady {
                logical_id: resource.logical_id.clone(),
                depends_on: parent.clone(),
            })
        }
    }

    async fn record(
        &self,
        resource: &mut ExternalResource,
        to: ResourceState,
    ) -> Result<(), ExternalResourceError> {
        let from = resource.state();
        resource.transition(to)?;
        self.persist(resource, from).await
    }

    async fn persist(
        &self,
        resource: &ExternalResource,
        from: ResourceState,
    ) -> Result<(), ExternalResourceError> {
        self.store.put(resource).await?;
        info!(
            logical_id = %resource.logical_id,
            from = %from,
            to = %resource.state(),
            generation = resource.generation,
            "Resource transition"
        );
        self.events.try_emit(
            RESOURCE_TRANSITION,
            Some(json!({
                "logical_id": resource.logical_id,
                "from": from.as_str(),
                "to": resource.state().as_str(),
                "physical_id": resource.physical_id(),
            })),
        );
        Ok(())
    }

    async fn drive(
        &self,
        mut resource: ExternalResource,
        operation: Operation,
    ) -> Result<ExternalResource, ExternalResourceError> {
        let mut request = WorkRequest::new(operation, &resource, self.request_timeout)?;

        loop {
            let (error, response) = match self.attempt(&request).await {
                Ok(response) => match Self::accept(&mut resource, &request, &response) {
                    Ok(from) => {
                        self.persist(&resource, from).await?;
                        return Ok(resource);
                    }
                    Err(error) => (error, Some(response)),
                },
                Err(failure) => failure,
            };

            if error.is_transient() && self.policy.allows_retry(request.attempt) {
                let delay = self.policy.delay_for(request.attempt);
                debug!(
                    logical_id = %request.logical_id,
                    operation = %operation,
                    attempt = request.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying worker request"
                );
                self.events.try_emit(
                    RESOURCE_RETRY,
                    Some(json!({
                        "logical_id": request.logical_id,
                        "operation": operation.as_str(),
                        "attempt": request.attempt,
                        "error": error.to_string(),
                    })),
                );
                tokio::time::sleep(delay).await;
                request.next_attempt(self.request_timeout);
                continue;
            }

            return Err(self.dead_letter(resource, request, error, response).await);
        }
    }

    async fn attempt(
        &self,
        request: &WorkRequest,
    ) -> Result<WorkerResponse, (WorkerError, Option<WorkerResponse>)> {
        let wire = request.to_worker_request();
        let call = self.worker.invoke(&wire);
        match tokio::time::timeout(self.request_timeout, call).await {
            Err(_) => Err((
                WorkerError::Timeout {
                    timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
                },
                None,
            )),
            Ok(Err(error)) => Err((error, None)),
            Ok(Ok(response)) => match response.clone().into_result() {
                Ok(response) => Ok(response),
                Err(error) => Err((error, Some(response))),
            },
        }
    }

    /// Applies a successful response to the resource, returning the prior state.
    fn accept(
        resource: &mut ExternalResource,
        request: &WorkRequest,
        response: &WorkerResponse,
    ) -> Result<ResourceState, WorkerError> {
        let from = resource.state();
        let operation = request.operation;
        let target = match operation {
            Operation::Create => {
                let physical_id = response.physical_id.as_deref().ok_or_else(|| {
                    WorkerError::Permanent("create succeeded without a physical id".to_string())
                })?;
                resource
                    .assign_physical_id(physical_id)
                    .map_err(|err| WorkerError::Permanent(err.to_string()))?;
                ResourceState::Created
            }
            Operation::Update => ResourceState::Created,
            Operation::Delete => ResourceState::Deleted,
        };

        resource
            .transition(target)
            .map_err(|err| WorkerError::Permanent(err.to_string()))?;
        if operation != Operation::Delete {
            resource.last_applied_payload = Some(request.payload.clone());
        }
        Ok(from)
    }

    async fn dead_letter(
        &self,
        mut resource: ExternalResource,
        request: WorkRequest,
        error: WorkerError,
        last_response: Option<WorkerResponse>,
    ) -> ExternalResourceError {
        let from = resource.state();
        let attempts = request.attempt;
        error!(
            logical_id = %resource.logical_id,
            operation = %request.operation,
            attempts,
            error = %error,
            "Worker request failed; dead-lettering"
        );

        if let Err(err) = resource.fail(error.clone()) {
            warn!(logical_id = %resource.logical_id, error = %err, "Could not mark resource failed");
        } else if let Err(err) = self.persist(&resource, from).await {
            warn!(logical_id = %resource.logical_id, error = %err, "Could not persist failed resource");
        }

        self.events.try_emit(
            RESOURCE_DEAD_LETTERED,
            Some(json!({
                "logical_id": resource.logical_id,
                "operation": request.operation.as_str(),
                "attempts": attempts,
                "error": error.to_string(),
            })),
        );
        self.dead_letters
            .push(DeadLetter {
                request,
                error: error.clone(),
                last_response,
                attempts,
                failed_at: Utc::now(),
            })
            .await;

        ExternalResourceError::Failed {
            logical_id: resource.logical_id,
            attempts,
            last_error: error,
        }
    }
}
