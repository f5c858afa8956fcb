//! The deployment facade: plan, deploy and destroy against persisted state.

use crate::config::DeploymentConfig;
use crate::core::Stack;
use crate::errors::StackflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::{ExecutionPlan, StackGraph};
use crate::provisioner::{PartialFailure, Provisioner, RunAbort};
use crate::registry::{
    FileStateStore, InMemoryStateStore, OutputRegistry, OutputSnapshot, PersistedState, RunStatus,
    StateStore,
};
use crate::schedule::{CronExpression, ScheduledTrigger, TriggerTarget};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a deploy run that got as far as dispatching stacks.
#[derive(Debug)]
pub struct DeployReport {
    /// Id of this run.
    pub run_id: u64,
    /// The plan the run followed.
    pub plan: ExecutionPlan,
    /// Every committed output, or where the run stopped.
    pub outcome: Result<OutputSnapshot, PartialFailure>,
}

impl DeployReport {
    /// Returns true if every stack completed.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Process exit code: `0` on success, `1` after a partial failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        if self.outcome.is_ok() {
            0
        } else {
            1
        }
    }
}

/// Result of a successful destroy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    /// Id of this run.
    pub run_id: u64,
    /// Stacks torn down, in teardown order.
    pub torn_down: Vec<String>,
    /// Persisted stacks no longer declared. They were not torn down and
    /// their outputs stay in state.
    pub orphaned: Vec<String>,
}

struct Schedule {
    id: String,
    cron: CronExpression,
    target: Arc<dyn TriggerTarget>,
}

/// A validated stack set bound to its configuration and state store.
///
/// One run at a time: a `deploy` or `destroy` started while another is in
/// progress fails with [`StackflowError::RunInProgress`].
pub struct Deployment {
    config: Arc<DeploymentConfig>,
    graph: StackGraph,
    plan: ExecutionPlan,
    state: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
    trigger: Arc<ScheduledTrigger>,
    schedules: Vec<Schedule>,
    abort: Mutex<RunAbort>,
    run_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.config.name)
            .field("stacks", &self.graph.len())
            .field("batches", &self.plan.batches.len())
            .field("schedules", &self.schedules.len())
            .finish_non_exhaustive()
    }
}

impl Deployment {
    /// Validates the configuration against the stacks and builds the plan.
    ///
    /// State goes to the configured `state_file`, or stays in memory when
    /// there is none.
    ///
    /// # Errors
    ///
    /// Returns `StackflowError::Config` listing every missing option, or
    /// `StackflowError::Graph` if the stacks do not form a valid graph.
    pub fn new(config: DeploymentConfig, stacks: Vec<Stack>) -> Result<Self, StackflowError> {
        config.validate(&stacks)?;
        let graph = StackGraph::build(stacks)?;
        let plan = graph.resolve();

        let state: Arc<dyn StateStore> = match &config.state_file {
            Some(path) => Arc::new(FileStateStore::new(path)),
            None => Arc::new(InMemoryStateStore::new()),
        };

        info!(deployment = %config.name, stacks = graph.len(), batches = plan.batches.len(), "Deployment loaded");
        Ok(Self {
            config: Arc::new(config),
            graph,
            plan,
            state,
            events: Arc::new(NoOpEventSink),
            trigger: Arc::new(ScheduledTrigger::new()),
            schedules: Vec::new(),
            abort: Mutex::new(RunAbort::new()),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replaces the state store.
    #[must_use]
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = state;
        self
    }

    /// Sets the event sink used by runs and by the trigger.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.trigger = Arc::new(ScheduledTrigger::new().with_event_sink(Arc::clone(&events)));
        self.events = events;
        self
    }

    /// Declares a schedule, registered on the trigger after each successful
    /// deploy and removed on destroy.
    #[must_use]
    pub fn with_schedule(
        mut self,
        id: impl Into<String>,
        cron: CronExpression,
        target: Arc<dyn TriggerTarget>,
    ) -> Self {
        self.schedules.push(Schedule {
            id: id.into(),
            cron,
            target,
        });
        self
    }

    /// The deployment configuration.
    #[must_use]
    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    /// The validated graph.
    #[must_use]
    pub const fn graph(&self) -> &StackGraph {
        &self.graph
    }

    /// The batches a deploy runs, with no side effects.
    #[must_use]
    pub const fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// The trigger schedules are registered on. Call
    /// [`ScheduledTrigger::spawn`] on it to start ticking.
    #[must_use]
    pub fn trigger(&self) -> Arc<ScheduledTrigger> {
        Arc::clone(&self.trigger)
    }

    /// Aborts the current run. Stacks already dispatched finish; no further
    /// batch starts.
    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.lock().abort(reason);
    }

    /// Persisted outputs of stacks this deployment no longer declares.
    fn orphaned(&self, outputs: &OutputSnapshot) -> OutputSnapshot {
        let mut orphaned = outputs.clone();
        orphaned.retain_stacks(|id| self.graph.stack(id).is_none());
        orphaned
    }

    fn provisioner(&self) -> Provisioner {
        let abort = RunAbort::new();
        *self.abort.lock() = abort.clone();
        Provisioner::new(Arc::clone(&self.config))
            .with_event_sink(Arc::clone(&self.events))
            .with_abort(abort)
    }

    /// Runs every batch of the plan and persists the outcome.
    ///
    /// If the previous run failed, stacks it committed are not applied again.
    /// Outputs of stacks no longer declared are kept in state.
    /// A partial failure is reported in the returned [`DeployReport`], not
    /// as an error; committed stacks stay in place.
    ///
    /// # Errors
    ///
    /// Returns `RunInProgress` if another run holds the lock, or `State` if
    /// state cannot be loaded or saved.
    pub async fn deploy(&self) -> Result<DeployReport, StackflowError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| StackflowError::RunInProgress(self.config.name.clone()))?;

        let previous = self.state.load().await?;
        let run_id = PersistedState::next_run_id(previous.as_ref());
        let (prior_status, prior_outputs, resumable) = match previous {
            Some(state) => (Some(state.status), state.outputs, state.resumable),
            None => (None, OutputSnapshot::new(), BTreeSet::new()),
        };
        let orphaned = self.orphaned(&prior_outputs);

        let registry = if prior_status == Some(RunStatus::Failed) {
            let mut resumed = prior_outputs.clone();
            resumed.retain_stacks(|id| resumable.contains(id) && self.graph.stack(id).is_some());
            info!(deployment = %self.config.name, run_id, resumed = resumed.len(), "Resuming failed run");
            OutputRegistry::from_snapshot(resumed)
        } else {
            OutputRegistry::new()
        };

        let provisioner = self.provisioner();
        let outcome = provisioner
            .run_with_registry(&self.graph, &self.plan, run_id, registry)
            .await;

        let outcome = match outcome {
            Ok(registry) => {
                let snapshot = registry.snapshot();
                let mut saved = orphaned;
                saved.merge(snapshot.clone());
                self.state
                    .save(&PersistedState::new(&self.config.name, run_id, RunStatus::Succeeded, saved))
                    .await?;
                for schedule in &self.schedules {
                    self.trigger
                        .register(&schedule.id, schedule.cron.clone(), Arc::clone(&schedule.target));
                }
                info!(deployment = %self.config.name, run_id, stacks = snapshot.len(), "Deploy succeeded");
                Ok(snapshot)
            }
            Err(failure) => {
                // Earlier outputs stay so destroy can still reach stacks this
                // run never touched. Only this run's commits are resumable.
                let mut outputs = prior_outputs;
                outputs.merge(failure.committed.clone());
                let state = PersistedState::new(&self.config.name, run_id, RunStatus::Failed, outputs)
                    .with_resumable(failure.committed.stack_ids());
                self.state.save(&state).await?;
                warn!(deployment = %self.config.name, run_id, stack = %failure.stack, error = %failure.error, "Deploy failed");
                Err(failure)
            }
        };

        Ok(DeployReport {
            run_id,
            plan: self.plan.clone(),
            outcome,
        })
    }

    /// Tears down every stack recorded in the persisted state, last batch
    /// first, and removes the deployment's schedules.
    ///
    /// # Errors
    ///
    /// Returns `RunInProgress` if another run holds the lock, `State` if
    /// state cannot be loaded or saved, and `Teardown` if a stack could not
    /// be torn down. After a teardown failure the state keeps the outputs of
    /// every stack still standing.
    pub async fn destroy(&self) -> Result<DestroyReport, StackflowError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| StackflowError::RunInProgress(self.config.name.clone()))?;

        let previous = self.state.load().await?;
        let run_id = PersistedState::next_run_id(previous.as_ref());
        let outputs = previous.map(|state| state.outputs).unwrap_or_default();

        for schedule in &self.schedules {
            self.trigger.unregister(&schedule.id);
        }

        let orphaned = self.orphaned(&outputs);
        for orphan in orphaned.stack_ids() {
            warn!(deployment = %self.config.name, stack = %orphan, "Persisted stack is no longer declared; skipping teardown");
        }

        let provisioner = self.provisioner();
        match provisioner.teardown(&self.graph, &self.plan, &outputs).await {
            Ok(torn_down) => {
                let report = DestroyReport {
                    run_id,
                    torn_down,
                    orphaned: orphaned.stack_ids().map(str::to_string).collect(),
                };
                self.state
                    .save(&PersistedState::new(&self.config.name, run_id, RunStatus::Destroyed, orphaned))
                    .await?;
                info!(deployment = %self.config.name, run_id, stacks = report.torn_down.len(), "Destroy succeeded");
                Ok(report)
            }
            Err(failure) => {
                let mut standing = outputs;
                for id in &failure.torn_down {
                    standing.remove_stack(id);
                }
                self.state
                    .save(&PersistedState::new(&self.config.name, run_id, RunStatus::Failed, standing))
                    .await?;
                Err(failure.into())
            }
        }
    }
}
