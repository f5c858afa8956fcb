//! Provisioner: runs a resolved plan batch by batch.

use super::{ApplyContext, RunAbort, TeardownContext};
use crate::config::{DeploymentConfig, StackParameters};
use crate::core::{ResolvedInputs, Stack, StackOutputs};
use crate::errors::{
    OutputMismatchError, ProvisionError, StackFailure, TeardownError, UnresolvedInputError,
};
use crate::events::{
    EventSink, NoOpEventSink, BATCH_STARTED, RUN_ABORTED, RUN_COMPLETED, RUN_FAILED, RUN_STARTED,
    STACK_COMPLETED, STACK_FAILED, STACK_STARTED, TEARDOWN_STACK,
};
use crate::graph::{ExecutionPlan, StackGraph};
use crate::registry::{OutputRegistry, OutputSnapshot};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// A deploy run stopped before every stack completed.
///
/// Stacks committed before the failure keep their outputs; nothing is
/// rolled back.
#[derive(Debug, Error)]
#[error("Deploy stopped at stack '{stack}': {error}")]
pub struct PartialFailure {
    /// The stack that failed, or the first stack not dispatched on abort.
    pub stack: String,
    /// Why it failed.
    pub error: StackFailure,
    /// Other stacks of the same batch that failed alongside it.
    pub also_failed: Vec<String>,
    /// Every output committed when the run stopped.
    pub committed: OutputSnapshot,
    /// Stacks that completed during this run, in commit order.
    pub completed: Vec<String>,
}

impl PartialFailure {
    /// Returns true if the run stopped because it was aborted.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self.error, StackFailure::Aborted { .. })
    }
}

/// A destroy run stopped before every stack was torn down.
#[derive(Debug, Error)]
#[error("Teardown stopped at stack '{stack}': {error}")]
pub struct TeardownFailure {
    /// The stack whose teardown failed.
    pub stack: String,
    /// The teardown error.
    pub error: TeardownError,
    /// Stacks torn down before the failure.
    pub torn_down: Vec<String>,
    /// Stacks still standing.
    pub remaining: Vec<String>,
}

/// Executes stacks in plan order, feeding each its upstream outputs.
///
/// Stacks of one batch run concurrently, bounded by the deployment's
/// `max_parallelism`. A batch ends only when every stack in it has finished,
/// so the next batch always sees a settled registry. The first failing batch
/// ends the run.
pub struct Provisioner {
    config: Arc<DeploymentConfig>,
    events: Arc<dyn EventSink>,
    abort: RunAbort,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("deployment", &self.config.name)
            .field("abort", &self.abort)
            .finish_non_exhaustive()
    }
}

type StackResult = Result<StackOutputs, StackFailure>;

impl Provisioner {
    /// Creates a provisioner for a deployment.
    #[must_use]
    pub fn new(config: Arc<DeploymentConfig>) -> Self {
        Self {
            config,
            events: Arc::new(NoOpEventSink),
            abort: RunAbort::new(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses an abort signal shared with the caller.
    #[must_use]
    pub fn with_abort(mut self, abort: RunAbort) -> Self {
        self.abort = abort;
        self
    }

    /// A handle that aborts runs of this provisioner.
    #[must_use]
    pub fn abort_handle(&self) -> RunAbort {
        self.abort.clone()
    }

    /// Runs every batch of the plan against an empty registry.
    ///
    /// # Errors
    ///
    /// Returns `PartialFailure` naming the failed stack and the outputs
    /// committed so far.
    pub async fn run(
        &self,
        graph: &StackGraph,
        plan: &ExecutionPlan,
        run_id: u64,
    ) -> Result<OutputRegistry, PartialFailure> {
        self.run_with_registry(graph, plan, run_id, OutputRegistry::new())
            .await
    }

    /// Runs the plan against a pre-populated registry.
    ///
    /// Stacks that already have outputs in the registry are skipped, which
    /// lets a failed run resume from its committed outputs.
    ///
    /// # Errors
    ///
    /// Returns `PartialFailure` naming the failed stack and the outputs
    /// committed so far.
    pub async fn run_with_registry(
        &self,
        graph: &StackGraph,
        plan: &ExecutionPlan,
        run_id: u64,
        registry: OutputRegistry,
    ) -> Result<OutputRegistry, PartialFailure> {
        let started = Instant::now();
        let mut completed = Vec::new();

        info!(
            deployment = %self.config.name,
            run_id,
            batches = plan.batches.len(),
            stacks = plan.stack_count(),
            "Starting run"
        );
        self.events.try_emit(
            RUN_STARTED,
            Some(json!({
                "deployment": self.config.name,
                "run_id": run_id,
                "batches": plan.as_ids(),
            })),
        );

        for batch in &plan.batches {
            let pending: Vec<&Stack> = batch
                .stacks
                .iter()
                .filter(|id| {
                    let done = registry.contains_stack(id);
                    if done {
                        debug!(stack = %id, "Outputs already committed; skipping");
                    }
                    !done
                })
                .filter_map(|id| graph.stack(id))
                .collect();
            if pending.is_empty() {
                continue;
            }

            if let Some(reason) = self.abort.reason() {
                let stack = pending[0].id.clone();
                warn!(run_id, stack = %stack, reason = %reason, "Run aborted");
                self.events.try_emit(
                    RUN_ABORTED,
                    Some(json!({"run_id": run_id, "next_stack": stack, "reason": reason})),
                );
                return Err(PartialFailure {
                    stack,
                    error: StackFailure::Aborted { reason },
                    also_failed: Vec::new(),
                    committed: registry.snapshot(),
                    completed,
                });
            }

            info!(run_id, batch = batch.index + 1, stacks = ?batch.stacks, "Dispatching batch");
            self.events.try_emit(
                BATCH_STARTED,
                Some(json!({"run_id": run_id, "batch": batch.index + 1, "stacks": batch.stacks})),
            );

            let mut failures: Vec<(String, StackFailure)> = Vec::new();
            let mut contexts = Vec::with_capacity(pending.len());
            for stack in &pending {
                match self.prepare(stack, &registry, run_id) {
                    Ok(ctx) => contexts.push(((*stack).clone(), ctx)),
                    Err(failure) => failures.push((stack.id.clone(), failure)),
                }
            }

            if failures.is_empty() {
                for (id, result) in self.dispatch(contexts).await {
                    let committed = result.and_then(|outputs| {
                        let stack = graph.stack(&id).ok_or_else(|| {
                            StackFailure::Panicked(format!("stack '{id}' left the graph"))
                        })?;
                        check_outputs(stack, &outputs)?;
                        registry.commit(&id, outputs)?;
                        Ok(())
                    });
                    match committed {
                        Ok(()) => {
                            info!(run_id, stack = %id, "Stack completed");
                            self.events
                                .try_emit(STACK_COMPLETED, Some(json!({"run_id": run_id, "stack": id})));
                            completed.push(id);
                        }
                        Err(failure) => failures.push((id, failure)),
                    }
                }
            }

            for (id, failure) in &failures {
                error!(run_id, stack = %id, error = %failure, "Stack failed");
                self.events.try_emit(
                    STACK_FAILED,
                    Some(json!({"run_id": run_id, "stack": id, "error": failure.to_string()})),
                );
            }
            let mut failures = failures.into_iter();
            if let Some((stack, error)) = failures.next() {
                self.events.try_emit(
                    RUN_FAILED,
                    Some(json!({"run_id": run_id, "stack": stack, "completed": completed})),
                );
                return Err(PartialFailure {
                    stack,
                    error,
                    also_failed: failures.map(|(id, _)| id).collect(),
                    committed: registry.snapshot(),
                    completed,
                });
            }
        }

        info!(
            run_id,
            completed = completed.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Run completed"
        );
        self.events.try_emit(
            RUN_COMPLETED,
            Some(json!({"run_id": run_id, "completed": completed})),
        );
        Ok(registry)
    }

    /// Resolves a stack's inputs and options before it is dispatched.
    fn prepare(
        &self,
        stack: &Stack,
        registry: &OutputRegistry,
        run_id: u64,
    ) -> Result<ApplyContext, StackFailure> {
        let mut inputs = ResolvedInputs::new();
        for input in &stack.required_inputs {
            match registry.get(&input.from_stack, &input.output_key) {
                Some(value) => inputs.insert(input, value),
                None if input.optional => {
                    debug!(stack = %stack.id, input = %input, "Optional input absent");
                }
                None => {
                    return Err(UnresolvedInputError {
                        stack: stack.id.clone(),
                        from_stack: input.from_stack.clone(),
                        output_key: input.output_key.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(ApplyContext {
            stack_id: stack.id.clone(),
            inputs,
            parameters: self.config.parameters_for(stack)?,
            deployment: self.config.clone(),
            run_id,
        })
    }

    /// Runs one batch and waits for every stack in it.
    async fn dispatch(&self, contexts: Vec<(Stack, ApplyContext)>) -> Vec<(String, StackResult)> {
        let permits = (self.config.max_parallelism > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_parallelism)));

        let handles = contexts.into_iter().map(|(stack, ctx)| {
            let events = self.events.clone();
            let permits = permits.clone();
            let id = stack.id.clone();
            let handle = tokio::spawn(async move {
                let _permit = match permits {
                    Some(permits) => match permits.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(err) => {
                            return Err(StackFailure::Panicked(format!(
                                "parallelism limiter closed: {err}"
                            )));
                        }
                    },
                    None => None,
                };

                debug!(stack = %ctx.stack_id, inputs = ctx.inputs.len(), "Applying stack");
                events.try_emit(
                    STACK_STARTED,
                    Some(json!({"run_id": ctx.run_id, "stack": ctx.stack_id})),
                );
                stack.action.apply(&ctx).await.map_err(|error| {
                    StackFailure::Provision(ProvisionError {
                        stack: stack.id.clone(),
                        error,
                    })
                })
            });
            async move {
                let result = handle
                    .await
                    .unwrap_or_else(|err| Err(StackFailure::Panicked(err.to_string())));
                (id, result)
            }
        });

        join_all(handles).await
    }

    /// Tears stacks down in reverse plan order.
    ///
    /// Only stacks with outputs in `outputs` are torn down. Stacks in one
    /// batch are torn down concurrently; a failure stops the run after that
    /// batch. Returns the ids torn down.
    ///
    /// # Errors
    ///
    /// Returns `TeardownFailure` naming the failed stack and what is still standing.
    pub async fn teardown(
        &self,
        graph: &StackGraph,
        plan: &ExecutionPlan,
        outputs: &OutputSnapshot,
    ) -> Result<Vec<String>, TeardownFailure> {
        let mut torn_down = Vec::new();

        for batch in plan.reversed() {
            let targets: Vec<(Stack, TeardownContext)> = batch
                .stacks
                .iter()
                .rev()
                .filter_map(|id| {
                    let committed = outputs.stack(id)?;
                    let stack = graph.stack(id)?;
                    Some((stack.clone(), self.teardown_context(stack, committed.clone())))
                })
                .collect();
            if targets.is_empty() {
                continue;
            }

            let handles = targets.into_iter().map(|(stack, ctx)| {
                let id = stack.id.clone();
                let handle = tokio::spawn(async move { stack.action.teardown(&ctx).await });
                async move {
                    let result = handle
                        .await
                        .unwrap_or_else(|err| Err(anyhow::anyhow!("teardown task panicked: {err}")));
                    (id, result)
                }
            });

            let mut failed = None;
            for (id, result) in join_all(handles).await {
                match result {
                    Ok(()) => {
                        info!(stack = %id, "Stack torn down");
                        self.events.try_emit(TEARDOWN_STACK, Some(json!({"stack": id})));
                        torn_down.push(id);
                    }
                    Err(err) => {
                        error!(stack = %id, error = %format!("{err:#}"), "Teardown failed");
                        if failed.is_none() {
                            failed = Some(TeardownError { stack: id, error: err });
                        }
                    }
                }
            }

            if let Some(error) = failed {
                let remaining = outputs
                    .stack_ids()
                    .filter(|id| !torn_down.iter().any(|done| done == id))
                    .map(str::to_string)
                    .collect();
                return Err(TeardownFailure {
                    stack: error.stack.clone(),
                    error,
                    torn_down,
                    remaining,
                });
            }
        }

        Ok(torn_down)
    }

    fn teardown_context(&self, stack: &Stack, outputs: StackOutputs) -> TeardownContext {
        let parameters = self.config.parameters_for(stack).unwrap_or_else(|err| {
            warn!(stack = %stack.id, error = %err, "Options no longer resolve; tearing down without them");
            StackParameters::new()
        });
        TeardownContext {
            stack_id: stack.id.clone(),
            outputs,
            parameters,
            deployment: self.config.clone(),
        }
    }
}

/// Checks that an action returned exactly the declared outputs.
fn check_outputs(stack: &Stack, outputs: &StackOutputs) -> Result<(), OutputMismatchError> {
    let missing: Vec<String> = stack
        .declared_outputs
        .iter()
        .filter(|key| !outputs.contains_key(*key))
        .cloned()
        .collect();
    let undeclared: Vec<String> = outputs
        .keys()
        .filter(|key| !stack.declared_outputs.contains(*key))
        .cloned()
        .collect();

    if missing.is_empty() && undeclared.is_empty() {
        Ok(())
    } else {
        Err(OutputMismatchError {
            stack: stack.id.clone(),
            missing,
            undeclared,
        })
    }
}
