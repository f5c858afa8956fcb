//! Lifecycle events.
//!
//! Sinks are handed to the provisioner, the controller and the trigger
//! explicitly; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A deploy or destroy run started.
pub const RUN_STARTED: &str = "run.started";
/// A batch was dispatched.
pub const BATCH_STARTED: &str = "batch.started";
/// A stack's action was invoked.
pub const STACK_STARTED: &str = "stack.started";
/// A stack committed its outputs.
pub const STACK_COMPLETED: &str = "stack.completed";
/// A stack failed.
pub const STACK_FAILED: &str = "stack.failed";
/// Every stack completed.
pub const RUN_COMPLETED: &str = "run.completed";
/// The run stopped on a failure.
pub const RUN_FAILED: &str = "run.failed";
/// The run stopped on an abort request.
pub const RUN_ABORTED: &str = "run.aborted";
/// An external resource changed state.
pub const RESOURCE_TRANSITION: &str = "resource.transition";
/// A worker request is being retried.
pub const RESOURCE_RETRY: &str = "resource.retry";
/// A worker request was dead-lettered.
pub const RESOURCE_DEAD_LETTERED: &str = "resource.dead_lettered";
/// A stack was torn down.
pub const TEARDOWN_STACK: &str = "teardown.stack";
/// A schedule entry was registered.
pub const TRIGGER_REGISTERED: &str = "trigger.registered";
/// A schedule entry fired.
pub const TRIGGER_FIRED: &str = "trigger.fired";
