//! Test doubles for provisioning actions, workers and trigger targets.

mod actions;
mod targets;
mod workers;

pub use actions::{FailingAction, RecordingAction, StaticAction};
pub use targets::RecordingTarget;
pub use workers::{IdempotentWorker, ScriptedWorker, SlowWorker};
