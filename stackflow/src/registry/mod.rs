//! Output registry and persisted deployment state.
//!
//! This module provides:
//! - `OutputRegistry`, the write-once store stacks publish outputs into
//! - `OutputSnapshot`, an immutable copy for reports and persistence
//! - `StateStore` implementations for the last run's outputs

mod output;
mod state;

pub use output::{OutputRegistry, OutputSnapshot};
pub use state::{
    FileStateStore, InMemoryStateStore, PersistedState, RunStatus, StateStore, STATE_FORMAT_VERSION,
};
