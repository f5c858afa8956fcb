//! Run abort signal.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// Asks a running deploy to stop dispatching new batches.
///
/// Stacks already dispatched run to completion, so an external resource is
/// never left mid-transition. Clones share the same signal and only the
/// first reason is kept.
#[derive(Clone, Default)]
pub struct RunAbort {
    state: Arc<AbortState>,
}

impl RunAbort {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the abort.
    pub fn abort(&self, reason: impl Into<String>) {
        if self
            .state
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.state.reason.write() = Some(reason.into());
        }
    }

    /// Returns whether an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Returns the abort reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }
}

impl std::fmt::Debug for RunAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunAbort")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}
