//! Escalation path for requests that failed for good.

use super::{WorkRequest, WorkerResponse};
use crate::errors::WorkerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A request kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The request as last dispatched.
    pub request: WorkRequest,
    /// The error that ended the transition.
    pub error: WorkerError,
    /// The last response, when the worker answered at all.
    pub last_response: Option<WorkerResponse>,
    /// Attempts made.
    pub attempts: u32,
    /// When the request was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Where dead letters go.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Records a dead letter. Must not fail the caller.
    async fn push(&self, letter: DeadLetter);
}

/// In-memory dead-letter queue.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every dead letter.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Removes and returns every dead letter.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock())
    }

    /// Returns the number of dead letters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Returns true if nothing was dead-lettered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn push(&self, letter: DeadLetter) {
        self.letters.lock().push(letter);
    }
}
