//! Worker fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::WorkerError;
use crate::external::{Operation, Worker, WorkerRequest, WorkerResponse};

#[derive(Debug, Default)]
struct IdempotentState {
    created_by_token: HashMap<String, String>,
    live: BTreeSet<String>,
    next_id: u64,
    requests: Vec<WorkerRequest>,
}

/// A well-behaved worker over an in-memory backend.
///
/// A repeated create token returns the id it created the first time, and
/// deleting something already gone succeeds. Ids are `phys-1`, `phys-2`, ...
#[derive(Debug, Default)]
pub struct IdempotentWorker {
    state: Mutex<IdempotentState>,
}

impl IdempotentWorker {
    /// Creates a worker with an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources that currently exist in the backend.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.state.lock().requests.clone()
    }

    /// Idempotency tokens received, in order.
    #[must_use]
    pub fn tokens_seen(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| r.idempotency_token.clone())
            .collect()
    }
}

#[async_trait]
impl Worker for IdempotentWorker {
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        match request.operation {
            Operation::Create => {
                if let Some(existing) = state.created_by_token.get(&request.idempotency_token) {
                    return Ok(WorkerResponse::created(existing.clone()));
                }
                state.next_id += 1;
                let physical_id = format!("phys-{}", state.next_id);
                state
                    .created_by_token
                    .insert(request.idempotency_token.clone(), physical_id.clone());
                state.live.insert(physical_id.clone());
                Ok(WorkerResponse::created(physical_id))
            }
            Operation::Update => match &request.physical_id {
                Some(id) if state.live.contains(id) => Ok(WorkerResponse::ok()),
                _ => Ok(WorkerResponse::permanent("resource not found")),
            },
            Operation::Delete => {
                if let Some(id) = &request.physical_id {
                    state.live.remove(id);
                }
                Ok(WorkerResponse::ok())
            }
        }
    }
}

type Scripted = Result<WorkerResponse, WorkerError>;

/// Answers from a script, then repeats a fallback.
#[derive(Debug)]
pub struct ScriptedWorker {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    /// Answers each request with the next scripted result. Once the script
    /// runs out every request fails permanently.
    #[must_use]
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with `result`.
    #[must_use]
    pub fn always(result: Scripted) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(result),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        self.requests.lock().push(request.clone());
        let next = self.script.lock().pop_front();
        next.or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Err(WorkerError::Permanent("script exhausted".to_string())))
    }
}

/// Sleeps before answering, to exercise timeouts.
#[derive(Debug)]
pub struct SlowWorker {
    delay: Duration,
    response: WorkerResponse,
    calls: AtomicUsize,
}

impl SlowWorker {
    /// Answers `response` after `delay`.
    #[must_use]
    pub fn new(delay: Duration, response: WorkerResponse) -> Self {
        Self {
            delay,
            response,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of invocations started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for SlowWorker {
    async fn invoke(&self, _request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.response.clone())
    }
}
