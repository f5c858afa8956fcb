//! The worker seam.

use super::{WorkerRequest, WorkerResponse};
use crate::errors::WorkerError;
use async_trait::async_trait;

/// Something that carries out create, update and delete requests.
///
/// Implementations must treat a repeated token as the same request:
/// "already exists with this token" and "already deleted" are successes.
/// Returning `Err` is equivalent to answering with the matching error status.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Handles one attempt of a request.
    async fn invoke(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError>;
}
