//! External resources driven through an idempotent worker protocol.
//!
//! Some resources, such as an index inside a managed search cluster, have
//! no declarative primitive. They are created, updated and deleted by
//! invoking a [`Worker`], and the [`ExternalResourceController`] runs each
//! resource through an explicit state machine:
//!
//! ```text
//! NotExists -> Creating -> Created -> Updating -> Created
//!                  |           |          |
//!                  v           v          v
//!               Failed      Deleting -> Deleted
//! ```
//!
//! [`ExternalResourceAction`] makes a resource a node in the stack graph.

mod action;
mod controller;
mod dead_letter;
#[cfg(feature = "http-worker")]
mod http;
mod payload;
mod protocol;
mod retry;
mod state;
mod store;
mod worker;

pub use action::{ExternalResourceAction, PHYSICAL_ID_OUTPUT};
pub use controller::ExternalResourceController;
pub use dead_letter::{DeadLetter, DeadLetterQueue, InMemoryDeadLetterQueue};
#[cfg(feature = "http-worker")]
pub use http::HttpWorker;
pub use payload::{
    DocumentPayload, ResourcePayload, SearchIndexPayload, SearchService, DEFAULT_VECTOR_DIMENSION,
    MAX_VECTOR_DIMENSION,
};
pub use protocol::{idempotency_token, Operation, WorkRequest, WorkerRequest, WorkerResponse, WorkerStatus};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
pub use state::{ExternalResource, ResourceState};
pub use store::{FileResourceStore, InMemoryResourceStore, ResourceStore};
pub use worker::Worker;
