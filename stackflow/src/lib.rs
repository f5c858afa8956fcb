//! # Stackflow
//!
//! Dependency-ordered provisioning of infrastructure stacks.
//!
//! Stackflow takes a set of stacks that consume each other's outputs and
//! provides:
//!
//! - **Graph validation**: dangling references and cycles are rejected before anything runs
//! - **Batch-parallel provisioning**: independent stacks run together, batches run in order
//! - **Write-once outputs**: a stack's outputs become visible only once all of them are committed
//! - **External resource lifecycles**: idempotent create/update/delete through a worker, with retries and a dead-letter path
//! - **Scheduled triggers**: cron-driven invocations that live outside the deploy lifecycle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackflow::prelude::*;
//!
//! let deployment = Deployment::new(
//!     DeploymentConfig::new("prod"),
//!     vec![
//!         Stack::new("network", network_action).with_output("vpc_id"),
//!         Stack::new("app", app_action).with_input(InputRef::new("network", "vpc_id")),
//!     ],
//! )?;
//!
//! println!("{}", deployment.plan());
//! let report = deployment.deploy().await?;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod deployment;
pub mod errors;
pub mod events;
pub mod external;
pub mod graph;
pub mod observability;
pub mod provisioner;
pub mod registry;
pub mod schedule;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ControllerConfig, DeploymentConfig, ParameterSpec, StackParameters};
    pub use crate::core::{InputRef, ResolvedInputs, Stack, StackOutputs};
    pub use crate::deployment::{DeployReport, DestroyReport, Deployment};
    pub use crate::errors::{
        ConfigError, CronError, ExternalResourceError, GraphError, StackFailure, StackflowError,
        WorkerError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::external::{
        ExternalResourceAction, ExternalResourceController, ResourcePayload, ResourceState,
        SearchIndexPayload, Worker, WorkerRequest, WorkerResponse,
    };
    pub use crate::graph::{ExecutionPlan, StackGraph};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::provisioner::{
        ApplyContext, PartialFailure, ProvisioningAction, Provisioner, RunAbort, TeardownContext,
    };
    pub use crate::registry::{OutputRegistry, OutputSnapshot, StateStore};
    pub use crate::schedule::{CronExpression, FireContext, ScheduledTrigger, TriggerTarget};
}
