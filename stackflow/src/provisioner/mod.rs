//! Batch-parallel provisioning with output propagation.

mod abort;
mod action;
mod run;

#[cfg(test)]
mod integration_tests;

pub use abort::RunAbort;
pub use action::{ApplyContext, ProvisioningAction, TeardownContext};
pub use run::{PartialFailure, Provisioner, TeardownFailure};
