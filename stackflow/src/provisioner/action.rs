//! The provisioning action seam.

use crate::config::{DeploymentConfig, StackParameters};
use crate::core::{ResolvedInputs, StackOutputs};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What an action sees when it applies a stack.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// The stack being applied.
    pub stack_id: String,
    /// Upstream outputs this stack consumes.
    pub inputs: ResolvedInputs,
    /// The stack's configured options, defaults applied.
    pub parameters: StackParameters,
    /// The deployment being run.
    pub deployment: Arc<DeploymentConfig>,
    /// Id of the current run.
    pub run_id: u64,
}

/// What an action sees when it tears a stack down.
#[derive(Debug, Clone)]
pub struct TeardownContext {
    /// The stack being torn down.
    pub stack_id: String,
    /// Outputs the stack committed when it was applied.
    pub outputs: StackOutputs,
    /// The stack's configured options, defaults applied.
    pub parameters: StackParameters,
    /// The deployment being run.
    pub deployment: Arc<DeploymentConfig>,
}

/// Creates and destroys the resources behind one stack.
///
/// `apply` must return exactly the stack's declared outputs. Rolling back
/// its own partial work on failure is the action's business.
#[async_trait]
pub trait ProvisioningAction: Send + Sync + fmt::Debug {
    /// Provisions the stack.
    async fn apply(&self, ctx: &ApplyContext) -> anyhow::Result<StackOutputs>;

    /// Tears the stack down.
    async fn teardown(&self, ctx: &TeardownContext) -> anyhow::Result<()>;
}
