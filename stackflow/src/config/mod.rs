//! Deployment configuration.
//!
//! Configuration is an explicit value handed to the deployment, the
//! provisioner and the controller at construction time. Nothing here is
//! global.

mod controller;
mod deployment;
mod parameters;

pub use controller::ControllerConfig;
pub use deployment::DeploymentConfig;
pub use parameters::{ParameterSpec, StackParameters};
