//! Stack dependency graph and execution planning.
//!
//! This module provides:
//! - `StackGraph::build`, which validates references and rejects cycles
//! - `resolve`, which layers the graph into parallel batches

mod builder;
mod resolver;

pub use builder::StackGraph;
pub use resolver::{resolve, Batch, ExecutionPlan};
