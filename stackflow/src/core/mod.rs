//! Core stack types.
//!
//! This module provides:
//! - `Stack` and `InputRef`, the nodes and edges of a deployment
//! - `ResolvedInputs`, the values a stack receives from its producers
//! - id validation shared by stacks and output keys

mod inputs;
mod stack;

pub use inputs::ResolvedInputs;
pub use stack::{is_valid_identifier, InputRef, Stack, StackOutputs};
