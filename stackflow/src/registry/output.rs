//! Thread-safe, write-once output registry.

use crate::core::StackOutputs;
use crate::errors::OutputConflictError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An immutable copy of committed outputs, keyed by stack then output key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSnapshot {
    stacks: BTreeMap<String, StackOutputs>,
}

impl OutputSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets one output value.
    #[must_use]
    pub fn get(&self, stack: &str, key: &str) -> Option<&serde_json::Value> {
        self.stacks.get(stack).and_then(|outputs| outputs.get(key))
    }

    /// Gets all outputs of a stack.
    #[must_use]
    pub fn stack(&self, stack: &str) -> Option<&StackOutputs> {
        self.stacks.get(stack)
    }

    /// Returns true if the stack has committed outputs.
    #[must_use]
    pub fn contains_stack(&self, stack: &str) -> bool {
        self.stacks.contains_key(stack)
    }

    /// Committed stack ids in ascending order.
    pub fn stack_ids(&self) -> impl Iterator<Item = &str> {
        self.stacks.keys().map(String::as_str)
    }

    /// Number of stacks with committed outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if nothing is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Removes a stack's outputs, returning them.
    pub fn remove_stack(&mut self, stack: &str) -> Option<StackOutputs> {
        self.stacks.remove(stack)
    }

    /// Keeps only the stacks for which `keep` returns true.
    pub fn retain_stacks(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.stacks.retain(|id, _| keep(id));
    }

    /// Overlays another snapshot; its stacks replace ours.
    pub fn merge(&mut self, newer: Self) {
        self.stacks.extend(newer.stacks);
    }
}

/// The process-wide store stacks publish outputs into during a run.
///
/// Each stack commits exactly once and always with its full output set, so
/// readers never observe a partial set.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    outputs: RwLock<BTreeMap<String, StackOutputs>>,
}

impl OutputRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a registry from a snapshot, e.g. to resume a failed run.
    #[must_use]
    pub fn from_snapshot(snapshot: OutputSnapshot) -> Self {
        Self {
            outputs: RwLock::new(snapshot.stacks),
        }
    }

    /// Commits the full output set of a stack.
    ///
    /// # Errors
    ///
    /// Returns `OutputConflictError` if the stack already committed.
    pub fn commit(&self, stack: impl Into<String>, outputs: StackOutputs) -> Result<(), OutputConflictError> {
        let stack = stack.into();
        let mut committed = self.outputs.write();

        if committed.contains_key(&stack) {
            return Err(OutputConflictError::new(stack));
        }

        committed.insert(stack, outputs);
        Ok(())
    }

    /// Gets one output value.
    #[must_use]
    pub fn get(&self, stack: &str, key: &str) -> Option<serde_json::Value> {
        self.outputs
            .read()
            .get(stack)
            .and_then(|outputs| outputs.get(key))
            .cloned()
    }

    /// Returns true if the stack has committed.
    #[must_use]
    pub fn contains_stack(&self, stack: &str) -> bool {
        self.outputs.read().contains_key(stack)
    }

    /// Returns the number of committed stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.read().len()
    }

    /// Returns true if nothing is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.read().is_empty()
    }

    /// Copies the current contents.
    #[must_use]
    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            stacks: self.outputs.read().clone(),
        }
    }
}
