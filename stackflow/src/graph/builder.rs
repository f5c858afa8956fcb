//! Graph construction with validation.

use crate::core::{is_valid_identifier, Stack};
use crate::errors::{CycleError, DanglingReferenceError, GraphError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A validated, acyclic set of stacks.
///
/// Edges run from a producer to every stack that consumes one of its outputs.
#[derive(Debug, Clone)]
pub struct StackGraph {
    stacks: BTreeMap<String, Stack>,
    /// consumer -> producers
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// producer -> consumers
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl StackGraph {
    /// Builds a graph from a stack list.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::DanglingReference` if a non-optional input does not
    /// name a declared output of a stack in the set, and `GraphError::Cycle`
    /// if the induced edges are cyclic.
    pub fn build(stacks: Vec<Stack>) -> Result<Self, GraphError> {
        let mut by_id = BTreeMap::new();
        for stack in stacks {
            if !is_valid_identifier(&stack.id) {
                return Err(GraphError::InvalidStackId(stack.id));
            }
            if let Some(key) = stack.declared_outputs.iter().find(|k| !is_valid_identifier(k)) {
                return Err(GraphError::InvalidOutputKey {
                    stack: stack.id.clone(),
                    key: key.clone(),
                });
            }
            if by_id.contains_key(&stack.id) {
                return Err(GraphError::DuplicateStack(stack.id));
            }
            by_id.insert(stack.id.clone(), stack);
        }

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for id in by_id.keys() {
            dependencies.insert(id.clone(), BTreeSet::new());
            dependents.insert(id.clone(), BTreeSet::new());
        }

        for (id, stack) in &by_id {
            for input in &stack.required_inputs {
                let declared = by_id
                    .get(&input.from_stack)
                    .is_some_and(|producer| producer.declared_outputs.contains(&input.output_key));

                if !declared {
                    if input.optional {
                        debug!(stack = %id, input = %input, "Optional input has no producer; ignoring");
                        continue;
                    }
                    return Err(DanglingReferenceError::new(
                        id,
                        &input.from_stack,
                        &input.output_key,
                    )
                    .into());
                }

                if let Some(deps) = dependencies.get_mut(id) {
                    deps.insert(input.from_stack.clone());
                }
                if let Some(consumers) = dependents.get_mut(&input.from_stack) {
                    consumers.insert(id.clone());
                }
            }
        }

        let graph = Self {
            stacks: by_id,
            dependencies,
            dependents,
        };
        graph.detect_cycles()?;
        Ok(graph)
    }

    /// Returns the number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if the graph has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Gets a stack by id.
    #[must_use]
    pub fn stack(&self, id: &str) -> Option<&Stack> {
        self.stacks.get(id)
    }

    /// Iterates stacks in ascending id order.
    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.values()
    }

    /// Producers the given stack consumes from.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(id)
    }

    /// Consumers of the given stack's outputs.
    #[must_use]
    pub fn dependents_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(id)
    }

    /// All `(producer, consumer)` edges in ascending order.
    #[must_use]
    pub fn edges(&self) -> Vec<(String, String)> {
        self.dependents
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.clone(), to.clone())))
            .collect()
    }

    /// Walks producer -> consumer edges so the reported cycle reads in
    /// data-flow order. The walk keeps its own stack, so long chains cannot
    /// exhaust the thread's stack.
    fn detect_cycles(&self) -> Result<(), CycleError> {
        let no_consumers = BTreeSet::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();

        for root in self.stacks.keys() {
            if !visited.insert(root.as_str()) {
                continue;
            }

            let mut path: Vec<&str> = vec![root.as_str()];
            let mut on_path: BTreeSet<&str> = BTreeSet::from([root.as_str()]);
            let mut pending = vec![self.dependents.get(root).unwrap_or(&no_consumers).iter()];

            while let Some(consumers) = pending.last_mut() {
                match consumers.next() {
                    Some(next) if on_path.contains(next.as_str()) => {
                        let start = path.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                        cycle.push(next.clone());
                        return Err(CycleError::new(cycle));
                    }
                    Some(next) => {
                        if visited.insert(next.as_str()) {
                            path.push(next.as_str());
                            on_path.insert(next.as_str());
                            pending.push(self.dependents.get(next).unwrap_or(&no_consumers).iter());
                        }
                    }
                    None => {
                        pending.pop();
                        if let Some(done) = path.pop() {
                            on_path.remove(done);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InputRef;
    use crate::testing::StaticAction;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn stack(id: &str) -> Stack {
        Stack::new(id, Arc::new(StaticAction::empty()))
    }

    #[test]
    fn test_build_linear_chain() {
        let graph = StackGraph::build(vec![
            stack("a").with_output("out1"),
            stack("b").with_output("out2").with_input(InputRef::new("a", "out1")),
            stack("c").with_input(InputRef::new("b", "out2")),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.edges(),
            vec![
                ("a".to_string(), "b".to_string()),
                ("b".to_string(), "c".to_string()),
            ]
        );
        assert!(graph.dependencies_of("a").unwrap().is_empty());
        assert!(graph.dependents_of("a").unwrap().contains("b"));
    }

    #[test]
    fn test_build_empty_graph() {
        let graph = StackGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_dangling_stack_reference() {
        let err = StackGraph::build(vec![stack("b").with_input(InputRef::new("a", "out1"))])
            .unwrap_err();

        assert_eq!(
            err,
            GraphError::DanglingReference(DanglingReferenceError::new("b", "a", "out1"))
        );
    }

    #[test]
    fn test_dangling_output_key() {
        let err = StackGraph::build(vec![
            stack("a").with_output("out1"),
            stack("b").with_input(InputRef::new("a", "nope")),
        ])
        .unwrap_err();

        assert!(matches!(err, GraphError::DanglingReference(ref e) if e.output_key == "nope"));
    }

    #[test]
    fn test_optional_dangling_reference_is_dropped() {
        let graph = StackGraph::build(vec![
            stack("a"),
            stack("b").with_input(InputRef::optional("a", "maybe")),
            stack("c").with_input(InputRef::optional("ghost", "x")),
        ])
        .unwrap();

        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_optional_declared_reference_keeps_edge() {
        let graph = StackGraph::build(vec![
            stack("a").with_output("maybe"),
            stack("b").with_input(InputRef::optional("a", "maybe")),
        ])
        .unwrap();

        assert_eq!(graph.edges(), vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_cycle_detection() {
        let err = StackGraph::build(vec![
            stack("a").with_output("x").with_input(InputRef::new("c", "z")),
            stack("b").with_output("y").with_input(InputRef::new("a", "x")),
            stack("c").with_output("z").with_input(InputRef::new("b", "y")),
            stack("d"),
        ])
        .unwrap_err();

        match err {
            GraphError::Cycle(cycle) => {
                assert_eq!(cycle.cycle, vec!["a", "b", "c", "a"]);
                assert!(!cycle.contains("d"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = StackGraph::build(vec![stack("a")
            .with_output("x")
            .with_input(InputRef::new("a", "x"))])
        .unwrap_err();

        assert_eq!(err, GraphError::Cycle(CycleError::new(vec!["a".into(), "a".into()])));
    }

    #[test]
    fn test_long_chain_builds() {
        let depth = 50_000;
        let mut stacks = vec![stack("s0").with_output("out")];
        for i in 1..depth {
            stacks.push(
                stack(&format!("s{i}"))
                    .with_output("out")
                    .with_input(InputRef::new(format!("s{}", i - 1), "out")),
            );
        }

        let graph = StackGraph::build(stacks).unwrap();
        assert_eq!(graph.len(), depth);
    }

    #[test]
    fn test_duplicate_stack_id() {
        let err = StackGraph::build(vec![stack("a"), stack("a")]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateStack("a".to_string()));
        assert_eq!(err.error_info().code, "GRAPH-003-DUPLICATE");
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let err = StackGraph::build(vec![stack("bad id")]).unwrap_err();
        assert_eq!(err, GraphError::InvalidStackId("bad id".to_string()));

        let err = StackGraph::build(vec![stack("a").with_output("")]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidOutputKey { .. }));
    }
}
