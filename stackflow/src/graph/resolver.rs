//! Topological layering of a stack graph.

use super::StackGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A set of mutually independent stacks, ordered by ascending id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Zero-based position in the plan.
    pub index: usize,
    /// Stack ids in this batch.
    pub stacks: Vec<String>,
}

impl Batch {
    /// Returns true if the batch contains the stack.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.stacks.iter().any(|s| s == id)
    }
}

/// The ordered batches of a resolved graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Batches in execution order.
    pub batches: Vec<Batch>,
}

impl ExecutionPlan {
    /// Returns the batch index a stack runs in.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.batches.iter().position(|batch| batch.contains(id))
    }

    /// Total number of stacks across all batches.
    #[must_use]
    pub fn stack_count(&self) -> usize {
        self.batches.iter().map(|b| b.stacks.len()).sum()
    }

    /// Stack ids as nested vectors, handy for assertions and logs.
    #[must_use]
    pub fn as_ids(&self) -> Vec<Vec<String>> {
        self.batches.iter().map(|b| b.stacks.clone()).collect()
    }

    /// Batches in reverse order, used for teardown.
    pub fn reversed(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter().rev()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.batches.is_empty() {
            return writeln!(f, "(no stacks)");
        }
        for batch in &self.batches {
            writeln!(f, "batch {}: {}", batch.index + 1, batch.stacks.join(", "))?;
        }
        Ok(())
    }
}

/// Layers the graph with Kahn's algorithm.
///
/// Every stack lands in the first batch after all of its producers.
#[must_use]
pub fn resolve(graph: &StackGraph) -> ExecutionPlan {
    let mut in_degree: BTreeMap<&str, usize> = graph
        .stacks()
        .map(|stack| {
            let count = graph.dependencies_of(&stack.id).map_or(0, |deps| deps.len());
            (stack.id.as_str(), count)
        })
        .collect();

    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(id, _)| (*id).to_string())
        .collect();

    let mut batches = Vec::new();
    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();

        for id in &ready {
            in_degree.remove(id.as_str());
            let Some(consumers) = graph.dependents_of(id) else {
                continue;
            };
            for consumer in consumers {
                if let Some(count) = in_degree.get_mut(consumer.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        next.push(consumer.clone());
                    }
                }
            }
        }

        batches.push(Batch {
            index: batches.len(),
            stacks: std::mem::replace(&mut ready, next),
        });
    }

    debug_assert!(in_degree.is_empty(), "validated graph must be acyclic");
    ExecutionPlan { batches }
}

impl StackGraph {
    /// Resolves this graph into an execution plan.
    #[must_use]
    pub fn resolve(&self) -> ExecutionPlan {
        resolve(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InputRef, Stack};
    use crate::testing::StaticAction;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn stack(id: &str) -> Stack {
        Stack::new(id, Arc::new(StaticAction::empty()))
    }

    fn ids(batches: &[&[&str]]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|b| b.iter().map(|s| (*s).to_string()).collect())
            .collect()
    }

    #[test]
    fn test_linear_chain_batches() {
        let graph = StackGraph::build(vec![
            stack("c").with_input(InputRef::new("b", "out2")),
            stack("a").with_output("out1"),
            stack("b").with_output("out2").with_input(InputRef::new("a", "out1")),
        ])
        .unwrap();

        assert_eq!(graph.resolve().as_ids(), ids(&[&["a"], &["b"], &["c"]]));
    }

    #[test]
    fn test_diamond_batches() {
        let graph = StackGraph::build(vec![
            stack("a").with_output("out"),
            stack("c").with_output("out").with_input(InputRef::new("a", "out")),
            stack("b").with_output("out").with_input(InputRef::new("a", "out")),
            stack("d")
                .with_input(InputRef::new("b", "out"))
                .with_input(InputRef::new("c", "out")),
        ])
        .unwrap();

        let plan = graph.resolve();
        assert_eq!(plan.as_ids(), ids(&[&["a"], &["b", "c"], &["d"]]));
        assert_eq!(plan.position("c"), Some(1));
        assert_eq!(plan.stack_count(), 4);
    }

    #[test]
    fn test_independent_stacks_share_first_batch() {
        let graph = StackGraph::build(vec![stack("zeta"), stack("alpha"), stack("mid")]).unwrap();
        assert_eq!(graph.resolve().as_ids(), ids(&[&["alpha", "mid", "zeta"]]));
    }

    #[test]
    fn test_multiple_inputs_from_one_producer_count_once() {
        let graph = StackGraph::build(vec![
            stack("net").with_outputs(["vpc", "subnets"]),
            stack("app")
                .with_input(InputRef::new("net", "vpc"))
                .with_input(InputRef::new("net", "subnets")),
        ])
        .unwrap();

        assert_eq!(graph.resolve().as_ids(), ids(&[&["net"], &["app"]]));
    }

    #[test]
    fn test_every_dependency_in_earlier_batch() {
        // Layered graph where each stack reads from up to three stacks of the previous layer.
        let mut stacks = Vec::new();
        for layer in 0..5 {
            for i in 0..6 {
                let mut s = stack(&format!("s{layer}x{i}")).with_output("out");
                if layer > 0 {
                    for j in 0..=(i % 3) {
                        s = s.with_input(InputRef::new(format!("s{}x{}", layer - 1, (i + j) % 6), "out"));
                    }
                }
                stacks.push(s);
            }
        }
        let graph = StackGraph::build(stacks).unwrap();
        let plan = graph.resolve();

        for (from, to) in graph.edges() {
            assert!(plan.position(&from).unwrap() < plan.position(&to).unwrap());
        }
        assert_eq!(plan.batches.len(), 5);
    }

    #[test]
    fn test_plan_display() {
        let graph = StackGraph::build(vec![
            stack("a").with_output("o"),
            stack("b").with_input(InputRef::new("a", "o")),
            stack("c").with_input(InputRef::new("a", "o")),
        ])
        .unwrap();

        assert_eq!(graph.resolve().to_string(), "batch 1: a\nbatch 2: b, c\n");
        assert_eq!(ExecutionPlan::default().to_string(), "(no stacks)\n");
    }
}
