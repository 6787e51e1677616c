//! Dependency Tables
//!
//! The forward table maps a computed cell to the cells it read during its
//! last successful evaluation. The reverse table maps a cell to the computed
//! cells that currently read it. Both tables are mutated together so that
//! every forward edge has exactly one reverse entry and vice versa.
//!
//! # Propagation
//!
//! When a cell changes we walk the reverse table breadth-first, asking the
//! caller to mark each dependent dirty:
//!
//! 1. Start with the changed cell's direct dependents
//! 2. For each dependent, `mark` reports whether it went from clean to dirty
//! 3. Only freshly dirtied dependents propagate further
//!
//! A dependent that was already dirty stops the walk on that path, which keeps
//! diamond-shaped graphs from being walked more than once per change.

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::NodeId;

/// Forward and reverse dependency indexes for one context.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Computed cell -> cells it read on its last successful evaluation.
    dependencies: HashMap<NodeId, HashSet<NodeId>>,

    /// Cell -> computed cells that depend on it.
    dependents: HashMap<NodeId, HashSet<NodeId>>,
}

impl DependencyGraph {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every dependency of `owner` with `reads`.
    ///
    /// Edges from a previous evaluation are dropped first, so a code path
    /// that no longer reads a cell no longer depends on it.
    pub fn replace_dependencies(&mut self, owner: NodeId, reads: HashSet<NodeId>) {
        self.remove(owner);

        for &dependency in &reads {
            self.dependents.entry(dependency).or_default().insert(owner);
        }
        if !reads.is_empty() {
            self.dependencies.insert(owner, reads);
        }
    }

    /// Delete the forward edges of `node` and prune it from every reverse set
    /// that referenced it.
    ///
    /// Cells that still depend on `node` keep their edges.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let Some(dependencies) = self.dependencies.remove(&node) else {
            return false;
        };

        for dependency in dependencies {
            if let Some(dependents) = self.dependents.get_mut(&dependency) {
                dependents.remove(&node);
                if dependents.is_empty() {
                    self.dependents.remove(&dependency);
                }
            }
        }
        true
    }

    /// Cells that `node` read on its last successful evaluation.
    pub fn dependencies_of(&self, node: NodeId) -> Option<&HashSet<NodeId>> {
        self.dependencies.get(&node)
    }

    /// Computed cells that currently depend on `node`.
    pub fn dependents_of(&self, node: NodeId) -> Option<&HashSet<NodeId>> {
        self.dependents.get(&node)
    }

    /// Flood-fill invalidation from `changed`.
    ///
    /// `mark` is called for each reachable dependent and returns `true` when
    /// that dependent was clean and is now dirty. Returns how many dependents
    /// were freshly marked.
    pub fn propagate<F>(&self, changed: NodeId, mut mark: F) -> usize
    where
        F: FnMut(NodeId) -> bool,
    {
        let mut marked = 0;
        let mut queue: VecDeque<NodeId> = self
            .dependents
            .get(&changed)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        while let Some(node) = queue.pop_front() {
            if !mark(node) {
                continue;
            }
            marked += 1;

            if let Some(dependents) = self.dependents.get(&node) {
                queue.extend(dependents.iter().copied());
            }
        }

        marked
    }

    /// Total number of forward edges.
    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(HashSet::len).sum()
    }

    /// Whether the forward and reverse tables mirror each other exactly.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.dependencies.iter().all(|(owner, reads)| {
            reads.iter().all(|dependency| {
                self.dependents
                    .get(dependency)
                    .is_some_and(|set| set.contains(owner))
            })
        });
        let reverse_ok = self.dependents.iter().all(|(dependency, owners)| {
            owners.iter().all(|owner| {
                self.dependencies
                    .get(owner)
                    .is_some_and(|set| set.contains(dependency))
            })
        });
        forward_ok && reverse_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[NodeId]) -> HashSet<NodeId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn replace_and_remove_edges() {
        let mut graph = DependencyGraph::new();
        let source = NodeId::new();
        let derived = NodeId::new();

        graph.replace_dependencies(derived, set(&[source]));

        assert!(graph.dependencies_of(derived).unwrap().contains(&source));
        assert!(graph.dependents_of(source).unwrap().contains(&derived));
        assert_eq!(graph.edge_count(), 1);

        assert!(graph.remove(derived));
        assert!(graph.dependencies_of(derived).is_none());
        assert!(graph.dependents_of(source).is_none());
        assert!(!graph.remove(derived));
    }

    #[test]
    fn replacing_drops_stale_edges() {
        let mut graph = DependencyGraph::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let derived = NodeId::new();

        graph.replace_dependencies(derived, set(&[a]));
        graph.replace_dependencies(derived, set(&[b]));

        assert!(graph.dependents_of(a).is_none());
        assert!(graph.dependents_of(b).unwrap().contains(&derived));
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.is_consistent());
    }

    #[test]
    fn removing_keeps_edges_of_dependents() {
        let mut graph = DependencyGraph::new();
        let source = NodeId::new();
        let middle = NodeId::new();
        let leaf = NodeId::new();

        graph.replace_dependencies(middle, set(&[source]));
        graph.replace_dependencies(leaf, set(&[middle]));

        graph.remove(middle);

        assert!(graph.dependents_of(source).is_none());
        assert!(graph.dependencies_of(leaf).unwrap().contains(&middle));
        assert!(graph.is_consistent());
    }

    #[test]
    fn propagate_walks_chain() {
        let mut graph = DependencyGraph::new();
        let source = NodeId::new();
        let derived1 = NodeId::new();
        let derived2 = NodeId::new();

        graph.replace_dependencies(derived1, set(&[source]));
        graph.replace_dependencies(derived2, set(&[derived1]));

        let mut visited = Vec::new();
        let marked = graph.propagate(source, |node| {
            visited.push(node);
            true
        });

        assert_eq!(marked, 2);
        assert_eq!(visited, vec![derived1, derived2]);
    }

    #[test]
    fn propagate_stops_at_already_dirty() {
        // source -> left, right -> bottom (diamond)
        let mut graph = DependencyGraph::new();
        let source = NodeId::new();
        let left = NodeId::new();
        let right = NodeId::new();
        let bottom = NodeId::new();

        graph.replace_dependencies(left, set(&[source]));
        graph.replace_dependencies(right, set(&[source]));
        graph.replace_dependencies(bottom, set(&[left, right]));

        let mut dirty = HashSet::new();
        let mut calls = 0;
        let marked = graph.propagate(source, |node| {
            calls += 1;
            dirty.insert(node)
        });

        assert_eq!(marked, 3);
        // bottom is offered twice but only marked once
        assert_eq!(calls, 4);
        assert_eq!(dirty, set(&[left, right, bottom]));
    }

    #[test]
    fn propagate_from_unknown_node_is_noop() {
        let graph = DependencyGraph::new();
        assert_eq!(graph.propagate(NodeId::new(), |_| true), 0);
    }

    proptest! {
        #[test]
        fn tables_stay_consistent(ops in prop::collection::vec((0usize..8, prop::collection::vec(0usize..8, 0..5), any::<bool>()), 0..40)) {
            let ids: Vec<NodeId> = (0..8).map(|_| NodeId::new()).collect();
            let mut graph = DependencyGraph::new();

            for (owner, reads, remove) in ops {
                if remove {
                    graph.remove(ids[owner]);
                } else {
                    let reads = reads.into_iter().map(|i| ids[i]).collect();
                    graph.replace_dependencies(ids[owner], reads);
                }
                prop_assert!(graph.is_consistent());
            }
        }
    }
}
