//! Graph Nodes
//!
//! This module defines the identity and kind of the cells that live in the
//! dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a cell in the dependency graph.
///
/// Identities come from a process-wide counter and are never reused, even
/// after the cell they named has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of cell in the dependency graph.
///
/// Effects are not a kind of their own: an effect is a computed cell with an
/// internal subscriber that re-reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A mutable leaf. Has dependents but never dependencies.
    State,

    /// A derived cell. Has dependencies and may have dependents.
    /// Caches the value of its last successful evaluation.
    Computed,
}
