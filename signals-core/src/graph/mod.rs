//! Dependency Graph
//!
//! This module holds the bookkeeping that relates cells to each other.
//!
//! # Overview
//!
//! The dependency graph is a directed graph where:
//!
//! - Nodes are state cells (leaves) or computed cells
//! - Edges are discovered reads: if computed A read B during its last
//!   successful evaluation, there is an edge from B to A
//!
//! When a cell changes, the graph is walked along reverse edges to find every
//! transitively affected computed so it can be marked dirty.
//!
//! # Design Decisions
//!
//! 1. Edges live in one table per context rather than inside each cell, so a
//!    single lock guards every mutation and forward/reverse stay in sync.
//!
//! 2. The tables are indexed by node ID for O(1) lookups.
//!
//! 3. Graph cycles are a contract violation and are not detected here.

mod node;
mod tables;

pub use node::{NodeId, NodeKind};
pub use tables::DependencyGraph;
