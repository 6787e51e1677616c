//! Signal Context
//!
//! The context is the coordinator that connects state cells, computed cells
//! and effects. It owns the dependency tables, the pending notification queue
//! and the registry of computed cells, and it decides when queued
//! notifications are delivered.
//!
//! # How It Works
//!
//! 1. Reading a cell inside a computed's evaluation records the cell into
//!    the innermost compute scope of the reading chain.
//!
//! 2. When the evaluation succeeds, the recorded reads replace the
//!    computed's dependencies and the reverse index is rebuilt to match.
//!
//! 3. When a state cell changes, the context:
//!    a. Walks the reverse index and marks every transitive dependent dirty
//!    b. Queues the subscribers of every freshly dirtied computed
//!    c. Delivers the queue once the outermost write scope is released
//!    d. Computeds stay lazy; they re-evaluate on their next read
//!
//! # Thread Safety
//!
//! The tables, registry and queue sit behind one `parking_lot` mutex per
//! context. The mutex is never held while user code runs: subscribers are
//! drained from the queue first and invoked after the lock is released.
//! Scope stacks and write depth are chain-local, see [`super::context`].
//!
//! # Write Sequence
//!
//! Every change bumps a per-context sequence number and stamps the changed
//! cell, and every dependent it dirties, with it. A compute scope remembers
//! the sequence at which it opened. If any cell it read was stamped later,
//! the evaluation raced a write and the computed stays dirty. This covers
//! reads that are not edges yet, which dirty propagation cannot reach.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::context::{self, ComputeScope};
use super::subscriber::{Subscriber, SubscriberId};
use crate::error::Result;
use crate::graph::{DependencyGraph, NodeId};

/// Identity of one [`SignalContext`]. Keys the chain-local frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A computed cell as seen by the context, with its value type erased.
pub(crate) trait DerivedNode: Send + Sync {
    /// The node's identity.
    fn id(&self) -> NodeId;

    /// Mark the node dirty. Returns `true` if it was clean before.
    fn mark_dirty(&self) -> bool;

    /// The subscribers registered directly on this node.
    fn subscribers(&self) -> SmallVec<[Subscriber; 4]>;
}

/// State shared by every chain using one context.
#[derive(Default)]
struct Shared {
    graph: DependencyGraph,
    nodes: HashMap<NodeId, Weak<dyn DerivedNode>>,
    pending: IndexMap<(NodeId, SubscriberId), Subscriber>,
    write_seq: u64,
    changed_at: HashMap<NodeId, u64>,
}

impl Shared {
    fn queue(&mut self, changed: NodeId, subscribers: impl IntoIterator<Item = Subscriber>) {
        for subscriber in subscribers {
            self.pending
                .entry((changed, subscriber.id()))
                .or_insert(subscriber);
        }
    }

    /// Flood-fill from `changed`, queueing subscribers of every freshly
    /// dirtied computed. Upgraded nodes are pushed into `touched` so they are
    /// dropped only after the lock is released.
    fn flag_dependents_dirty(&mut self, changed: NodeId, touched: &mut Vec<Arc<dyn DerivedNode>>) -> usize {
        self.write_seq += 1;
        let Shared {
            graph,
            nodes,
            pending,
            write_seq,
            changed_at,
        } = self;
        changed_at.insert(changed, *write_seq);

        graph.propagate(changed, |dependent| {
            changed_at.insert(dependent, *write_seq);
            let Some(node) = nodes.get(&dependent).and_then(Weak::upgrade) else {
                return false;
            };
            let fresh = node.mark_dirty();
            if fresh {
                for subscriber in node.subscribers() {
                    pending
                        .entry((dependent, subscriber.id()))
                        .or_insert(subscriber);
                }
            }
            touched.push(node);
            fresh
        })
    }
}

struct Inner {
    id: ContextId,
    shared: Mutex<Shared>,
}

/// Owner of one dependency graph.
///
/// Every state and computed cell is created through a context and keeps a
/// handle to it; cells from different contexts never depend on each other.
/// Cloning the context is cheap and yields a handle to the same graph.
#[derive(Clone)]
pub struct SignalContext {
    inner: Arc<Inner>,
}

impl SignalContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ContextId::new(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// This context's identity.
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Open a write scope on the calling chain.
    ///
    /// Notifications produced while any write scope is open are queued.
    /// They are delivered when the outermost scope is released.
    ///
    /// Outside a task-local chain the scope is tracked per thread, so it
    /// must not be held across an await there: other tasks on the same
    /// worker would join it. Use [`batch`](Self::batch), or run the task
    /// under [`chain_scope`](super::chain_scope).
    pub fn write_scope(&self) -> WriteScope {
        let depth = context::enter_write(self.id());
        trace!(depth, "entered write scope");
        WriteScope {
            context: self.clone(),
            released: false,
        }
    }

    /// Run `fut` inside a write scope and flush once it completes.
    ///
    /// The batch belongs to the calling logical chain even when the caller
    /// is not inside one: a task-local chain is installed for its duration,
    /// joining any write scope the caller already has open.
    pub async fn batch<F: Future>(&self, fut: F) -> Result<F::Output> {
        context::ensure_chain(self.id(), async {
            let scope = self.write_scope();
            let output = fut.await;
            scope.release().await?;
            Ok::<_, crate::error::SignalError>(output)
        })
        .await
    }

    /// Delete `node`'s dependencies and prune it from every reverse entry.
    ///
    /// The cell itself keeps working; a later evaluation records fresh edges.
    pub fn remove(&self, node: NodeId) {
        if self.inner.shared.lock().graph.remove(node) {
            trace!(node = %node, "removed dependencies");
        }
    }

    /// Cells `node` read on its last successful evaluation, sorted by id.
    pub fn dependencies_of(&self, node: NodeId) -> Vec<NodeId> {
        let shared = self.inner.shared.lock();
        sorted(shared.graph.dependencies_of(node))
    }

    /// Computed cells that currently depend on `node`, sorted by id.
    pub fn dependents_of(&self, node: NodeId) -> Vec<NodeId> {
        let shared = self.inner.shared.lock();
        sorted(shared.graph.dependents_of(node))
    }

    /// Number of queued, undelivered notifications.
    pub fn pending_notifications(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// Write-batch depth of the calling chain.
    pub fn write_depth(&self) -> usize {
        context::write_depth(self.id())
    }

    /// Whether the forward and reverse dependency indexes mirror each other.
    pub fn is_consistent(&self) -> bool {
        self.inner.shared.lock().graph.is_consistent()
    }

    // ------------------------------------------------------------------
    // Internal protocol used by the cells
    // ------------------------------------------------------------------

    pub(crate) fn register(&self, node: Weak<dyn DerivedNode>, id: NodeId) {
        self.inner.shared.lock().nodes.insert(id, node);
    }

    /// Forget a dropped computed entirely.
    pub(crate) fn unregister(&self, id: NodeId) {
        let mut shared = self.inner.shared.lock();
        shared.nodes.remove(&id);
        shared.changed_at.remove(&id);
        shared.graph.remove(id);
    }

    /// Drop the change stamp of a state cell that no longer exists.
    pub(crate) fn forget(&self, id: NodeId) {
        self.inner.shared.lock().changed_at.remove(&id);
    }

    /// Current write sequence. Compute scopes record it when they open.
    pub(crate) fn write_sequence(&self) -> u64 {
        self.inner.shared.lock().write_seq
    }

    pub(crate) fn on_read(&self, node: NodeId) {
        context::record_read(self.id(), node);
    }

    /// Flag every transitive dependent of `changed` dirty and queue their
    /// subscribers.
    pub(crate) fn on_changed(&self, changed: NodeId) {
        let mut touched = Vec::new();
        let marked = self
            .inner
            .shared
            .lock()
            .flag_dependents_dirty(changed, &mut touched);
        trace!(changed = %changed, marked, "propagated change");
        drop(touched);
    }

    /// Mark a computed dirty from outside the graph walk.
    ///
    /// A computed that is already dirty is left alone; otherwise its own
    /// subscribers and everything depending on it are notified.
    pub(crate) fn invalidate(&self, node: &dyn DerivedNode) {
        if !node.mark_dirty() {
            return;
        }

        let id = node.id();
        let mut touched = Vec::new();
        {
            let mut shared = self.inner.shared.lock();
            shared.queue(id, node.subscribers());
            shared.flag_dependents_dirty(id, &mut touched);
        }
        drop(touched);
    }

    pub(crate) fn queue_notifications(
        &self,
        changed: NodeId,
        subscribers: impl IntoIterator<Item = Subscriber>,
    ) {
        self.inner.shared.lock().queue(changed, subscribers);
    }

    /// Open a compute scope for `owner` on the calling chain.
    ///
    /// Reads made until the scope is finished are recorded as `owner`'s
    /// dependencies. Scopes on one chain must be finished in reverse order
    /// of opening. Computed cells do this themselves; it is public for code
    /// that drives evaluation by hand.
    pub fn compute_scope(&self, owner: NodeId) -> ComputeScope {
        ComputeScope::open(self.clone(), owner)
    }

    /// Replace `owner`'s dependencies with `reads`.
    ///
    /// Returns `false` if any of `reads` changed after `opened_at`: the
    /// evaluation may have seen a value that is already outdated.
    pub(crate) fn commit_dependencies(&self, owner: NodeId, reads: HashSet<NodeId>, opened_at: u64) -> bool {
        let mut shared = self.inner.shared.lock();
        let fresh = !reads
            .iter()
            .any(|read| shared.changed_at.get(read).is_some_and(|&at| at > opened_at));
        trace!(owner = %owner, count = reads.len(), fresh, "committed dependencies");
        shared.graph.replace_dependencies(owner, reads);
        fresh
    }

    /// Drain the queue and invoke every subscriber once.
    ///
    /// Every queued subscriber runs even if an earlier one fails; the first
    /// failure is returned.
    async fn flush(&self) -> Result<()> {
        let pending: Vec<_> = {
            let mut shared = self.inner.shared.lock();
            shared.pending.drain(..).collect()
        };
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "flushing notifications");

        let mut first_error = None;
        for ((changed, _), subscriber) in pending {
            if let Err(err) = subscriber.notify(changed).await {
                warn!(changed = %changed, error = %err, "subscriber failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for SignalContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SignalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("SignalContext")
            .field("id", &self.inner.id)
            .field("computeds", &shared.nodes.len())
            .field("edges", &shared.graph.edge_count())
            .field("pending", &shared.pending.len())
            .finish()
    }
}

fn sorted(set: Option<&HashSet<NodeId>>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = set.map(|s| s.iter().copied().collect()).unwrap_or_default();
    ids.sort();
    ids
}

/// Handle to an open write scope.
///
/// [`release`](Self::release) closes the scope and, if it was the outermost
/// one on this chain, delivers every queued notification. Dropping an
/// unreleased scope closes it without delivering; the queue is then
/// delivered by the next outermost release.
///
/// The handle is bound to the chain that opened it. Opened outside any
/// task-local chain it counts against the thread, so holding it across an
/// await lets unrelated tasks on that thread join the batch, and a task
/// that resumes on another worker releases the wrong counter. Prefer
/// [`SignalContext::batch`] in async code.
#[must_use = "a write scope must be released to deliver notifications"]
pub struct WriteScope {
    context: SignalContext,
    released: bool,
}

impl WriteScope {
    /// Close the scope, flushing if it was the outermost.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let depth = context::exit_write(self.context.id());
        trace!(depth, "released write scope");
        if depth == 0 {
            self.context.flush().await
        } else {
            Ok(())
        }
    }
}

impl Drop for WriteScope {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let depth = context::exit_write(self.context.id());
        if depth == 0 && self.context.pending_notifications() > 0 {
            warn!("write scope dropped without release, notifications left queued");
        }
    }
}

impl fmt::Debug for WriteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteScope")
            .field("context", &self.context.id())
            .field("released", &self.released)
            .finish()
    }
}
