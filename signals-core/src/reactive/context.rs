//! Chain-Local Context
//!
//! Tracks, per logical chain of execution, which compute scopes are open and
//! how deeply nested the current write batch is. Both are keyed by the
//! owning [`SignalContext`] so several contexts can be used from one chain.
//!
//! # Implementation
//!
//! A chain is a `tokio` task-local value. It follows one asynchronous call
//! chain across every suspension point, so interleaved chains on the same
//! worker thread never see each other's scopes. Code that runs outside any
//! task-local chain (the body of `block_on`, a `#[tokio::test]`, plain
//! synchronous code) falls back to a thread-local chain.
//!
//! Evaluating a computed always happens inside a task-local chain: if none
//! is installed, [`ensure_chain`] installs one for the duration of the
//! evaluation, seeded with the caller's write depth so writes made by the
//! expression still join the caller's batch.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace};

use super::runtime::{ContextId, SignalContext};
use crate::error::{Result, SignalError};
use crate::graph::NodeId;

tokio::task_local! {
    static CHAIN: RefCell<ChainState>;
}

thread_local! {
    static THREAD_CHAIN: RefCell<ChainState> = RefCell::new(ChainState::default());
}

/// Everything one logical chain tracks, per context.
#[derive(Debug, Default)]
struct ChainState {
    frames: HashMap<ContextId, ChainFrame>,
}

#[derive(Debug, Default, Clone)]
struct ChainFrame {
    scopes: Vec<ScopeFrame>,
    write_depth: usize,
}

impl ChainFrame {
    fn is_idle(&self) -> bool {
        self.scopes.is_empty() && self.write_depth == 0
    }
}

/// An open compute scope: the computed being evaluated and what it read.
#[derive(Debug, Clone)]
struct ScopeFrame {
    token: u64,
    owner: NodeId,
    reads: HashSet<NodeId>,
}

fn next_scope_token() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Run `f` against this chain's frame for `context`.
///
/// Idle frames are dropped afterwards so the thread-local fallback does not
/// accumulate entries for contexts that are gone.
fn with_frame<R>(context: ContextId, f: impl FnOnce(&mut ChainFrame) -> R) -> R {
    let apply = |chain: &RefCell<ChainState>| {
        let mut chain = chain.borrow_mut();
        let frame = chain.frames.entry(context).or_default();
        let result = f(frame);
        if frame.is_idle() {
            chain.frames.remove(&context);
        }
        result
    };

    if CHAIN.try_with(|_| ()).is_ok() {
        CHAIN.with(apply)
    } else {
        THREAD_CHAIN.with(apply)
    }
}

/// Whether the caller is inside a task-local chain.
pub(crate) fn in_task_chain() -> bool {
    CHAIN.try_with(|_| ()).is_ok()
}

/// Run `fut` as an independent logical chain with no open scopes and no
/// write batch.
///
/// Wrap futures handed to `tokio::spawn` with this so each task carries its
/// own chain instead of borrowing the worker thread's fallback.
pub async fn chain_scope<F: Future>(fut: F) -> F::Output {
    CHAIN.scope(RefCell::new(ChainState::default()), fut).await
}

/// Run `fut` inside a task-local chain, installing one if the caller is not
/// already in one.
pub(crate) async fn ensure_chain<F: Future>(context: ContextId, fut: F) -> F::Output {
    if in_task_chain() {
        return fut.await;
    }

    let depth = THREAD_CHAIN.with(|chain| {
        chain
            .borrow()
            .frames
            .get(&context)
            .map_or(0, |frame| frame.write_depth)
    });
    let mut state = ChainState::default();
    if depth > 0 {
        state.frames.insert(
            context,
            ChainFrame {
                scopes: Vec::new(),
                write_depth: depth,
            },
        );
    }
    CHAIN.scope(RefCell::new(state), fut).await
}

/// Record `node` into the innermost open compute scope, if any.
pub(crate) fn record_read(context: ContextId, node: NodeId) {
    with_frame(context, |frame| {
        if let Some(scope) = frame.scopes.last_mut() {
            trace!(owner = %scope.owner, read = %node, "recorded read");
            scope.reads.insert(node);
        }
    });
}

/// Whether `node` has an open compute scope anywhere on this chain.
pub(crate) fn is_evaluating(context: ContextId, node: NodeId) -> bool {
    with_frame(context, |frame| frame.scopes.iter().any(|s| s.owner == node))
}

/// Current write-batch depth of this chain.
pub(crate) fn write_depth(context: ContextId) -> usize {
    with_frame(context, |frame| frame.write_depth)
}

/// Increment the write depth, returning the new depth.
pub(crate) fn enter_write(context: ContextId) -> usize {
    with_frame(context, |frame| {
        frame.write_depth += 1;
        frame.write_depth
    })
}

/// Decrement the write depth, returning the new depth.
pub(crate) fn exit_write(context: ContextId) -> usize {
    with_frame(context, |frame| {
        frame.write_depth = frame.write_depth.saturating_sub(1);
        frame.write_depth
    })
}

/// Guard for an open compute scope.
///
/// Created by [`SignalContext::compute_scope`]. [`finish`](Self::finish)
/// commits the recorded reads as the owner's new dependencies; dropping an
/// unfinished scope discards them.
pub struct ComputeScope {
    context: SignalContext,
    owner: NodeId,
    token: u64,
    opened_at: u64,
    finished: bool,
}

impl ComputeScope {
    pub(crate) fn open(context: SignalContext, owner: NodeId) -> Self {
        let token = next_scope_token();
        let opened_at = context.write_sequence();
        with_frame(context.id(), |frame| {
            frame.scopes.push(ScopeFrame {
                token,
                owner,
                reads: HashSet::new(),
            });
        });
        trace!(owner = %owner, "opened compute scope");

        Self {
            context,
            owner,
            token,
            opened_at,
            finished: false,
        }
    }

    /// The computed this scope records reads for.
    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Pop this scope and commit its reads.
    ///
    /// Returns `Ok(true)` if none of the recorded reads changed after the
    /// scope was opened, `Ok(false)` if one did and the result may already
    /// be outdated. The reads are committed in both cases.
    ///
    /// Fails with [`SignalError::ScopeOutOfOrder`] if another scope was
    /// opened on this chain after this one and is still open. The failed
    /// scope is then discarded without committing anything: it is removed
    /// from the middle of the chain's stack and the removal is logged at
    /// error level. Scopes opened after it stay open and finish normally.
    pub fn finish(mut self) -> Result<bool> {
        let token = self.token;
        let popped = with_frame(self.context.id(), |frame| {
            match frame.scopes.last().map(|s| (s.token, s.owner)) {
                Some((top, _)) if top == token => Ok(frame.scopes.pop()),
                top => Err(top.map(|(_, owner)| owner)),
            }
        });

        match popped {
            Ok(Some(scope)) => {
                self.finished = true;
                Ok(self
                    .context
                    .commit_dependencies(self.owner, scope.reads, self.opened_at))
            }
            Ok(None) => {
                self.finished = true;
                Ok(true)
            }
            Err(innermost) => Err(SignalError::ScopeOutOfOrder {
                owner: self.owner,
                innermost,
            }),
        }
    }
}

impl Drop for ComputeScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let token = self.token;
        let was_top = with_frame(self.context.id(), |frame| {
            let position = frame.scopes.iter().rposition(|s| s.token == token);
            let was_top = position.is_some_and(|p| p + 1 == frame.scopes.len());
            if let Some(position) = position {
                frame.scopes.remove(position);
            }
            was_top
        });

        if was_top {
            trace!(owner = %self.owner, "discarded compute scope");
        } else {
            error!(owner = %self.owner, "compute scope discarded out of order");
        }
    }
}

impl std::fmt::Debug for ComputeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeScope")
            .field("owner", &self.owner)
            .field("finished", &self.finished)
            .finish()
    }
}
