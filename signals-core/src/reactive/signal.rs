//! Signal Capability
//!
//! Every cell in the graph, whether a mutable [`State`](super::State) or a
//! derived [`Computed`](super::Computed), exposes the same small capability:
//! a stable identity usable as a map key, and a way to be told "this value
//! may have changed".
//!
//! # Notification Semantics
//!
//! 1. Subscribers of a state cell are queued whenever its value really
//!    changes (per the cell's equality comparer).
//!
//! 2. Subscribers of a computed cell are queued when it goes from clean to
//!    dirty. A computed that is already dirty does not notify again until it
//!    has been read.
//!
//! 3. Queued notifications are delivered once the outermost write scope of
//!    the writing chain is released, at most once per (cell, subscriber).

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::subscriber::{NotifyFn, Subscription};
use crate::error::Result;
use crate::graph::{NodeId, NodeKind};

/// Comparer deciding whether two values are the same.
///
/// A write (or a re-evaluation) that the comparer reports as equal to the
/// current value is not a change.
pub type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// The default comparer, `PartialEq`.
pub fn default_equality<T: PartialEq + 'static>() -> Equality<T> {
    Arc::new(|a: &T, b: &T| a == b)
}

/// Identity and subscription, shared by every cell.
pub trait Signal: Send + Sync {
    /// The cell's identity.
    fn id(&self) -> NodeId;

    /// Whether this is a state or a computed cell.
    fn kind(&self) -> NodeKind;

    /// Register a type-erased notification callback.
    fn subscribe_boxed(&self, notify: NotifyFn) -> Subscription;

    /// Number of subscribers registered directly on this cell.
    fn subscriber_count(&self) -> usize;
}

/// Convenience subscription methods over [`Signal`].
pub trait SignalExt: Signal {
    /// Register an asynchronous callback. It receives the id of the cell
    /// that changed.
    fn subscribe<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(NodeId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe_boxed(Arc::new(move |id| callback(id).boxed()))
    }

    /// Register a synchronous callback.
    fn subscribe_fn<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NodeId) + Send + Sync + 'static,
    {
        self.subscribe_boxed(Arc::new(move |id| {
            callback(id);
            futures_util::future::ready(Ok(())).boxed()
        }))
    }
}

impl<S: Signal + ?Sized> SignalExt for S {}

/// Reading a value out of a cell.
///
/// For a state cell both operations complete immediately. For a computed
/// cell they may evaluate its expression first.
pub trait Readable<T>: Signal {
    /// Read the value, registering a dependency when called during a
    /// computed's evaluation.
    fn read(&self) -> BoxFuture<'_, Result<T>>;

    /// Read the value without registering a dependency.
    fn peek_value(&self) -> BoxFuture<'_, Result<T>>;
}
