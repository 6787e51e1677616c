//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only after one of
//! the cells it read has changed.
//!
//! # How Computeds Work
//!
//! 1. A new computed is dirty and has no value and no dependencies.
//!
//! 2. Reading a dirty computed opens a compute scope, runs the expression,
//!    caches the result, finalizes the scope (committing the cells read as
//!    its new dependencies) and marks it clean.
//!
//! 3. Reading a clean computed returns the cached value. The expression does
//!    not run and no scope is opened.
//!
//! 4. When a dependency changes, the context marks the computed dirty and
//!    queues its subscribers. Re-evaluation waits for the next read.
//!
//! # Failure
//!
//! If the expression fails or is cancelled, its scope is discarded, the
//! previous dependencies stay in place and the computed stays dirty, so the
//! next read evaluates from scratch. The error goes back to the reader.
//!
//! # Writes During Evaluation
//!
//! A write that lands while the expression is running leaves the computed
//! dirty once the evaluation completes, whether the written cell was
//! already a dependency or was only read for the first time by this
//! evaluation. The reader still gets the value that was computed.
//!
//! # Thread Safety
//!
//! Each computed has an async evaluation gate: concurrent readers of one dirty
//! computed wait for the first evaluation instead of running the expression
//! again. The cached value and dirty flag sit behind a `parking_lot` mutex
//! that is never held across an await.

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::cancel::Cancellation;
use super::context;
use super::runtime::{DerivedNode, SignalContext};
use super::signal::{default_equality, Equality, Readable, Signal};
use super::subscriber::{NotifyFn, Subscriber, Subscribers, Subscription};
use crate::error::{Result, SignalError};
use crate::graph::{NodeId, NodeKind};

/// Boxed expression: takes a cancellation token, yields the new value.
type Expression<T> = Arc<dyn Fn(Cancellation) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Cached value and validity of one computed.
struct Slot<T> {
    value: Option<T>,
    dirty: bool,
    /// Bumped by every invalidation, including ones that hit an already
    /// dirty computed. An evaluation only marks the computed clean if no
    /// invalidation arrived while it ran.
    generation: u64,
    /// Bumped whenever the cached value is replaced by an unequal one.
    version: u64,
}

struct Inner<T> {
    id: NodeId,
    context: SignalContext,
    expression: Expression<T>,
    equality: Equality<T>,
    slot: Mutex<Slot<T>>,
    gate: tokio::sync::Mutex<()>,
    subscribers: Subscribers,
}

impl<T> Inner<T> {
    fn cached(&self) -> Option<T>
    where
        T: Clone,
    {
        let slot = self.slot.lock();
        if slot.dirty {
            None
        } else {
            slot.value.clone()
        }
    }
}

impl<T> DerivedNode for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.id
    }

    fn mark_dirty(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        if slot.dirty {
            false
        } else {
            slot.dirty = true;
            true
        }
    }

    fn subscribers(&self) -> SmallVec<[Subscriber; 4]> {
        self.subscribers.snapshot()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.context.unregister(self.id);
    }
}

/// A cached value derived from other cells.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync.
///
/// Clones share the same cell.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = SignalContext::new();
/// let count = ctx.state(2);
/// let doubled = ctx.computed_fn({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get().await?, 4);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl SignalContext {
    /// Create a computed from an asynchronous expression, compared with
    /// `PartialEq`.
    ///
    /// The expression does not run until the computed is first read.
    pub fn computed<T, F, Fut>(&self, expression: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.computed_with(expression, default_equality())
    }

    /// Create a computed with a custom equality comparer.
    pub fn computed_with<T, F, Fut>(&self, expression: F, equality: Equality<T>) -> Computed<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let expression: Expression<T> = Arc::new(move |cancel| expression(cancel).boxed());
        let inner = Arc::new(Inner {
            id: NodeId::new(),
            context: self.clone(),
            expression,
            equality,
            slot: Mutex::new(Slot {
                value: None,
                dirty: true,
                generation: 0,
                version: 0,
            }),
            gate: tokio::sync::Mutex::new(()),
            subscribers: Subscribers::new(),
        });

        let weak: Weak<dyn DerivedNode> = Arc::downgrade(&inner) as Weak<dyn DerivedNode>;
        self.register(weak, inner.id);
        Computed { inner }
    }

    /// Create a computed from a synchronous expression.
    ///
    /// The expression can read state cells; reading other computeds needs an
    /// asynchronous expression.
    pub fn computed_fn<T, F>(&self, expression: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.computed(move |_| futures_util::future::ready(Ok(expression())))
    }
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get the cell's identity.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The context this cell belongs to.
    pub fn context(&self) -> &SignalContext {
        &self.inner.context
    }

    /// Get the current value, evaluating first if dirty.
    ///
    /// If called during another computed's evaluation, that computed now
    /// depends on this one.
    pub async fn get(&self) -> Result<T> {
        self.get_cancellable(&Cancellation::none()).await
    }

    /// [`get`](Self::get) with a cancellation token.
    pub async fn get_cancellable(&self, cancel: &Cancellation) -> Result<T> {
        self.inner.context.on_read(self.inner.id);
        self.peek_cancellable(cancel).await
    }

    /// Get the current value without registering a dependency.
    pub async fn peek(&self) -> Result<T> {
        self.peek_cancellable(&Cancellation::none()).await
    }

    /// [`peek`](Self::peek) with a cancellation token.
    pub async fn peek_cancellable(&self, cancel: &Cancellation) -> Result<T> {
        if let Some(value) = self.inner.cached() {
            return Ok(value);
        }
        let context_id = self.inner.context.id();
        context::ensure_chain(context_id, self.evaluate(cancel)).await
    }

    /// Whether the next read will run the expression.
    pub fn is_dirty(&self) -> bool {
        self.inner.slot.lock().dirty
    }

    /// Whether a value has been cached by a successful evaluation.
    pub fn has_value(&self) -> bool {
        self.inner.slot.lock().value.is_some()
    }

    /// Number of times the cached value was replaced by an unequal one.
    pub fn version(&self) -> u64 {
        self.inner.slot.lock().version
    }

    /// Mark the computed dirty from outside.
    ///
    /// No-op if already dirty. Otherwise its subscribers and everything that
    /// depends on it are notified.
    pub async fn invalidate(&self) -> Result<()> {
        let context = &self.inner.context;
        let scope = context.write_scope();
        context.invalidate(self.inner.as_ref());
        scope.release().await
    }

    pub(crate) fn downgrade(&self) -> WeakComputed<T> {
        WeakComputed {
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn evaluate(&self, cancel: &Cancellation) -> Result<T> {
        let inner = &self.inner;
        let context_id = inner.context.id();
        if context::is_evaluating(context_id, inner.id) {
            return Err(SignalError::Cycle(inner.id));
        }

        let _gate = inner.gate.lock().await;
        // Another chain may have finished evaluating while we waited.
        if let Some(value) = inner.cached() {
            return Ok(value);
        }
        cancel.check()?;

        let generation = inner.slot.lock().generation;
        let scope = inner.context.compute_scope(inner.id);
        let value = match (inner.expression)(cancel.clone()).await {
            Ok(value) => value,
            Err(err) => {
                drop(scope);
                debug!(computed = %inner.id, error = %err, "evaluation failed");
                return Err(err);
            }
        };
        let fresh = scope.finish()?;

        let mut slot = inner.slot.lock();
        let (current, changed) = match slot.value.take() {
            Some(old) if (inner.equality)(&old, &value) => (old, false),
            _ => {
                slot.version += 1;
                (value, true)
            }
        };
        slot.value = Some(current.clone());
        if !fresh {
            trace!(computed = %inner.id, "read a cell written during evaluation, staying dirty");
        } else if slot.generation != generation {
            trace!(computed = %inner.id, "invalidated during evaluation, staying dirty");
        } else {
            slot.dirty = false;
        }
        trace!(computed = %inner.id, changed, "evaluated");
        Ok(current)
    }
}

/// Non-owning handle to a computed, used by callbacks the computed itself
/// holds.
pub(crate) struct WeakComputed<T> {
    inner: Weak<Inner<T>>,
}

impl<T> WeakComputed<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn upgrade(&self) -> Option<Computed<T>> {
        self.inner.upgrade().map(|inner| Computed { inner })
    }
}

impl<T> Clone for WeakComputed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> Signal for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Computed
    }

    fn subscribe_boxed(&self, notify: NotifyFn) -> Subscription {
        self.inner.subscribers.subscribe(notify)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<T> Readable<T> for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn read(&self) -> BoxFuture<'_, Result<T>> {
        self.get().boxed()
    }

    fn peek_value(&self) -> BoxFuture<'_, Result<T>> {
        self.peek().boxed()
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .field("version", &self.version())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
