//! State Implementation
//!
//! A State is the mutable leaf of the graph. It holds a value and tells the
//! context whenever that value really changes.
//!
//! # How State Works
//!
//! 1. Reading a state inside a computed's evaluation records it as one of
//!    that computed's dependencies.
//!
//! 2. Writing a value the equality comparer reports as equal does nothing:
//!    no dirty marking, no notification, no write scope.
//!
//! 3. Writing a new value replaces it first, then opens a write scope,
//!    flags every dependent dirty and queues this cell's subscribers. If the
//!    caller already has a write scope open, delivery waits for it.
//!
//! # Freezing
//!
//! A frozen state rejects every later write and stops registering reads,
//! since its value can no longer change.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{ready, BoxFuture};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::trace;

use super::cancel::Cancellation;
use super::runtime::SignalContext;
use super::signal::{default_equality, Equality, Readable, Signal};
use super::subscriber::{NotifyFn, Subscribers, Subscription};
use crate::error::{Result, SignalError};
use crate::graph::{NodeId, NodeKind};

struct Inner<T> {
    id: NodeId,
    context: SignalContext,
    value: RwLock<T>,
    equality: Equality<T>,
    frozen: AtomicBool,
    subscribers: Subscribers,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.context.forget(self.id);
    }
}

/// A mutable cell holding a value of type `T`.
///
/// Clones share the same cell.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = SignalContext::new();
/// let count = ctx.state(0);
///
/// assert_eq!(count.get(), 0);
/// count.set(5).await?;
/// ```
pub struct State<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl SignalContext {
    /// Create a state cell compared with `PartialEq`.
    pub fn state<T>(&self, value: T) -> State<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.state_with(value, default_equality())
    }

    /// Create a state cell with a custom equality comparer.
    pub fn state_with<T>(&self, value: T, equality: Equality<T>) -> State<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        State {
            inner: Arc::new(Inner {
                id: NodeId::new(),
                context: self.clone(),
                value: RwLock::new(value),
                equality,
                frozen: AtomicBool::new(false),
                subscribers: Subscribers::new(),
            }),
        }
    }
}

impl<T> State<T>
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

    /// Get the current value.
    ///
    /// If called during a computed's evaluation, the computed now depends on
    /// this cell (unless the cell is frozen).
    pub fn get(&self) -> T {
        if !self.is_frozen() {
            self.inner.context.on_read(self.inner.id);
        }
        self.peek()
    }

    /// Get the current value without registering a dependency.
    pub fn peek(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value.
    ///
    /// Returns the first error raised by a subscriber if this write flushed
    /// the notification queue.
    pub async fn set(&self, value: T) -> Result<()> {
        self.set_cancellable(value, &Cancellation::none()).await
    }

    /// Set a new value unless `cancel` has already been cancelled.
    pub async fn set_cancellable(&self, value: T, cancel: &Cancellation) -> Result<()> {
        cancel.check()?;
        if !self.replace(value)? {
            return Ok(());
        }

        let context = &self.inner.context;
        let scope = context.write_scope();
        context.on_changed(self.inner.id);
        context.queue_notifications(self.inner.id, self.inner.subscribers.snapshot());
        scope.release().await
    }

    /// Replace the value from the current one.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T + Send,
    {
        let new_value = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.set(new_value).await
    }

    /// Permanently reject further writes and stop registering reads.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::SeqCst);
        trace!(state = %self.inner.id, "frozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Store `value`, returning whether it differed from the old one.
    fn replace(&self, value: T) -> Result<bool> {
        if self.is_frozen() {
            return Err(SignalError::Frozen(self.inner.id));
        }

        let mut guard = self.inner.value.write();
        if (self.inner.equality)(&guard, &value) {
            return Ok(false);
        }
        *guard = value;
        trace!(state = %self.inner.id, "value changed");
        Ok(true)
    }
}

impl<T> Signal for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> NodeId {
        self.inner.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::State
    }

    fn subscribe_boxed(&self, notify: NotifyFn) -> Subscription {
        self.inner.subscribers.subscribe(notify)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl<T> Readable<T> for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn read(&self) -> BoxFuture<'_, Result<T>> {
        ready(Ok(self.get())).boxed()
    }

    fn peek_value(&self) -> BoxFuture<'_, Result<T>> {
        ready(Ok(self.peek())).boxed()
    }
}

impl<T> Clone for State<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for State<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.inner.id)
            .field("value", &self.peek())
            .field("frozen", &self.is_frozen())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
