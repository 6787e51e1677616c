//! Effect Implementation
//!
//! An Effect is a side-effecting action that re-runs every time one of the
//! cells it read is invalidated.
//!
//! # How Effects Work
//!
//! 1. An effect is a computed cell whose expression runs the action and then
//!    returns a counter that increases on every run. Because the counter never
//!    repeats, no re-run is ever suppressed by an equality check.
//!
//! 2. The effect subscribes to its own computed. When a dependency changes,
//!    the computed goes dirty and the subscriber is queued.
//!
//! 3. When the write flushes, the subscriber reads the computed again, which
//!    runs the action and records a fresh dependency set.
//!
//! Registration runs the action once to capture the initial dependencies.
//!
//! # Differences from Computed
//!
//! - Computeds are lazy (re-evaluate on the next read); effects are eager
//!   (re-run as soon as the writing batch flushes).
//! - An effect re-runs on every invalidation of a transitive dependency,
//!   even if an intermediate computed ends up with an equal value.
//!
//! # Cleanup
//!
//! Call [`dispose`](Effect::dispose) or drop the handle. Either way the
//! internal subscription is released and the effect's edges are removed from
//! the graph.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::debug;

use super::cancel::Cancellation;
use super::computed::Computed;
use super::runtime::SignalContext;
use super::signal::Signal;
use super::subscriber::{NotifyFn, Subscription};
use crate::error::{Result, SignalError};
use crate::graph::NodeId;

/// Handle to a registered effect.
///
/// The effect stays registered as long as the handle is alive and not
/// disposed.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = SignalContext::new();
/// let count = ctx.state(0);
///
/// let effect = ctx
///     .effect_fn({
///         let count = count.clone();
///         move || println!("count = {}", count.get())
///     })
///     .await?;
///
/// count.set(1).await?; // prints "count = 1"
/// effect.dispose();
/// ```
#[must_use = "dropping an effect disposes it"]
pub struct Effect {
    computed: Computed<u64>,
    subscription: Subscription,
    cancel: Cancellation,
    disposed: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
}

impl SignalContext {
    /// Register an asynchronous effect.
    ///
    /// The action runs once before this returns. If that first run fails,
    /// nothing is registered and the error is returned.
    pub async fn effect<F, Fut>(&self, action: F) -> Result<Effect>
    where
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.effect_cancellable(action, &Cancellation::none()).await
    }

    /// Register a synchronous effect.
    pub async fn effect_fn<F>(&self, action: F) -> Result<Effect>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.effect(move |_| {
            action();
            futures_util::future::ready(Ok(()))
        })
        .await
    }

    /// Register an effect bound to a cancellation token.
    ///
    /// Once `cancel` is cancelled the effect stops re-running. If it is
    /// already cancelled, registration fails with
    /// [`SignalError::Cancelled`](crate::error::SignalError::Cancelled).
    pub async fn effect_cancellable<F, Fut>(&self, action: F, cancel: &Cancellation) -> Result<Effect>
    where
        F: Fn(Cancellation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        cancel.check()?;

        let action = Arc::new(action);
        let runs = Arc::new(AtomicU64::new(0));
        let computed = {
            let runs = runs.clone();
            self.computed(move |cancel: Cancellation| {
                let action = action.clone();
                let runs = runs.clone();
                async move {
                    action(cancel).await?;
                    Ok::<_, SignalError>(runs.fetch_add(1, Ordering::SeqCst) + 1)
                }
            })
        };

        let disposed = Arc::new(AtomicBool::new(false));
        let notify: NotifyFn = {
            let weak = computed.downgrade();
            let disposed = disposed.clone();
            let cancel = cancel.clone();
            Arc::new(move |_| {
                let weak = weak.clone();
                let disposed = disposed.clone();
                let cancel = cancel.clone();
                async move {
                    if disposed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    if cancel.is_cancelled() {
                        debug!("effect cancelled, skipping re-run");
                        return Ok(());
                    }
                    match weak.upgrade() {
                        Some(computed) => computed.peek_cancellable(&cancel).await.map(|_| ()),
                        None => Ok(()),
                    }
                }
                .boxed()
            })
        };
        let subscription = computed.subscribe_boxed(notify);

        let effect = Effect {
            computed,
            subscription,
            cancel: cancel.clone(),
            disposed,
            runs,
        };
        effect.computed.peek_cancellable(cancel).await?;
        debug!(effect = %effect.id(), "registered effect");
        Ok(effect)
    }
}

impl Effect {
    /// The identity of the effect's computed cell.
    pub fn id(&self) -> NodeId {
        self.computed.id()
    }

    /// Run the action now if a dependency changed since the last successful
    /// run.
    ///
    /// A run that fails leaves the effect dirty, and a dirty effect is not
    /// notified again; call this to retry it.
    pub async fn run(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.computed.peek_cancellable(&self.cancel).await.map(|_| ())
    }

    /// Stop re-running and remove the effect from the graph.
    ///
    /// Disposing twice is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscription.dispose();
        self.computed.context().remove(self.computed.id());
        debug!(effect = %self.computed.id(), "disposed effect");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Number of times the action has completed successfully.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Cells the last successful run read, sorted by id.
    pub fn dependencies(&self) -> Vec<NodeId> {
        self.computed.context().dependencies_of(self.computed.id())
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
