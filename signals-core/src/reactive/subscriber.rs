//! Subscriber types for the reactive system.
//!
//! A Subscriber is a callback registered on a cell that is queued whenever
//! the cell may have changed. Queued callbacks run when the outermost write
//! scope of the writing chain is released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::Result;
use crate::graph::NodeId;

/// Unique identifier for a subscriber.
///
/// Together with the notifying cell's [`NodeId`] this forms the key used to
/// coalesce notifications within one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked with the identity of the cell that changed.
pub type NotifyFn = Arc<dyn Fn(NodeId) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered notification callback.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    notify: NotifyFn,
}

impl Subscriber {
    /// Create a new subscriber with the given notification callback.
    pub fn new(notify: NotifyFn) -> Self {
        Self {
            id: SubscriberId::new(),
            notify,
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Notify the subscriber that `changed` may have a new value.
    pub fn notify(&self, changed: NodeId) -> BoxFuture<'static, Result<()>> {
        (self.notify)(changed)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// The subscribers registered directly on one cell.
#[derive(Default)]
pub(crate) struct Subscribers {
    list: Arc<Mutex<Vec<Subscriber>>>,
}

impl Subscribers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `notify`; the returned handle removes it again.
    pub(crate) fn subscribe(&self, notify: NotifyFn) -> Subscription {
        let subscriber = Subscriber::new(notify);
        let id = subscriber.id();
        self.list.lock().push(subscriber);

        let list: Weak<Mutex<Vec<Subscriber>>> = Arc::downgrade(&self.list);
        Subscription::new(move || {
            if let Some(list) = list.upgrade() {
                list.lock().retain(|s| s.id() != id);
            }
        })
    }

    /// Copy of the current subscribers, taken so callbacks never run under
    /// the list lock.
    pub(crate) fn snapshot(&self) -> SmallVec<[Subscriber; 4]> {
        self.list.lock().iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().len()
    }
}

/// Handle returned from every subscribe or registration call.
///
/// Releasing it is idempotent: the first [`dispose`](Self::dispose) runs the
/// release action, later calls do nothing. Dropping the handle disposes it.
#[must_use = "dropping a Subscription disposes it immediately"]
pub struct Subscription {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Release the subscription. Safe to call more than once.
    pub fn dispose(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.release.lock().is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicI32;

    fn counting(counter: &Arc<AtomicI32>) -> NotifyFn {
        let counter = counter.clone();
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        })
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn subscriber_notify_calls_callback() {
        let calls = Arc::new(AtomicI32::new(0));
        let subscriber = Subscriber::new(counting(&calls));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        subscriber.notify(NodeId::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_does_not_release_on_creation() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let subscription = Subscription::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!subscription.is_disposed());
        subscription.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_dispose_twice_releases_once() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let subscription = Subscription::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        subscription.dispose();
        subscription.dispose();
        drop(subscription);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_unsubscribe_through_handle() {
        let calls = Arc::new(AtomicI32::new(0));
        let subscribers = Subscribers::new();

        let first = subscribers.subscribe(counting(&calls));
        let _second = subscribers.subscribe(counting(&calls));
        assert_eq!(subscribers.len(), 2);

        first.dispose();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers.snapshot().len(), 1);
    }
}
