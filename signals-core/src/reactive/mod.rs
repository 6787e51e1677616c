//! Reactive Primitives
//!
//! This module implements the reactive system: state cells, computed cells,
//! effects, and the context that tracks the dependencies between them.
//!
//! # Concepts
//!
//! ## State
//!
//! A [`State`] is a mutable cell. Reading it while a computed is evaluating
//! records it as one of that computed's dependencies. Writing a new value
//! marks every transitive dependent dirty and notifies subscribers.
//!
//! ## Computed
//!
//! A [`Computed`] is a cached value derived from other cells. It re-evaluates
//! lazily, on the first read after one of its dependencies changed.
//!
//! ## Effects
//!
//! An [`Effect`] is an action that re-runs as soon as any cell it read is
//! invalidated. It is built from a computed and a subscription on it.
//!
//! # Implementation Notes
//!
//! Dependencies are discovered, never declared: each evaluation runs inside a
//! compute scope that records the cells read, and finishing the scope
//! replaces the computed's edges with that set.
//!
//! Which scopes are open and how deeply writes are batched is chain-local
//! (see [`chain_scope`]), so concurrent tasks sharing one context never see
//! each other's scopes. The dependency tables and the notification queue
//! are shared and live in the [`SignalContext`].

mod cancel;
mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod state;
mod subscriber;

pub use cancel::Cancellation;
pub use computed::Computed;
pub use context::{chain_scope, ComputeScope};
pub use effect::Effect;
pub use runtime::{ContextId, SignalContext, WriteScope};
pub use signal::{default_equality, Equality, Readable, Signal, SignalExt};
pub use state::State;
pub use subscriber::{NotifyFn, Subscriber, SubscriberId, Subscription};
