//! Signals Core
//!
//! A fine-grained reactive runtime: mutable state cells, cached computed
//! cells that re-evaluate only when something they read has changed, and
//! effects that re-run whenever their inputs are invalidated.
//!
//! Dependencies are discovered by observing which cells an evaluation reads.
//! Writes propagate dirtiness through the graph immediately; notifications
//! are batched, coalesced and delivered when the outermost write scope of
//! the writing chain is released.
//!
//! # Architecture
//!
//! - `graph`: Node identities and the forward/reverse dependency tables
//! - `reactive`: Cells, effects, the signal context and chain-local scopes
//! - `error`: The error type shared by every fallible operation
//!
//! # Example
//!
//! ```rust,ignore
//! use signals_core::reactive::SignalContext;
//!
//! let ctx = SignalContext::new();
//! let count = ctx.state(1);
//!
//! // Create a derived value
//! let doubled = ctx.computed_fn({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! // Create an effect
//! let _effect = ctx
//!     .effect({
//!         let doubled = doubled.clone();
//!         move |_| {
//!             let doubled = doubled.clone();
//!             async move {
//!                 println!("doubled: {}", doubled.get().await?);
//!                 Ok(())
//!             }
//!         }
//!     })
//!     .await?;
//!
//! // Update the state
//! count.set(5).await?;
//! // Effect re-runs, prints: "doubled: 10"
//! ```

pub mod error;
pub mod graph;
pub mod reactive;

pub use error::{Result, SignalError};
pub use graph::NodeId;
pub use reactive::{Cancellation, Computed, Effect, SignalContext, State};
