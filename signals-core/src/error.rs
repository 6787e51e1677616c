//! Error types shared by every cell and the graph context.

use std::error::Error as StdError;

use thiserror::Error;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type Result<T, E = SignalError> = std::result::Result<T, E>;

/// Errors produced by reading, writing or evaluating cells.
///
/// `Frozen`, `ScopeOutOfOrder` and `Cycle` are contract violations: they mean
/// the caller used the graph incorrectly and the call must not be retried.
/// `Cancelled` and `Expression` are transient; the affected computed stays
/// dirty and the next read evaluates it from scratch.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A write was attempted on a frozen state cell.
    #[error("state {0} is frozen, its value cannot be changed")]
    Frozen(NodeId),

    /// A compute scope was finalized while it was not the innermost open
    /// scope of its chain.
    #[error("compute scope of {owner} finalized out of order (innermost open scope: {innermost:?})")]
    ScopeOutOfOrder {
        owner: NodeId,
        innermost: Option<NodeId>,
    },

    /// A computed read itself, directly or through other computeds, while it
    /// was being evaluated.
    #[error("computed {0} read itself during evaluation")]
    Cycle(NodeId),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A user expression or effect action failed.
    #[error("expression failed: {0}")]
    Expression(#[source] Box<dyn StdError + Send + Sync>),
}

impl SignalError {
    /// Wrap a user error raised inside an expression or effect action.
    pub fn expression<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        SignalError::Expression(error.into())
    }

    /// Whether this error reports misuse of the graph rather than a
    /// failure of user code.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SignalError::Frozen(_) | SignalError::ScopeOutOfOrder { .. } | SignalError::Cycle(_)
        )
    }
}
