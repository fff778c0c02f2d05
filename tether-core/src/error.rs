//! Error types for the reactive engine.

use thiserror::Error;

use crate::runtime::{ContextId, MethodId, NodeId};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReactiveError>;

/// Errors produced by reactive computations and the machinery around them.
///
/// Only [`ReactiveError::Computation`] and [`ReactiveError::Stopped`] ever
/// reach a consumer through [`Enumerator::next`](crate::reactive::Enumerator::next).
/// Timeouts and delivery failures are absorbed by the engine.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// The wrapped user computation failed.
    #[error("computation failed: {0}")]
    Computation(String),

    /// The computation was torn down (root disposed or subscription dropped).
    #[error("computation stopped")]
    Stopped,

    /// A dependency did not produce its first value within the configured timeout.
    #[error("timed out waiting for a dependency")]
    Timeout,

    /// A push or request could not be delivered to another node.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// The target node is not reachable.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// No handler is registered for the method on the target context.
    #[error("method {method} not found on {context}")]
    MethodNotFound { context: ContextId, method: MethodId },

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReactiveError {
    /// Build a computation error from anything printable.
    pub fn computation(message: impl std::fmt::Display) -> Self {
        ReactiveError::Computation(message.to_string())
    }

    /// Whether this error marks the end of a stream.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ReactiveError::Stopped)
    }
}

impl From<serde_json::Error> for ReactiveError {
    fn from(err: serde_json::Error) -> Self {
        ReactiveError::Config(err.to_string())
    }
}
