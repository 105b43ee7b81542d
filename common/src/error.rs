//! Errors reported by a chain client.

use crate::hash::BlockHash;

/// Errors returned by [`ChainClient`](crate::client::ChainClient) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainClientError {
    /// The connection or request failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node does not hold the requested block.
    #[error("block not found: {hash}")]
    NotFound { hash: BlockHash },

    /// The node does not implement the requested method.
    #[error("unsupported method: {method}")]
    Unsupported { method: String },

    /// A response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A subscription ended unexpectedly.
    #[error("stream closed: {0}")]
    StreamClosed(String),
}

impl From<serde_json::Error> for ChainClientError {
    fn from(error: serde_json::Error) -> Self {
        ChainClientError::Decode(error.to_string())
    }
}
