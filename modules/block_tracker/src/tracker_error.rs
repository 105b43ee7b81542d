//! Error types for block tracking.

use agora_common::ChainClientError;

/// Session-level failures. Any of these ends live tracking for the session.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// One of the client's subscriptions failed or ended with an error.
    #[error("{stream} stream failed: {source}")]
    ClientStream {
        stream: &'static str,
        #[source]
        source: ChainClientError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("tracker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures of the unpinned-block path.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The key is neither a block hash nor a height.
    #[error("invalid block key '{key}'")]
    InvalidKey { key: String },

    /// Neither the archive method nor the storage lookup knows this height.
    #[error("no block hash known at height {height}")]
    HeightNotFound { height: u64 },

    #[error(transparent)]
    Client(#[from] ChainClientError),

    /// The RPC fallback gave up after its configured number of polls.
    #[error("chain_getBlock returned nothing after {attempts} attempts")]
    RpcExhausted { attempts: u32 },
}
