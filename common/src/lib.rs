// Agora common library - main library exports

pub mod client;
pub mod error;
pub mod hash;
pub mod rpc;
pub mod types;

// Flattened re-exports
pub use self::client::{ChainClient, ClientResult, ClientStream};
pub use self::error::ChainClientError;
pub use self::hash::{BlockHash, Hash};
pub use self::types::*;
