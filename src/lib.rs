//! Peer-to-peer sharded key-value store over UDP.
//!
//! Keys are placed on a consistent-hash ring of virtual nodes. Every node
//! serves or forwards requests for any key, pushes writes to the key's
//! replica set and periodically evicts keys it no longer holds a replica of.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod store;
pub mod transport;

// Re-export common types
pub use cluster::{Cluster, HashRing, NodeId, VirtualNode};
pub use config::NodeConfig;
pub use error::{KvError, Result};
pub use protocol::{Command, ErrorCode, Request, Response};
pub use server::{Server, ServerHandle};
pub use store::KeyValueStore;
pub use transport::KvClient;
