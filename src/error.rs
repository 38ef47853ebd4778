use std::io;

use crate::cluster::NodeId;
use crate::transport::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The hash ring holds no virtual nodes.
    #[error("No nodes available in the hash ring")]
    NoNodesAvailable,

    #[error("No route to node {0}")]
    UnknownNode(NodeId),

    #[error("Key-value store is out of space")]
    OutOfSpace,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("Server is overloaded")]
    Overloaded,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

impl KvError {
    pub fn config(msg: impl Into<String>) -> Self {
        KvError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        KvError::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KvError::Internal(msg.into())
    }
}

impl From<serde_yaml::Error> for KvError {
    fn from(e: serde_yaml::Error) -> Self {
        KvError::Config(e.to_string())
    }
}

impl From<std::net::AddrParseError> for KvError {
    fn from(e: std::net::AddrParseError) -> Self {
        KvError::Config(format!("invalid address: {}", e))
    }
}
