//! Error types for cache-resilience

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::Endpoint;

/// Top-level error for everything that talks to the cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Error reply sent by the server (e.g. `-ERR ...`, `-MOVED ...`)
    #[error("Server error from {endpoint}: {message}")]
    Server { endpoint: Endpoint, message: String },

    /// Reply that does not fit the command that was sent
    #[error("Protocol error from {endpoint}: {message}")]
    Protocol { endpoint: Endpoint, message: String },

    #[error("Reconnect failed: {0}")]
    ReconnectFailed(String),

    #[error("Timed out after {0:?} waiting for reconnect")]
    ReconnectTimeout(Duration),

    #[error("Connection manager has not been initialized")]
    NotInitialized,

    #[error("Connection manager has been disposed")]
    Disposed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Endpoint the error was observed on, if it came from a specific node
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            CacheError::Connection(e) => e.endpoint(),
            CacheError::Server { endpoint, .. } | CacheError::Protocol { endpoint, .. } => {
                Some(endpoint)
            }
            _ => None,
        }
    }

    /// Server error reply text, if this is one
    pub fn server_message(&self) -> Option<&str> {
        match self {
            CacheError::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Node connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: Endpoint,
        source: io::Error,
    },

    #[error("Authentication failed on {endpoint}: {message}")]
    AuthFailed { endpoint: Endpoint, message: String },

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("I/O error on {endpoint}: {source}")]
    Io {
        endpoint: Endpoint,
        source: io::Error,
    },

    #[error("No link to shard {0} in the current connection")]
    NoLink(Endpoint),
}

impl ConnectionError {
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            ConnectionError::ConnectFailed { endpoint, .. }
            | ConnectionError::AuthFailed { endpoint, .. }
            | ConnectionError::Io { endpoint, .. }
            | ConnectionError::NoLink(endpoint) => Some(endpoint),
            ConnectionError::TlsFailed(_) => None,
        }
    }
}

/// Cluster topology errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to parse CLUSTER NODES response: {0}")]
    ParseFailed(String),

    #[error("No primary nodes found in cluster")]
    NoPrimaries,

    #[error("Slot {0} has no assigned node")]
    UnassignedSlot(u16),
}

pub type Result<T> = std::result::Result<T, CacheError>;
