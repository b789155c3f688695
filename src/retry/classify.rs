//! Failure classification
//!
//! Decides whether a failed cache operation is worth retrying and whether
//! the connection itself has to be replaced first. Server error prefixes and
//! I/O error kinds are configurable because the boundary depends on the
//! server deployment.

use std::fmt;
use std::io;

use crate::utils::{CacheError, ConnectionError};

/// Failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Never retried
    Fatal,
    /// Retried on the same connection
    TransientOperation,
    /// Retried after a coalesced reconnect
    TransientConnection,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, FailureKind::Fatal)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Fatal => "fatal",
            FailureKind::TransientOperation => "transient-operation",
            FailureKind::TransientConnection => "transient-connection",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    /// Server error prefixes that mean the connection/topology is stale
    reconnect_prefixes: Vec<String>,
    /// Server error prefixes retried on the same connection
    retry_prefixes: Vec<String>,
    /// I/O failures retried on the same connection
    operation_io_kinds: Vec<io::ErrorKind>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            reconnect_prefixes: vec!["MOVED".to_string()],
            retry_prefixes: ["ASK", "TRYAGAIN", "CLUSTERDOWN", "LOADING", "BUSY", "MASTERDOWN"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            operation_io_kinds: vec![
                io::ErrorKind::TimedOut,
                io::ErrorKind::WouldBlock,
                io::ErrorKind::Interrupted,
            ],
        }
    }
}

impl ErrorClassifier {
    /// Treat server errors starting with `prefix` as a stale connection
    pub fn reconnect_on(mut self, prefix: &str) -> Self {
        self.forget(prefix);
        self.reconnect_prefixes.push(prefix.to_string());
        self
    }

    /// Retry server errors starting with `prefix` without reconnecting
    pub fn retry_on(mut self, prefix: &str) -> Self {
        self.forget(prefix);
        self.retry_prefixes.push(prefix.to_string());
        self
    }

    /// Make server errors starting with `prefix` fatal again
    pub fn never_retry(mut self, prefix: &str) -> Self {
        self.forget(prefix);
        self
    }

    /// Set the I/O error kinds that count as a single slow operation
    pub fn operation_io_kinds(mut self, kinds: Vec<io::ErrorKind>) -> Self {
        self.operation_io_kinds = kinds;
        self
    }

    fn forget(&mut self, prefix: &str) {
        self.reconnect_prefixes.retain(|p| p != prefix);
        self.retry_prefixes.retain(|p| p != prefix);
    }

    pub fn classify(&self, error: &CacheError) -> FailureKind {
        match error {
            CacheError::Server { message, .. } => self.classify_server_error(message),
            CacheError::Connection(ConnectionError::Io { source, .. }) => {
                if self.operation_io_kinds.contains(&source.kind()) {
                    FailureKind::TransientOperation
                } else {
                    FailureKind::TransientConnection
                }
            }
            CacheError::Connection(
                ConnectionError::ConnectFailed { .. } | ConnectionError::NoLink(_),
            ) => FailureKind::TransientConnection,
            CacheError::Connection(
                ConnectionError::AuthFailed { .. } | ConnectionError::TlsFailed(_),
            ) => FailureKind::Fatal,
            // Out-of-sync reply stream or stale slot map
            CacheError::Protocol { .. }
            | CacheError::Cluster(_)
            | CacheError::ReconnectFailed(_)
            | CacheError::ReconnectTimeout(_) => FailureKind::TransientConnection,
            CacheError::NotInitialized
            | CacheError::Disposed
            | CacheError::Cancelled
            | CacheError::Config(_) => FailureKind::Fatal,
        }
    }

    fn classify_server_error(&self, message: &str) -> FailureKind {
        let code = message.split_whitespace().next().unwrap_or("");
        if self.reconnect_prefixes.iter().any(|p| p == code) {
            FailureKind::TransientConnection
        } else if self.retry_prefixes.iter().any(|p| p == code) {
            FailureKind::TransientOperation
        } else {
            FailureKind::Fatal
        }
    }
}
