//! Cluster-aware key scanning
//!
//! Keys are enumerated lazily, one SCAN page at a time, shard by shard in
//! topology order. Pattern filtering is left to the server. A failure on
//! one shard ends that shard's sequence with a `ShardFailed` item and the
//! scan moves on to the next shard.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::node::Endpoint;
use crate::connection::ConnectionHandle;
use crate::shutdown::ShutdownSignal;
use crate::utils::CacheError;

/// Keys requested per SCAN page (server-side COUNT hint)
pub const DEFAULT_PAGE_SIZE: usize = 250;

/// Shard endpoints of `handle`, in scan order
///
/// A single endpoint when the server is not clustered.
pub fn list_endpoints(handle: &ConnectionHandle) -> Vec<Endpoint> {
    handle.endpoints().to_vec()
}

/// Keys matching `pattern` on one shard
pub fn scan(handle: Arc<ConnectionHandle>, endpoint: Endpoint, pattern: &str) -> ShardScan {
    ShardScan::new(handle, endpoint, pattern, DEFAULT_PAGE_SIZE)
}

/// Keys matching `pattern` on every shard, each shard's keys contiguous
pub fn scan_cluster(handle: Arc<ConnectionHandle>, pattern: &str) -> ClusterScan {
    ClusterScan::new(handle, pattern)
}

/// Cursor-driven scan of a single shard
///
/// Yields `Err` at most once, after which the sequence ends.
pub struct ShardScan {
    handle: Arc<ConnectionHandle>,
    endpoint: Endpoint,
    pattern: String,
    page_size: usize,
    cursor: u64,
    buffer: VecDeque<String>,
    done: bool,
}

impl ShardScan {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        endpoint: Endpoint,
        pattern: &str,
        page_size: usize,
    ) -> Self {
        Self {
            handle,
            endpoint,
            pattern: pattern.to_string(),
            page_size: page_size.max(1),
            cursor: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Iterator for ShardScan {
    type Item = Result<String, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }

            match self
                .handle
                .scan_page(&self.endpoint, self.cursor, &self.pattern, self.page_size)
            {
                Ok((next, keys)) => {
                    self.cursor = next;
                    // Cursor back at 0 means the iteration is complete
                    self.done = next == 0;
                    self.buffer.extend(keys);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// One item of a cluster scan
#[derive(Debug)]
pub enum ScanItem {
    Key { endpoint: Endpoint, key: String },
    /// The shard's sequence ended early; keys already yielded remain valid
    ShardFailed { endpoint: Endpoint, error: CacheError },
}

impl ScanItem {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ScanItem::Key { endpoint, .. } | ScanItem::ShardFailed { endpoint, .. } => endpoint,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ScanItem::Key { key, .. } => Some(key),
            ScanItem::ShardFailed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ScanItem::ShardFailed { .. })
    }
}

/// Scan of every shard in topology order
pub struct ClusterScan {
    handle: Arc<ConnectionHandle>,
    pattern: String,
    page_size: usize,
    pending: VecDeque<Endpoint>,
    current: Option<ShardScan>,
    shutdown: Option<ShutdownSignal>,
}

impl ClusterScan {
    pub fn new(handle: Arc<ConnectionHandle>, pattern: &str) -> Self {
        let pending = list_endpoints(&handle).into();
        Self {
            handle,
            pattern: pattern.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            pending,
            current: None,
            shutdown: None,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Stop yielding once `shutdown` is cancelled
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl Iterator for ClusterScan {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        loop {
            if self.shutdown.as_ref().is_some_and(|s| s.is_cancelled()) {
                self.pending.clear();
                self.current = None;
                return None;
            }

            if self.current.is_none() {
                let endpoint = self.pending.pop_front()?;
                debug!("Scanning {} for '{}'", endpoint, self.pattern);
                self.current = Some(ShardScan::new(
                    Arc::clone(&self.handle),
                    endpoint,
                    &self.pattern,
                    self.page_size,
                ));
            }
            let shard = self.current.as_mut()?;

            match shard.next() {
                Some(Ok(key)) => {
                    return Some(ScanItem::Key {
                        endpoint: shard.endpoint().clone(),
                        key,
                    })
                }
                Some(Err(error)) => {
                    let endpoint = shard.endpoint().clone();
                    warn!("Scan of {} aborted: {}", endpoint, error);
                    self.current = None;
                    return Some(ScanItem::ShardFailed { endpoint, error });
                }
                None => self.current = None,
            }
        }
    }
}
