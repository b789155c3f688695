//! Shared, self-healing connection manager
//!
//! One manager instance is shared (via `Arc`) by every worker. It publishes
//! the current `ConnectionHandle` through a lock that is held only for the
//! pointer swap, and guarantees at most one reconnect attempt in flight:
//! callers that ask for a reconnect while one is running wait for its
//! outcome instead of dialling again.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::handle::ConnectionHandle;
use crate::client::{ConnectionFactory, Connector};
use crate::cluster::Endpoint;
use crate::config::ConnectionDescriptor;
use crate::utils::{CacheError, Result};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Upper bound for callers waiting on an in-flight reconnect
    pub reconnect_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// State transitions are serialized by this lock
struct Coordination {
    state: ConnectionState,
    reconnecting: bool,
    /// Completed reconnect attempts, successful or not
    attempts: u64,
    last_failure: Option<String>,
    disposed: bool,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    seeds: Vec<Endpoint>,
    cluster_mode: bool,
    settings: ManagerSettings,
    current: RwLock<Option<Arc<ConnectionHandle>>>,
    coordination: Mutex<Coordination>,
    published: Condvar,
    /// Mirrors `Coordination::reconnecting` for the lock-free fast path
    reconnecting: AtomicBool,
    next_generation: AtomicU64,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("seeds", &self.seeds)
            .field("cluster_mode", &self.cluster_mode)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Manager dialling through `connector`; nothing is connected yet
    pub fn new(
        connector: Arc<dyn Connector>,
        seeds: Vec<Endpoint>,
        cluster_mode: bool,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            connector,
            seeds,
            cluster_mode,
            settings,
            current: RwLock::new(None),
            coordination: Mutex::new(Coordination {
                state: ConnectionState::Disconnected,
                reconnecting: false,
                attempts: 0,
                last_failure: None,
                disposed: false,
            }),
            published: Condvar::new(),
            reconnecting: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Manager using real TCP/TLS connections built from `descriptor`
    pub fn from_descriptor(descriptor: &ConnectionDescriptor, settings: ManagerSettings) -> Self {
        Self::new(
            Arc::new(ConnectionFactory::from_descriptor(descriptor)),
            descriptor.seeds.clone(),
            descriptor.cluster_mode,
            settings,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.coordination.lock().state
    }

    /// Establish the first connection
    ///
    /// Fails without retrying; callers decide whether to bootstrap again.
    /// Calling it again once connected returns the current handle, and a
    /// call made while another bootstrap is running waits for it.
    pub fn initialize(&self) -> Result<Arc<ConnectionHandle>> {
        let deadline = Instant::now() + self.settings.reconnect_timeout;
        let mut coord = self.coordination.lock();
        loop {
            if coord.disposed {
                return Err(CacheError::Disposed);
            }
            if let Some(handle) = self.current.read().clone() {
                return Ok(handle);
            }
            if !coord.reconnecting {
                break;
            }
            if self.published.wait_until(&mut coord, deadline).timed_out() && coord.reconnecting {
                return Err(CacheError::ReconnectTimeout(self.settings.reconnect_timeout));
            }
        }

        coord.reconnecting = true;
        self.reconnecting.store(true, Ordering::Release);
        coord.state = ConnectionState::Connecting;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(coord);

        let outcome = ConnectionHandle::establish(
            Arc::clone(&self.connector),
            &self.seeds,
            self.cluster_mode,
            generation,
        );

        let mut coord = self.coordination.lock();
        coord.reconnecting = false;
        self.reconnecting.store(false, Ordering::Release);

        let result = match outcome {
            _ if coord.disposed => {
                debug!("Dropping bootstrap #{} after dispose", generation);
                Err(CacheError::Disposed)
            }
            Ok(handle) => {
                let handle = Arc::new(handle);
                *self.current.write() = Some(Arc::clone(&handle));
                coord.state = ConnectionState::Connected;
                Ok(handle)
            }
            Err(e) => {
                coord.state = ConnectionState::Disconnected;
                Err(e)
            }
        };

        self.published.notify_all();
        result
    }

    /// The presently published handle
    ///
    /// Does not block unless a reconnect is in flight, in which case it
    /// waits for the new handle up to the reconnect timeout.
    pub fn current(&self) -> Result<Arc<ConnectionHandle>> {
        if !self.reconnecting.load(Ordering::Acquire) {
            if let Some(handle) = self.current.read().clone() {
                return Ok(handle);
            }
        }

        let deadline = Instant::now() + self.settings.reconnect_timeout;
        let mut coord = self.coordination.lock();
        while coord.reconnecting && !coord.disposed {
            if self.published.wait_until(&mut coord, deadline).timed_out() && coord.reconnecting {
                return Err(CacheError::ReconnectTimeout(self.settings.reconnect_timeout));
            }
        }
        if coord.disposed {
            return Err(CacheError::Disposed);
        }
        self.current.read().clone().ok_or(CacheError::NotInitialized)
    }

    /// Record that `generation` was seen failing at the connection level
    pub fn report_fault(&self, generation: u64, reason: &str) {
        let mut coord = self.coordination.lock();
        if coord.state == ConnectionState::Connected && self.current_generation() == generation {
            warn!("Connection #{} faulted: {}", generation, reason);
            coord.state = ConnectionState::Faulted;
        }
    }

    /// Replace the handle of generation `observed`
    ///
    /// If the handle was already replaced, the newer one is returned with no
    /// reconnect. If a reconnect is in flight, waits for its outcome.
    /// Otherwise this caller performs the reconnect; network I/O happens
    /// without holding any lock.
    pub fn force_reconnect(&self, observed: u64, reason: &str) -> Result<Arc<ConnectionHandle>> {
        let mut coord = self.coordination.lock();
        loop {
            if coord.disposed {
                return Err(CacheError::Disposed);
            }
            let published = self.current.read().clone();
            let Some(published) = published else {
                return Err(CacheError::NotInitialized);
            };
            if published.generation() > observed {
                debug!(
                    "Connection #{} already replaced by #{}",
                    observed,
                    published.generation()
                );
                return Ok(published);
            }
            if !coord.reconnecting {
                break;
            }

            // Follow the reconnect already in flight
            let attempt = coord.attempts;
            let deadline = Instant::now() + self.settings.reconnect_timeout;
            while coord.reconnecting && coord.attempts == attempt && !coord.disposed {
                if self.published.wait_until(&mut coord, deadline).timed_out()
                    && coord.reconnecting
                {
                    return Err(CacheError::ReconnectTimeout(self.settings.reconnect_timeout));
                }
            }
            if coord.attempts != attempt {
                if let Some(failure) = &coord.last_failure {
                    return Err(CacheError::ReconnectFailed(failure.clone()));
                }
            }
        }

        coord.reconnecting = true;
        self.reconnecting.store(true, Ordering::Release);
        coord.state = ConnectionState::Connecting;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(coord);

        info!("Reconnecting (replacing #{}): {}", observed, reason);
        let outcome = ConnectionHandle::establish(
            Arc::clone(&self.connector),
            &self.seeds,
            self.cluster_mode,
            generation,
        );

        let mut coord = self.coordination.lock();
        coord.reconnecting = false;
        self.reconnecting.store(false, Ordering::Release);
        coord.attempts += 1;

        let result = match outcome {
            _ if coord.disposed => {
                debug!("Discarding reconnect #{} after dispose", generation);
                Err(CacheError::Disposed)
            }
            Ok(handle) => {
                let handle = Arc::new(handle);
                *self.current.write() = Some(Arc::clone(&handle));
                coord.state = ConnectionState::Connected;
                coord.last_failure = None;
                info!("Reconnected as #{}", generation);
                Ok(handle)
            }
            Err(e) => {
                warn!("Reconnect attempt #{} failed: {}", generation, e);
                coord.state = ConnectionState::Faulted;
                let failure = e.to_string();
                coord.last_failure = Some(failure.clone());
                Err(CacheError::ReconnectFailed(failure))
            }
        };

        self.published.notify_all();
        result
    }

    /// Completed reconnect attempts since creation
    pub fn reconnect_attempts(&self) -> u64 {
        self.coordination.lock().attempts
    }

    /// Release the connection; later calls do nothing
    ///
    /// Workers still holding a handle finish with it; the sockets close
    /// when the last reference goes away.
    pub fn dispose(&self) {
        let mut coord = self.coordination.lock();
        if coord.disposed {
            debug!("Connection manager already disposed");
            return;
        }
        coord.disposed = true;
        coord.state = ConnectionState::Disconnected;
        let released = self.current.write().take();
        self.published.notify_all();
        drop(coord);

        if let Some(handle) = released {
            info!("Releasing connection #{}", handle.generation());
        }
    }

    fn current_generation(&self) -> u64 {
        self.current
            .read()
            .as_ref()
            .map_or(0, |handle| handle.generation())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
