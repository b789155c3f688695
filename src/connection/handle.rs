//! Immutable connection handle
//!
//! A handle bundles the topology discovered when it was established with one
//! link per shard. It is never mutated after publication: a reconnect builds
//! a new handle with a higher generation. Individual links may be re-dialled
//! lazily after an I/O failure, which does not change the topology.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{Connector, ControlPlane, ControlPlaneExt, NodeConnection};
use crate::cluster::{Endpoint, Topology};
use crate::utils::{CacheError, ConnectionError, Result};

/// Connection to one node, dialled on demand
struct Link {
    endpoint: Endpoint,
    conn: Mutex<Option<NodeConnection>>,
}

impl Link {
    fn idle(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn: Mutex::new(None),
        }
    }

    fn open(conn: NodeConnection) -> Self {
        Self {
            endpoint: conn.endpoint().clone(),
            conn: Mutex::new(Some(conn)),
        }
    }

    /// Run `f` on this link's connection, dialling it first if needed
    ///
    /// Commands on one link are serialized by the mutex. A connection whose
    /// reply stream may be out of sync is dropped instead of put back.
    fn with<T>(
        &self,
        connector: &dyn Connector,
        f: impl FnOnce(&mut dyn ControlPlane) -> Result<T>,
    ) -> Result<T> {
        let mut slot = self.conn.lock();
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!("Dialling {}", self.endpoint);
                connector.connect(&self.endpoint)?
            }
        };

        let result = f(&mut *conn);
        match &result {
            Err(CacheError::Connection(ConnectionError::Io { .. }))
            | Err(CacheError::Protocol { .. }) => {
                warn!("Dropping link to {} after failure", self.endpoint);
            }
            _ => *slot = Some(conn),
        }
        result
    }
}

pub struct ConnectionHandle {
    generation: u64,
    seed: Endpoint,
    topology: Topology,
    links: HashMap<Endpoint, Link>,
    connector: Arc<dyn Connector>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("seed", &self.seed)
            .field("topology", &self.topology)
            .finish()
    }
}

impl ConnectionHandle {
    /// Connect to the first reachable seed, verify it and discover shards
    pub fn establish(
        connector: Arc<dyn Connector>,
        seeds: &[Endpoint],
        cluster_mode: bool,
        generation: u64,
    ) -> Result<Self> {
        let mut last_err = CacheError::Config("No seed endpoints configured".to_string());

        for seed in seeds {
            match Self::handshake(connector.as_ref(), seed, cluster_mode) {
                Ok((conn, topology)) => {
                    info!(
                        "Connection #{} established via {}: {} shard(s)",
                        generation,
                        seed,
                        topology.len()
                    );

                    let mut links: HashMap<Endpoint, Link> = topology
                        .endpoints()
                        .iter()
                        .map(|ep| (ep.clone(), Link::idle(ep.clone())))
                        .collect();
                    links.insert(seed.clone(), Link::open(conn));

                    return Ok(Self {
                        generation,
                        seed: seed.clone(),
                        topology,
                        links,
                        connector,
                    });
                }
                Err(e) => {
                    warn!("Handshake with {} failed: {}", seed, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    fn handshake(
        connector: &dyn Connector,
        seed: &Endpoint,
        cluster_mode: bool,
    ) -> Result<(NodeConnection, Topology)> {
        let mut conn = connector.connect(seed)?;
        conn.ping()?;
        let topology = Topology::discover(&mut *conn, seed, cluster_mode)?;
        Ok((conn, topology))
    }

    /// Monotonic id; a higher generation replaced a lower one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn seed(&self) -> &Endpoint {
        &self.seed
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Shard endpoints in scan order
    pub fn endpoints(&self) -> &[Endpoint] {
        self.topology.endpoints()
    }

    /// Run `f` on the link to a specific shard
    pub fn with_node<T>(
        &self,
        endpoint: &Endpoint,
        f: impl FnOnce(&mut dyn ControlPlane) -> Result<T>,
    ) -> Result<T> {
        let link = self
            .links
            .get(endpoint)
            .ok_or_else(|| ConnectionError::NoLink(endpoint.clone()))?;
        link.with(self.connector.as_ref(), f)
    }

    /// Run `f` on the node owning `key`'s hash slot
    pub fn with_key<T>(
        &self,
        key: &[u8],
        f: impl FnOnce(&mut dyn ControlPlane) -> Result<T>,
    ) -> Result<T> {
        let endpoint = self.topology.endpoint_for_key(key)?;
        self.with_node(endpoint, f)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_node(&self.seed, |conn| conn.ping())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_key(key, |conn| conn.get(key))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.with_key(key, |conn| conn.set(key, value))
    }

    pub fn del(&self, key: &[u8]) -> Result<i64> {
        self.with_key(key, |conn| conn.del(key))
    }

    /// One SCAN page from one shard
    pub fn scan_page(
        &self,
        endpoint: &Endpoint,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.with_node(endpoint, |conn| conn.scan_page(cursor, pattern, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockCluster;

    #[test]
    fn test_establish_standalone() {
        let cluster = MockCluster::standalone(&[]);
        let handle = ConnectionHandle::establish(cluster.connector(), &[cluster.seed()], false, 1)
            .unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.endpoints(), &[cluster.seed()]);
        handle.ping().unwrap();
        // Control link doubles as the shard link
        assert_eq!(cluster.dials(), 1);
    }

    #[test]
    fn test_establish_falls_through_seeds() {
        let cluster = MockCluster::standalone(&[]);
        let dead = Endpoint::new("10.255.255.1", 6379);
        cluster.refuse(&dead);
        let handle =
            ConnectionHandle::establish(cluster.connector(), &[dead, cluster.seed()], false, 3)
                .unwrap();
        assert_eq!(handle.seed(), &cluster.seed());
    }

    #[test]
    fn test_keys_routed_to_owning_shard() {
        let cluster = MockCluster::sharded(&[&[], &[], &[]]);
        let handle =
            ConnectionHandle::establish(cluster.connector(), &[cluster.seed()], true, 1).unwrap();
        assert_eq!(handle.endpoints().len(), 3);

        assert!(handle.set(b"foo", b"bar").unwrap());
        assert_eq!(handle.get(b"foo").unwrap(), Some(b"bar".to_vec()));

        // "foo" lives in slot 12182, the third shard
        let owner = handle.topology().endpoint_for_key(b"foo").unwrap().clone();
        assert_eq!(owner, handle.endpoints()[2]);
        assert_eq!(cluster.commands_on(&owner, "SET"), 1);

        assert_eq!(handle.del(b"foo").unwrap(), 1);
        assert_eq!(handle.get(b"foo").unwrap(), None);
        assert_eq!(cluster.commands_on(&owner, "DEL"), 1);
    }

    #[test]
    fn test_link_redialled_after_io_failure() {
        let cluster = MockCluster::standalone(&[]);
        let handle = ConnectionHandle::establish(cluster.connector(), &[cluster.seed()], false, 1)
            .unwrap();

        cluster.fail_next_io(std::io::ErrorKind::TimedOut);
        assert!(handle.get(b"k").is_err());
        assert_eq!(cluster.closed(), 1);

        assert_eq!(handle.get(b"k").unwrap(), None);
        assert_eq!(cluster.dials(), 2);
        assert_eq!(handle.generation(), 1);
    }

    #[test]
    fn test_unknown_endpoint_has_no_link() {
        let cluster = MockCluster::standalone(&[]);
        let handle = ConnectionHandle::establish(cluster.connector(), &[cluster.seed()], false, 1)
            .unwrap();
        let err = handle
            .scan_page(&Endpoint::new("elsewhere", 1), 0, "*", 10)
            .unwrap_err();
        assert!(matches!(err, CacheError::Connection(ConnectionError::NoLink(_))));
    }
}
