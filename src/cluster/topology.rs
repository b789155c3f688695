//! Shard topology derived from one connection

use super::node::{parse_cluster_node_line, ClusterNode, Endpoint};
use crate::client::ControlPlaneExt;
use crate::utils::{CacheError, ClusterError};

pub const SLOT_COUNT: usize = 16384;

/// Shard endpoints as seen through one connection handle
///
/// A topology is never refreshed in place; a reconnect builds a new one.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Primary endpoints, ordered by their first owned slot
    endpoints: Vec<Endpoint>,
    /// Slot to endpoint index (empty in standalone mode)
    slot_map: Vec<Option<u16>>,
}

impl Topology {
    /// Topology of a non-clustered server: the seed is the only shard
    pub fn standalone(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
            slot_map: Vec::new(),
        }
    }

    /// Build from a CLUSTER NODES response
    ///
    /// Only available primaries count as shards. Replicas hold copies of
    /// their primary's keys and would duplicate them in a cluster scan.
    pub fn from_cluster_nodes(response: &str) -> Result<Self, ClusterError> {
        let mut primaries: Vec<ClusterNode> = response
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_cluster_node_line)
            .filter(|node| node.is_primary && node.is_available())
            .collect();

        if primaries.is_empty() {
            return Err(ClusterError::NoPrimaries);
        }

        primaries.sort_by_key(|n| (n.first_slot().unwrap_or(u16::MAX), n.endpoint.clone()));
        primaries.dedup_by(|a, b| a.endpoint == b.endpoint);

        let mut slot_map = vec![None; SLOT_COUNT];
        for (idx, node) in primaries.iter().enumerate() {
            for &(start, end) in &node.slot_ranges {
                if usize::from(end) >= SLOT_COUNT || start > end {
                    return Err(ClusterError::ParseFailed(format!(
                        "slot range {}-{} on {}",
                        start, end, node.endpoint
                    )));
                }
                for slot in start..=end {
                    slot_map[usize::from(slot)] = Some(idx as u16);
                }
            }
        }

        Ok(Self {
            endpoints: primaries.into_iter().map(|n| n.endpoint).collect(),
            slot_map,
        })
    }

    /// Query a node for the shard layout
    ///
    /// In standalone mode no command is sent and the seed is returned.
    pub fn discover<C>(conn: &mut C, seed: &Endpoint, cluster_mode: bool) -> Result<Self, CacheError>
    where
        C: ControlPlaneExt + ?Sized,
    {
        if !cluster_mode {
            return Ok(Self::standalone(seed.clone()));
        }
        let response = conn.cluster_nodes()?;
        Ok(Self::from_cluster_nodes(&response)?)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_cluster(&self) -> bool {
        !self.slot_map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Shard owning the slot of `key`
    ///
    /// Standalone topologies route every key to their single endpoint.
    pub fn endpoint_for_key(&self, key: &[u8]) -> Result<&Endpoint, ClusterError> {
        if !self.is_cluster() {
            return Ok(&self.endpoints[0]);
        }
        let slot = slot_for_key(key);
        self.slot_map[usize::from(slot)]
            .map(|idx| &self.endpoints[usize::from(idx)])
            .ok_or(ClusterError::UnassignedSlot(slot))
    }
}

/// Hash slot for a key using CRC16, honouring `{hash tags}`
pub fn slot_for_key(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            if end > 0 {
                return crc16(&key[start + 1..start + 1 + end]) % SLOT_COUNT as u16;
            }
        }
    }
    crc16(key) % SLOT_COUNT as u16
}

/// CRC16 (XMODEM) as used by cluster slot hashing
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
