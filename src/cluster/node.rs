//! Shard endpoint and cluster node representation

use std::fmt;
use std::str::FromStr;

/// Address of one shard (or of a standalone server)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parse `host:port`; IPv6 hosts are split on the last colon
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in endpoint '{}'", s))?;
        if host.is_empty() {
            return Err(format!("Missing host in endpoint '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("Invalid port in endpoint '{}'", s))?;
        Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// Cluster node information from CLUSTER NODES
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Node ID
    pub id: String,
    pub endpoint: Endpoint,
    pub is_primary: bool,
    pub is_replica: bool,
    /// Primary node ID (if replica)
    pub primary_id: Option<String>,
    /// Assigned slot ranges, inclusive (primaries only)
    pub slot_ranges: Vec<(u16, u16)>,
    /// Node flags (myself, fail, handshake, ...)
    pub flags: Vec<String>,
    /// Link state reported as `connected`
    pub connected: bool,
}

impl ClusterNode {
    /// Check if node can serve traffic
    pub fn is_available(&self) -> bool {
        self.connected
            && !self
                .flags
                .iter()
                .any(|f| f == "fail" || f == "fail?" || f == "handshake" || f == "noaddr")
    }

    /// First slot owned by this node, used to order shards
    pub fn first_slot(&self) -> Option<u16> {
        self.slot_ranges.iter().map(|(start, _)| *start).min()
    }
}

/// Parse a line from CLUSTER NODES response
///
/// Format: `<id> <ip:port@cport[,hostname]> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> ...`
///
/// Example:
/// ```text
/// 07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
/// ```
pub fn parse_cluster_node_line(line: &str) -> Option<ClusterNode> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return None;
    }

    let endpoint = parse_node_address(parts[1])?;
    let flags: Vec<String> = parts[2].split(',').map(String::from).collect();

    let is_primary = flags.iter().any(|f| f == "master" || f == "primary");
    let is_replica = flags.iter().any(|f| f == "slave" || f == "replica");

    let primary_id = if is_replica && parts[3] != "-" {
        Some(parts[3].to_string())
    } else {
        None
    };

    let slot_ranges = if is_primary {
        parts[8..].iter().filter_map(|s| parse_slot_range(s)).collect()
    } else {
        Vec::new()
    };

    Some(ClusterNode {
        id: parts[0].to_string(),
        endpoint,
        is_primary,
        is_replica,
        primary_id,
        slot_ranges,
        flags,
        connected: parts[7] == "connected",
    })
}

/// Parse node address: "host:port@cport", "host:port", "host:port@cport,hostname"
fn parse_node_address(addr: &str) -> Option<Endpoint> {
    let addr = addr.split(',').next().unwrap_or(addr);
    let host_port = addr.split('@').next().unwrap_or(addr);
    let (host, port) = host_port.rsplit_once(':')?;
    // Nodes that have not learned their own address report ":0"
    if host.is_empty() {
        return None;
    }
    Some(Endpoint::new(host, port.parse().ok()?))
}

/// Parse slot range: "0-5460" or "0"
fn parse_slot_range(s: &str) -> Option<(u16, u16)> {
    // Migrating/importing markers like "[123->-node_id]"
    if s.starts_with('[') {
        return None;
    }

    match s.split_once('-') {
        Some((start, end)) => Some((start.parse().ok()?, end.parse().ok()?)),
        None => {
            let slot = s.parse().ok()?;
            Some((slot, slot))
        }
    }
}
