//! Cluster topology and key scanning
//!
//! - Shard discovery via CLUSTER NODES (primaries only)
//! - Slot mapping and CRC16 calculation for key routing
//! - Lazy per-shard and cluster-wide SCAN iteration

pub mod node;
pub mod scanner;
pub mod topology;

pub use node::{ClusterNode, Endpoint};
pub use scanner::{list_endpoints, scan, scan_cluster, ClusterScan, ScanItem, ShardScan};
pub use topology::{slot_for_key, Topology};
