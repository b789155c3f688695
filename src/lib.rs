//! cache-resilience library
//!
//! Shared, self-healing connection to a (possibly clustered) cache server:
//! coalesced reconnect, classified retry with capped backoff, and lazy
//! cluster-wide key scanning.

pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod retry;
pub mod shutdown;
pub mod utils;
pub mod workers;
