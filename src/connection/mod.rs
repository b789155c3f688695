//! Connection lifecycle
//!
//! - `handle`: immutable snapshot of links plus the topology they were built from
//! - `manager`: shared owner of the current handle, with coalesced reconnect

pub mod handle;
pub mod manager;

pub use handle::ConnectionHandle;
pub use manager::{ConnectionManager, ConnectionState, ManagerSettings};
