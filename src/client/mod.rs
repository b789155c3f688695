//! Client connection layer

pub mod control_plane;
#[cfg(test)]
pub(crate) mod mock;
pub mod raw_connection;

pub use control_plane::{ControlPlane, ControlPlaneExt};
pub use raw_connection::{ConnectionFactory, Connector, NodeConnection, RawConnection};
