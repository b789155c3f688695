//! Utility modules

pub mod error;
pub mod resp;

pub use error::{CacheError, ClusterError, ConnectionError, Result};
pub use resp::{parse_scan_reply, RespDecoder, RespEncoder, RespValue};
