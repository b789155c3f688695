//! TLS configuration

use std::path::PathBuf;

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
    /// Server Name Indication override (defaults to the endpoint host)
    pub sni: Option<String>,
}
