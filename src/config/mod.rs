//! Configuration module

pub mod cache_config;
pub mod cli;
pub mod descriptor;
pub mod tls_config;

pub use cache_config::CacheConfig;
pub use cli::CliArgs;
pub use descriptor::ConnectionDescriptor;
pub use tls_config::TlsConfig;
