//! Connection descriptor: everything needed to reach the cache
//!
//! Accepts the familiar comma-separated connection string format:
//! `host[:port][,host2[:port]],password=...,ssl=true,abortConnect=false`

use std::fmt;
use std::time::Duration;

use tracing::debug;

use super::cache_config::CacheConfig;
use super::tls_config::TlsConfig;
use crate::cluster::Endpoint;
use crate::utils::CacheError;

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_TLS_PORT: u16 = 6380;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Fully built connection parameters
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Addresses tried in order when (re)connecting
    pub seeds: Vec<Endpoint>,
    pub password: Option<String>,
    pub username: Option<String>,
    pub tls: Option<TlsConfig>,
    pub dbnum: Option<u32>,
    pub connect_timeout: Duration,
    /// Read/write timeout for a single command
    pub operation_timeout: Duration,
    pub cluster_mode: bool,
}

// Keep the password out of logs
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("seeds", &self.seeds)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("username", &self.username)
            .field("tls", &self.tls)
            .field("dbnum", &self.dbnum)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("cluster_mode", &self.cluster_mode)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Descriptor for a single plain-TCP endpoint with default timeouts
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            seeds: vec![endpoint],
            password: None,
            username: None,
            tls: None,
            dbnum: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cluster_mode: false,
        }
    }

    /// Parse a connection string
    ///
    /// Entries without `=` are endpoints. Ports default to 6379, or 6380
    /// when `ssl=true`. Unknown options are ignored.
    pub fn parse(connection_string: &str) -> Result<Self, CacheError> {
        let mut hosts: Vec<(String, Option<u16>)> = Vec::new();
        let mut descriptor = Self {
            seeds: Vec::new(),
            ..Self::new(Endpoint::new("", 0))
        };
        let mut ssl = false;
        let mut ssl_host = None;

        for part in connection_string.split(',').map(str::trim) {
            if part.is_empty() {
                continue;
            }

            let Some((key, value)) = part.split_once('=') else {
                hosts.push(parse_host(part)?);
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "password" => descriptor.password = Some(value.to_string()),
                "user" => descriptor.username = Some(value.to_string()),
                "ssl" => ssl = parse_bool(key, value)?,
                "sslhost" => ssl_host = Some(value.to_string()),
                "connecttimeout" => descriptor.connect_timeout = parse_millis(key, value)?,
                "synctimeout" => descriptor.operation_timeout = parse_millis(key, value)?,
                "defaultdatabase" => {
                    descriptor.dbnum = Some(value.parse().map_err(|_| {
                        CacheError::Config(format!("Invalid defaultDatabase '{}'", value))
                    })?);
                }
                other => debug!("Ignoring connection option '{}'", other),
            }
        }

        if hosts.is_empty() {
            return Err(CacheError::Config(
                "Connection string names no endpoint".to_string(),
            ));
        }

        let default_port = if ssl { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        descriptor.seeds = hosts
            .into_iter()
            .map(|(host, port)| Endpoint::new(host, port.unwrap_or(default_port)))
            .collect();
        if ssl {
            descriptor.tls = Some(TlsConfig {
                sni: ssl_host,
                ..TlsConfig::default()
            });
        }

        Ok(descriptor)
    }

    /// Build the descriptor for a managed cache named in `CacheConfig`
    pub fn from_cache_config(config: &CacheConfig) -> Result<Self, CacheError> {
        if config.name.trim().is_empty() {
            return Err(CacheError::Config("CacheConfig.Name is empty".to_string()));
        }
        let mut descriptor = Self::parse(&format!(
            "{}.redis.cache.windows.net,abortConnect=false,ssl=true",
            config.name.trim()
        ))?;
        if !config.password.is_empty() {
            descriptor.password = Some(config.password.clone());
        }
        descriptor.cluster_mode = config.cluster_mode;
        Ok(descriptor)
    }
}

fn parse_host(part: &str) -> Result<(String, Option<u16>), CacheError> {
    // Bare IPv6 addresses have more than one colon and no port
    match part.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            let port = port
                .parse()
                .map_err(|_| CacheError::Config(format!("Invalid port in '{}'", part)))?;
            Ok((host.trim_matches(&['[', ']'][..]).to_string(), Some(port)))
        }
        _ => Ok((part.trim_matches(&['[', ']'][..]).to_string(), None)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CacheError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(CacheError::Config(format!("Invalid {} '{}'", key, value))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, CacheError> {
    value
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| CacheError::Config(format!("Invalid {} '{}'", key, value)))
}
