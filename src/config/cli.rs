//! Command-line argument parsing
//!
//! Connection settings come from, in order of precedence: `--connection-string`,
//! the `CacheConfig` settings file, then `--host`/`--port`. Auth and TLS
//! flags are applied on top of whichever source was used.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use super::cache_config::CacheConfig;
use super::descriptor::ConnectionDescriptor;
use super::tls_config::TlsConfig;
use crate::cluster::Endpoint;
use crate::connection::ManagerSettings;
use crate::retry::RetryPolicy;
use crate::utils::CacheError;

/// Resilient cache client: sets keys, scans them across shards, survives reconnects
#[derive(Parser, Debug, Clone)]
#[command(name = "cache-resilience")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    // ===== Settings Sources =====
    /// JSON settings file with a `CacheConfig` section
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Connection string (`host[:port],password=...,ssl=true,...`)
    #[arg(long = "connection-string")]
    pub connection_string: Option<String>,

    // ===== Connection Options =====
    /// Server hostname (can be specified multiple times for cluster seeds)
    #[arg(short = 'h', long = "host", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Server port
    #[arg(short = 'p', long = "port", default_value_t = 6379)]
    pub port: u16,

    /// Password for AUTH command
    #[arg(short = 'a', long = "auth")]
    pub password: Option<String>,

    /// Username for ACL AUTH (requires --auth)
    #[arg(long = "user")]
    pub username: Option<String>,

    /// Discover shards via CLUSTER NODES
    #[arg(long = "cluster")]
    pub cluster: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long = "tls")]
    pub tls: bool,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// CA certificate file for TLS
    #[arg(long = "tls-ca-cert")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Server Name Indication for TLS
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    // ===== Retry Policy =====
    /// Attempts per operation, including the first
    #[arg(long = "max-attempts", default_value_t = 3)]
    pub max_attempts: u32,

    /// Backoff base delay in milliseconds
    #[arg(long = "base-delay-ms", default_value_t = 100)]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[arg(long = "max-delay-ms", default_value_t = 5000)]
    pub max_delay_ms: u64,

    /// How long callers wait for an in-flight reconnect, in milliseconds
    #[arg(long = "reconnect-timeout-ms", default_value_t = 10000)]
    pub reconnect_timeout_ms: u64,

    // ===== Workload =====
    /// Number of keys to set (overrides NumberOfKeysToSet)
    #[arg(short = 'n', long = "keys")]
    pub keys: Option<u32>,

    /// Key prefix (overrides KeyPrefix)
    #[arg(long = "prefix")]
    pub prefix: Option<String>,

    /// Search term, scanned as `*<pattern>*` (overrides SearchPattern)
    #[arg(long = "pattern")]
    pub pattern: Option<String>,

    /// Finish setting keys before scanning (overrides SetKeysFirst)
    #[arg(long = "set-keys-first")]
    pub set_keys_first: bool,

    /// Pause between cluster scan rounds in milliseconds
    #[arg(long = "scan-interval-ms", default_value_t = 2000)]
    pub scan_interval_ms: u64,

    /// SCAN COUNT hint per page
    #[arg(long = "scan-page-size", default_value_t = 250)]
    pub scan_page_size: usize,

    /// Run the command demo (PING, GET/SET, JSON object) before the workers
    #[arg(long = "commands")]
    pub commands: bool,

    /// Time given to workers to stop after shutdown, in milliseconds
    #[arg(long = "grace-ms", default_value_t = 5000)]
    pub grace_ms: u64,

    // ===== Output Options =====
    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_some() && self.password.is_none() {
            return Err("--user requires --auth to be set".to_string());
        }
        if self.max_attempts == 0 {
            return Err("--max-attempts must be at least 1".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("--base-delay-ms must not exceed --max-delay-ms".to_string());
        }
        if self.scan_page_size == 0 {
            return Err("--scan-page-size must be at least 1".to_string());
        }
        if self.verbose && self.quiet {
            return Err("--verbose and --quiet are mutually exclusive".to_string());
        }
        Ok(())
    }

    /// Settings file (or defaults) with command-line overrides applied
    pub fn cache_config(&self) -> Result<CacheConfig, CacheError> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::load(path)?,
            None => CacheConfig::default(),
        };
        if let Some(keys) = self.keys {
            config.number_of_keys_to_set = keys;
        }
        if let Some(prefix) = &self.prefix {
            config.key_prefix = prefix.clone();
        }
        if let Some(pattern) = &self.pattern {
            config.search_pattern = pattern.clone();
        }
        config.set_keys_first |= self.set_keys_first;
        config.cluster_mode |= self.cluster;
        Ok(config)
    }

    /// Connection descriptor for `config`
    pub fn descriptor(&self, config: &CacheConfig) -> Result<ConnectionDescriptor, CacheError> {
        let mut descriptor = if let Some(connection_string) = &self.connection_string {
            ConnectionDescriptor::parse(connection_string)?
        } else if !config.name.trim().is_empty() {
            ConnectionDescriptor::from_cache_config(config)?
        } else {
            let hosts = if self.hosts.is_empty() {
                vec!["127.0.0.1".to_string()]
            } else {
                self.hosts.clone()
            };
            let mut descriptor = ConnectionDescriptor::new(Endpoint::new(hosts[0].clone(), self.port));
            descriptor.seeds = hosts
                .into_iter()
                .map(|host| Endpoint::new(host, self.port))
                .collect();
            descriptor
        };

        if self.password.is_some() {
            descriptor.password = self.password.clone();
        }
        if self.username.is_some() {
            descriptor.username = self.username.clone();
        }
        if self.tls || descriptor.tls.is_some() {
            let base = descriptor.tls.take().unwrap_or_default();
            descriptor.tls = Some(TlsConfig {
                skip_verify: base.skip_verify || self.tls_skip_verify,
                ca_cert: self.tls_ca_cert.clone().or(base.ca_cert),
                sni: self.tls_sni.clone().or(base.sni),
            });
        }
        descriptor.cluster_mode |= config.cluster_mode;
        Ok(descriptor)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, CacheError> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}
