//! Connection pool configuration settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for an upstream connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Log level configuration
    pub log_level: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream target configuration
    pub upstream: UpstreamConfig,

    /// HTTP/2 multiplexing configuration
    #[serde(default)]
    pub http2: Http2Config,

    /// Admission control limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable file logging (default: false)
    pub enable_file_logging: bool,

    /// Directory for rolling log files
    pub log_dir: String,
}

/// Upstream target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream address in host:port form
    pub address: String,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

/// HTTP/2 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http2Config {
    /// Concurrent stream ceiling per connection
    pub max_concurrent_streams: u32,
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Maximum in-flight requests across the upstream target
    pub max_requests: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            logging: LoggingConfig::default(),
            upstream: UpstreamConfig::default(),
            http2: Http2Config::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_file_logging: false,
            log_dir: "logs".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self { max_requests: 1024 }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl PoolConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: PoolConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from the given YAML file, falling back to environment variables
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_yaml_file(path)
        } else {
            let config = Self::from_env_vars();
            config.validate()?;
            Ok(config)
        }
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.upstream.address.trim().is_empty() {
            anyhow::bail!("upstream.address must not be empty");
        }
        if self.upstream.connect_timeout_secs == 0 {
            anyhow::bail!("upstream.connect_timeout_secs must be greater than zero");
        }
        if self.http2.max_concurrent_streams == 0 {
            anyhow::bail!("http2.max_concurrent_streams must be greater than zero");
        }
        if self.resources.max_requests == 0 {
            anyhow::bail!("resources.max_requests must be greater than zero");
        }
        Ok(())
    }

    /// Build configuration from defaults overridden by environment variables
    pub fn from_env_vars() -> Self {
        let mut config = Self::default();

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.log_level = log_level;
        }

        if let Ok(enable) = std::env::var("POOL_ENABLE_FILE_LOGGING") {
            config.logging.enable_file_logging = enable.to_lowercase() == "true";
        }

        if let Ok(dir) = std::env::var("POOL_LOG_DIR") {
            config.logging.log_dir = dir;
        }

        if let Ok(address) = std::env::var("POOL_UPSTREAM_ADDRESS") {
            config.upstream.address = address;
        }

        if let Ok(timeout) = std::env::var("POOL_CONNECT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                config.upstream.connect_timeout_secs = timeout;
            }
        }

        if let Ok(streams) = std::env::var("POOL_HTTP2_MAX_CONCURRENT_STREAMS") {
            if let Ok(streams) = streams.parse() {
                config.http2.max_concurrent_streams = streams;
            }
        }

        if let Ok(max) = std::env::var("POOL_MAX_REQUESTS") {
            if let Ok(max) = max.parse() {
                config.resources.max_requests = max;
            }
        }

        config
    }
}
