//! Pool configuration

pub mod settings;

pub use settings::{Http2Config, LoggingConfig, PoolConfig, ResourceConfig, UpstreamConfig};
