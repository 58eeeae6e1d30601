//! HTTP/2 upstream connection pool for a reverse proxy data plane
//!
//! This library keeps persistent multiplexed connections to an upstream
//! target, reuses them while they can take more streams, gates requests
//! through the cluster's admission controller, and folds connection
//! lifecycle events into host and cluster statistics.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod stats;
pub mod upstream;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

// Re-export commonly used items
pub use config::settings::PoolConfig;
pub use error::{Error, Result};
pub use logging::init_logger_with_config;
pub use models::{ConnectionEvent, PoolFailureReason, Protocol, StreamContext, StreamResetReason};
pub use upstream::{
    ActiveClient, ConnPool, ConnectionPool, H2Upstream, PoolComponents, PoolEventListener,
    UpstreamHost,
};
