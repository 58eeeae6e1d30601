//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! - [`transport`]: scripted transport connections and connector.
//! - [`upstream`]: [`MockUpstream`], an in-memory multiplexer and codec
//!   adapter with handles for firing lifecycle events.
//! - [`listener`]: a recording pool listener plus no-op and recording
//!   stream receivers.

pub mod listener;
pub mod transport;
pub mod upstream;

pub use listener::{NullReceiver, PoolOutcome, RecordingListener, RecordingReceiver};
pub use transport::{ScriptedConnection, ScriptedConnector};
pub use upstream::{MockCodecClient, MockMuxConnection, MockUpstream};

use crate::config::Http2Config;
use crate::upstream::{ClusterInfo, ConnPool, ResourceManager, UpstreamHost};
use std::sync::Arc;
use std::time::Duration;

/// Host at `address` whose connections come from `connector`
pub fn test_host(
    address: &str,
    max_requests: u64,
    connector: ScriptedConnector,
) -> Arc<UpstreamHost> {
    let cluster =
        ClusterInfo::new("test-cluster", ResourceManager::with_max_requests(max_requests));
    Arc::new(UpstreamHost::new(address, Arc::new(cluster), Arc::new(connector)))
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Everything a pool test usually needs
pub struct PoolHarness {
    pub pool: Arc<ConnPool>,
    pub host: Arc<UpstreamHost>,
    pub connector: ScriptedConnector,
    pub upstream: MockUpstream,
}

impl PoolHarness {
    pub fn new(address: &str, max_requests: u64, max_concurrent_streams: u32) -> Self {
        let connector = ScriptedConnector::new();
        let host = test_host(address, max_requests, connector.clone());
        let upstream = MockUpstream::new();
        let components = upstream.components(Http2Config { max_concurrent_streams });
        let pool = ConnPool::new(host.clone(), components);
        Self {
            pool,
            host,
            connector,
            upstream,
        }
    }
}
