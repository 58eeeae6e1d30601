//! Statistics counters for upstream hosts and clusters
//!
//! Counters are plain atomics so that callers on any task can bump them
//! without coordinating with the pool lock.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic or gauge-style counter backed by an `AtomicU64`
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement without wrapping below zero
    pub fn dec(&self, n: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for Counter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.value())
    }
}

/// Counters kept for every upstream host, and mirrored at cluster scope
#[derive(Debug, Default, Serialize)]
pub struct UpstreamStats {
    pub upstream_connection_total: Counter,
    pub upstream_connection_active: Counter,
    pub upstream_connection_total_http2: Counter,
    pub upstream_connection_con_fail: Counter,
    pub upstream_connection_local_close_with_active_request: Counter,
    pub upstream_connection_remote_close_with_active_request: Counter,
    pub upstream_connection_close_notify: Counter,
    pub upstream_request_total: Counter,
    pub upstream_request_active: Counter,
    pub upstream_request_pending_overflow: Counter,
    pub upstream_request_timeout: Counter,
    pub upstream_request_failure_eject: Counter,
    pub upstream_request_local_reset: Counter,
    pub upstream_request_remote_reset: Counter,
}

impl UpstreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the counters, tagged with the owner's name
    pub fn snapshot(&self, name: &str) -> StatsSnapshot {
        StatsSnapshot {
            name: name.to_string(),
            timestamp: Utc::now(),
            connection_total: self.upstream_connection_total.value(),
            connection_active: self.upstream_connection_active.value(),
            connection_con_fail: self.upstream_connection_con_fail.value(),
            connection_close_notify: self.upstream_connection_close_notify.value(),
            request_total: self.upstream_request_total.value(),
            request_active: self.upstream_request_active.value(),
            request_pending_overflow: self.upstream_request_pending_overflow.value(),
            request_timeout: self.upstream_request_timeout.value(),
            request_failure_eject: self.upstream_request_failure_eject.value(),
        }
    }
}

/// Byte accounting counters handed to a codec adapter
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub read_total: Arc<Counter>,
    pub read_current: Arc<Counter>,
    pub write_total: Arc<Counter>,
    pub write_current: Arc<Counter>,
}

/// Cluster-wide counters: the per-host set plus shared byte counters
#[derive(Debug, Default)]
pub struct ClusterStats {
    pub upstream: UpstreamStats,
    pub upstream_bytes_read: Arc<Counter>,
    pub upstream_bytes_read_current: Arc<Counter>,
    pub upstream_bytes_write: Arc<Counter>,
    pub upstream_bytes_write_current: Arc<Counter>,
}

impl ClusterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection stats sharing this cluster's byte counters
    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            read_total: Arc::clone(&self.upstream_bytes_read),
            read_current: Arc::clone(&self.upstream_bytes_read_current),
            write_total: Arc::clone(&self.upstream_bytes_write),
            write_current: Arc::clone(&self.upstream_bytes_write_current),
        }
    }
}

/// Serializable copy of the most interesting counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub connection_total: u64,
    pub connection_active: u64,
    pub connection_con_fail: u64,
    pub connection_close_notify: u64,
    pub request_total: u64,
    pub request_active: u64,
    pub request_pending_overflow: u64,
    pub request_timeout: u64,
    pub request_failure_eject: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates_at_zero() {
        let counter = Counter::new();
        counter.inc(2);
        counter.dec(5);
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_connection_stats_share_cluster_counters() {
        let cluster = ClusterStats::new();
        let conn = cluster.connection_stats();
        conn.read_total.inc(128);
        conn.write_current.inc(7);
        assert_eq!(cluster.upstream_bytes_read.value(), 128);
        assert_eq!(cluster.upstream_bytes_write_current.value(), 7);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = UpstreamStats::new();
        stats.upstream_request_total.inc(3);
        let snapshot = stats.snapshot("10.0.0.1:8080");
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["request_total"], 3);
        assert_eq!(json["name"], "10.0.0.1:8080");

        let full = serde_json::to_value(&stats).unwrap();
        assert_eq!(full["upstream_request_total"], 3);
    }
}
