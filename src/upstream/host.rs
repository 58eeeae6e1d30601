//! Upstream host metadata, cluster info and admission control

use crate::config::PoolConfig;
use crate::models::StreamContext;
use crate::stats::{ClusterStats, UpstreamStats};
use crate::upstream::connection::{ClientConnection, Connector, TcpConnector};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A freshly created, not yet connected, transport connection
pub struct CreateConnectionData {
    pub connection: Box<dyn ClientConnection>,
    pub address: String,
}

impl fmt::Debug for CreateConnectionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateConnectionData")
            .field("connection", &self.connection.id())
            .field("address", &self.address)
            .finish()
    }
}

/// The upstream target a pool is bound to
pub trait Host: Send + Sync {
    fn address_string(&self) -> &str;

    fn create_connection(&self, context: &StreamContext) -> CreateConnectionData;

    fn host_stats(&self) -> &UpstreamStats;

    fn cluster_info(&self) -> &ClusterInfo;
}

/// Gate over a bounded, shared resource such as in-flight requests
pub trait Resource: Send + Sync {
    fn can_create(&self) -> bool;
    fn increase(&self);

    /// Take one unit if the bound allows it. Implementations shared across
    /// threads should make the check and the increment one atomic step.
    fn try_increase(&self) -> bool {
        if !self.can_create() {
            return false;
        }
        self.increase();
        true
    }

    fn decrease(&self);
    fn max(&self) -> u64;
    fn current(&self) -> u64;
}

/// Atomic counter with an upper bound
#[derive(Debug)]
pub struct BoundedResource {
    current: AtomicU64,
    max: u64,
}

impl BoundedResource {
    pub fn new(max: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            max,
        }
    }
}

impl Resource for BoundedResource {
    fn can_create(&self) -> bool {
        self.current.load(Ordering::Acquire) < self.max
    }

    fn increase(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    fn try_increase(&self) -> bool {
        let max = self.max;
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v < max).then_some(v + 1))
            .is_ok()
    }

    fn decrease(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    fn max(&self) -> u64 {
        self.max
    }

    fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

/// Admission controllers for a cluster
pub struct ResourceManager {
    requests: Arc<dyn Resource>,
}

impl ResourceManager {
    pub fn new(requests: Arc<dyn Resource>) -> Self {
        Self { requests }
    }

    pub fn with_max_requests(max_requests: u64) -> Self {
        Self::new(Arc::new(BoundedResource::new(max_requests)))
    }

    pub fn requests(&self) -> &dyn Resource {
        self.requests.as_ref()
    }
}

/// Cluster-wide information shared by every host of the cluster
pub struct ClusterInfo {
    name: String,
    stats: ClusterStats,
    resource_manager: ResourceManager,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>, resource_manager: ResourceManager) -> Self {
        Self {
            name: name.into(),
            stats: ClusterStats::new(),
            resource_manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }
}

/// Concrete host: an address, its cluster and a connector
pub struct UpstreamHost {
    address: String,
    stats: UpstreamStats,
    cluster: Arc<ClusterInfo>,
    connector: Arc<dyn Connector>,
}

impl UpstreamHost {
    pub fn new(
        address: impl Into<String>,
        cluster: Arc<ClusterInfo>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            address: address.into(),
            stats: UpstreamStats::new(),
            cluster,
            connector,
        }
    }

    /// TCP host with its own cluster, sized from configuration
    pub fn from_config(config: &PoolConfig) -> Self {
        let cluster = ClusterInfo::new(
            config.upstream.address.clone(),
            ResourceManager::with_max_requests(config.resources.max_requests),
        );
        let connector = TcpConnector::new(config.upstream.connect_timeout());
        Self::new(config.upstream.address.clone(), Arc::new(cluster), Arc::new(connector))
    }

    pub fn cluster(&self) -> Arc<ClusterInfo> {
        Arc::clone(&self.cluster)
    }
}

impl Host for UpstreamHost {
    fn address_string(&self) -> &str {
        &self.address
    }

    fn create_connection(&self, _context: &StreamContext) -> CreateConnectionData {
        CreateConnectionData {
            connection: self.connector.connection(&self.address),
            address: self.address.clone(),
        }
    }

    fn host_stats(&self) -> &UpstreamStats {
        &self.stats
    }

    fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster
    }
}
