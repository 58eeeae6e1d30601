//! Connection pooling for an HTTP/2 upstream target
//!
//! A [`ConnPool`] keeps every live multiplexed connection to its target,
//! grouped by peer address. New streams reuse the first connection that can
//! still take a request; a new connection is opened only when none can.
//! Connections leave the pool synchronously with the event that retires
//! them: a close, a goaway, or a dead-connection notification from the
//! multiplexer.

use crate::config::{Http2Config, PoolConfig};
use crate::error::Result;
use crate::logging::log_stats_snapshot;
use crate::models::{
    ConnectionEvent, PoolFailureReason, Protocol, StreamContext, StreamResetReason,
};
use crate::stats::{Counter, StatsSnapshot, UpstreamStats};
use crate::upstream::client::ActiveClient;
use crate::upstream::codec::{CodecClientFactory, StreamReceiver, StreamSender};
use crate::upstream::host::{Host, UpstreamHost};
use crate::upstream::http2::H2Upstream;
use crate::upstream::mux::{DeadConnectionNotifier, Multiplexer, MultiplexerFactory};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Handle for abandoning a pending stream request.
/// Reserved: pools currently complete or fail requests before returning.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Receives the outcome of `ConnectionPool::new_stream`, exactly once per call
pub trait PoolEventListener: Send + Sync {
    fn on_ready(&self, stream_id: &str, sender: Box<dyn StreamSender>, host: Arc<dyn Host>);

    fn on_failure(&self, stream_id: &str, reason: PoolFailureReason, host: Option<Arc<dyn Host>>);
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn host(&self) -> Arc<dyn Host>;

    async fn init_active_client(&self, context: &StreamContext) -> Result<()>;

    async fn new_stream(
        &self,
        context: &StreamContext,
        stream_id: &str,
        receiver: Arc<dyn StreamReceiver>,
        listener: &dyn PoolEventListener,
    ) -> Option<Box<dyn Cancellable>>;

    fn close(&self);
}

/// Collaborators a pool builds its connections with
#[derive(Clone)]
pub struct PoolComponents {
    pub multiplexer: Arc<dyn MultiplexerFactory>,
    pub codec: Arc<dyn CodecClientFactory>,
    pub http2: Http2Config,
}

/// Number of pooled connections per address
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub connections: HashMap<String, usize>,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.connections.values().sum()
    }
}

type ClientMap = HashMap<String, Vec<Arc<ActiveClient>>>;

/// HTTP/2 connection pool bound to one upstream host
pub struct ConnPool {
    host: Arc<dyn Host>,
    clients: Mutex<ClientMap>,
    // one in-flight connection attempt per address
    creation_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    multiplexer: OnceLock<Arc<dyn Multiplexer>>,
    components: PoolComponents,
    self_ref: Weak<ConnPool>,
}

impl ConnPool {
    pub fn new(host: Arc<dyn Host>, components: PoolComponents) -> Arc<Self> {
        info!("Creating HTTP/2 connection pool for {}", host.address_string());
        Arc::new_cyclic(|self_ref| Self {
            host,
            clients: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            multiplexer: OnceLock::new(),
            components,
            self_ref: self_ref.clone(),
        })
    }

    /// Pool for the configured target over TCP, multiplexed with `h2`
    pub fn from_config(config: &PoolConfig) -> Arc<Self> {
        let host = Arc::new(UpstreamHost::from_config(config));
        Self::new(host, H2Upstream::new().components(config.http2.clone()))
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnPool> {
        self.self_ref.clone()
    }

    /// The pool's multiplexer, built on first use with this pool as its
    /// dead-connection notifier
    pub(crate) fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        let multiplexer = self.multiplexer.get_or_init(|| {
            let notifier: Weak<dyn DeadConnectionNotifier> = self.self_ref.clone();
            self.components.multiplexer.build(notifier, &self.components.http2)
        });
        Arc::clone(multiplexer)
    }

    pub(crate) fn codec_factory(&self) -> &Arc<dyn CodecClientFactory> {
        &self.components.codec
    }

    /// Pooled clients currently registered for `address`
    pub fn active_clients(&self, address: &str) -> Vec<Arc<ActiveClient>> {
        self.lock_clients().get(address).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> PoolStats {
        let clients = self.lock_clients();
        PoolStats {
            connections: clients
                .iter()
                .map(|(address, list)| (address.clone(), list.len()))
                .collect(),
        }
    }

    /// Host-scoped counters as a serializable snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        self.host.host_stats().snapshot(self.host.address_string())
    }

    fn lock_clients(&self) -> MutexGuard<'_, ClientMap> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn creation_lock(&self, address: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .creation_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(address.to_string()).or_default())
    }

    fn find_available(&self, address: &str) -> Option<Arc<ActiveClient>> {
        self.lock_clients()
            .get(address)?
            .iter()
            .find(|client| client.can_take_new_request())
            .cloned()
    }

    /// Return the first pooled client for `address` that can take another
    /// stream, or open, register and return a new one.
    ///
    /// Creation is single-flight per address: callers that miss wait on the
    /// address's creation lock and re-scan before connecting, so concurrent
    /// misses produce one connection. Lookups for other addresses are never
    /// blocked by a handshake.
    pub async fn get_or_create_active_client(
        &self,
        context: &StreamContext,
        address: &str,
    ) -> Option<Arc<ActiveClient>> {
        if let Some(client) = self.find_available(address) {
            debug!("Reusing HTTP/2 connection {} to {}", client.id(), address);
            return Some(client);
        }

        let creation_lock = self.creation_lock(address);
        let _creating = creation_lock.lock().await;

        if let Some(client) = self.find_available(address) {
            debug!(
                "Reusing HTTP/2 connection {} to {} created concurrently",
                client.id(),
                address
            );
            return Some(client);
        }

        let client = match ActiveClient::connect(context, self).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to open HTTP/2 connection to {}: {}", address, e);
                return None;
            }
        };

        let registered = {
            let mut clients = self.lock_clients();
            let usable = !client.is_closed() && !client.is_retired();
            if usable {
                clients
                    .entry(address.to_string())
                    .or_default()
                    .push(Arc::clone(&client));
            }
            usable
        };

        if !registered {
            warn!(
                "HTTP/2 connection {} to {} closed or drained during setup",
                client.id(),
                address
            );
            client.close();
            return None;
        }
        debug!("Registered HTTP/2 connection {} to {}", client.id(), address);

        Some(client)
    }

    fn drain_clients(&self) -> Vec<Arc<ActiveClient>> {
        let mut clients = self.lock_clients();
        clients.drain().flat_map(|(_, list)| list).collect()
    }

    /// Drop `client` from its address list. Returns false if it was already gone.
    fn remove_client(&self, client: &ActiveClient) -> bool {
        let mut clients = self.lock_clients();
        let Some(list) = clients.get_mut(client.address()) else {
            return false;
        };

        let before = list.len();
        list.retain(|pooled| !std::ptr::eq(pooled.as_ref(), client));
        let removed = list.len() != before;

        if list.is_empty() {
            clients.remove(client.address());
        }
        removed
    }

    fn inc_stat(&self, counter: impl Fn(&UpstreamStats) -> &Counter) {
        counter(self.host.host_stats()).inc(1);
        counter(&self.host.cluster_info().stats().upstream).inc(1);
    }

    fn dec_stat(&self, counter: impl Fn(&UpstreamStats) -> &Counter) {
        counter(self.host.host_stats()).dec(1);
        counter(&self.host.cluster_info().stats().upstream).dec(1);
    }

    /// Close accounting, done once per client whichever path reports it first
    fn record_close(&self, client: &ActiveClient, event: ConnectionEvent) {
        if !client.mark_closed() {
            return;
        }
        self.dec_stat(|s| &s.upstream_connection_active);

        if !client.closed_with_active_request() && client.active_streams() == 0 {
            return;
        }
        match event {
            ConnectionEvent::LocalClose => {
                self.inc_stat(|s| &s.upstream_connection_local_close_with_active_request)
            }
            ConnectionEvent::RemoteClose => {
                self.inc_stat(|s| &s.upstream_connection_remote_close_with_active_request)
            }
            _ => {}
        }
    }

    pub(crate) fn on_connection_event(&self, client: &ActiveClient, event: ConnectionEvent) {
        if event.is_close() {
            self.record_close(client, event);

            if self.remove_client(client) {
                debug!(
                    "HTTP/2 connection {} to {} closed ({:?})",
                    client.id(),
                    client.address(),
                    event
                );
            }
        } else if event == ConnectionEvent::ConnectTimeout {
            warn!("HTTP/2 connection {} to {} timed out", client.id(), client.address());
            self.inc_stat(|s| &s.upstream_request_timeout);
            client.close();
        } else if event == ConnectionEvent::ConnectFailed {
            warn!("HTTP/2 connection {} to {} failed", client.id(), client.address());
            self.inc_stat(|s| &s.upstream_connection_con_fail);
        }
    }

    pub(crate) fn on_stream_destroy(&self, client: &ActiveClient) {
        client.record_stream_destroyed();
        self.dec_stat(|s| &s.upstream_request_active);
        self.host.cluster_info().resource_manager().requests().decrease();
    }

    pub(crate) fn on_stream_reset(&self, client: &ActiveClient, reason: StreamResetReason) {
        if reason.is_connection_failure() {
            self.inc_stat(|s| &s.upstream_request_failure_eject);
            client.mark_closed_with_active_request();
            return;
        }
        match reason {
            StreamResetReason::LocalReset => self.inc_stat(|s| &s.upstream_request_local_reset),
            StreamResetReason::RemoteReset => self.inc_stat(|s| &s.upstream_request_remote_reset),
            _ => {}
        }
    }

    pub(crate) fn on_go_away(&self, client: &ActiveClient) {
        self.inc_stat(|s| &s.upstream_connection_close_notify);
        client.mark_retired();

        if self.remove_client(client) {
            debug!(
                "HTTP/2 connection {} to {} retired after goaway",
                client.id(),
                client.address()
            );
        }
    }
}

#[async_trait]
impl ConnectionPool for ConnPool {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn host(&self) -> Arc<dyn Host> {
        Arc::clone(&self.host)
    }

    async fn init_active_client(&self, _context: &StreamContext) -> Result<()> {
        Ok(())
    }

    async fn new_stream(
        &self,
        context: &StreamContext,
        stream_id: &str,
        receiver: Arc<dyn StreamReceiver>,
        listener: &dyn PoolEventListener,
    ) -> Option<Box<dyn Cancellable>> {
        let address = self.host.address_string().to_string();

        let Some(client) = self.get_or_create_active_client(context, &address).await else {
            listener.on_failure(stream_id, PoolFailureReason::ConnectionFailure, None);
            return None;
        };

        let requests = self.host.cluster_info().resource_manager().requests();
        if !requests.try_increase() {
            debug!("Stream {} to {} rejected: request limit reached", stream_id, address);
            listener.on_failure(stream_id, PoolFailureReason::Overflow, None);
            self.inc_stat(|s| &s.upstream_request_pending_overflow);
            return None;
        }

        client.record_new_stream();
        self.inc_stat(|s| &s.upstream_request_total);
        self.inc_stat(|s| &s.upstream_request_active);
        debug!(
            "Stream {} on HTTP/2 connection {} (trace {})",
            stream_id,
            client.id(),
            context.trace_id.as_deref().unwrap_or("-")
        );

        let sender = client.codec_client().new_stream(stream_id, receiver);
        listener.on_ready(stream_id, sender, Arc::clone(&self.host));

        None
    }

    /// Close every pooled connection. Clients are drained under the lock and
    /// closed after it is released; codecs report their close events back
    /// into this pool.
    fn close(&self) {
        let drained = self.drain_clients();

        if !drained.is_empty() {
            info!(
                "Closing {} HTTP/2 connections to {}",
                drained.len(),
                self.host.address_string()
            );
        }

        for client in drained {
            client.close();
        }

        if let Err(e) = log_stats_snapshot(&self.snapshot()) {
            warn!("Failed to log pool stats for {}: {}", self.host.address_string(), e);
        }
    }
}

impl DeadConnectionNotifier for ConnPool {
    fn mark_dead(&self, connection_id: u64) {
        let mut clients = self.lock_clients();

        let found = clients.iter().find_map(|(address, list)| {
            list.iter()
                .position(|client| client.id() == connection_id)
                .map(|index| (address.clone(), index))
        });

        let Some((address, index)) = found else {
            debug!("Dead HTTP/2 connection {} is not pooled", connection_id);
            return;
        };

        if let Some(list) = clients.get_mut(&address) {
            list.remove(index);
            if list.is_empty() {
                clients.remove(&address);
            }
        }
        warn!("Evicted dead HTTP/2 connection {} to {}", connection_id, address);
    }
}

impl Drop for ConnPool {
    // Codec close events cannot reach a pool that is being dropped, so the
    // close accounting for drained clients happens here.
    fn drop(&mut self) {
        let drained = self.drain_clients();
        if !drained.is_empty() {
            info!(
                "Dropping pool for {} with {} HTTP/2 connections",
                self.host.address_string(),
                drained.len()
            );
        }
        for client in drained {
            self.record_close(&client, ConnectionEvent::LocalClose);
            client.close();
        }
    }
}
