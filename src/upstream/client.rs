//! Pooled upstream HTTP/2 connection

use crate::error::{Error, Result};
use crate::models::{ConnectionEvent, Protocol, StreamContext, StreamResetReason};
use crate::upstream::codec::{
    CodecClient, CodecClientCallbacks, ConnectionEventListener, StreamConnectionEventListener,
};
use crate::upstream::connection::ClientConnection;
use crate::upstream::connection_pool::{ConnPool, ConnectionPool};
use crate::upstream::mux::MuxConnection;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// One multiplexed connection owned by a [`ConnPool`].
///
/// The client is the listener the codec reports to; every callback is
/// forwarded to the owning pool together with the client itself.
pub struct ActiveClient {
    pool: Weak<ConnPool>,
    address: String,
    connection: Box<dyn ClientConnection>,
    mux_conn: Arc<dyn MuxConnection>,
    codec_client: Arc<dyn CodecClient>,
    total_streams: AtomicU64,
    active_streams: AtomicU64,
    close_with_active_req: AtomicBool,
    closed: AtomicBool,
    // set by goaway; a retired client is never selected or registered
    retired: AtomicBool,
}

impl ActiveClient {
    /// Connect, handshake and wire a new client for `pool`.
    /// Nothing is registered with the pool here; on error every partially
    /// opened resource is closed.
    pub(crate) async fn connect(context: &StreamContext, pool: &ConnPool) -> Result<Arc<Self>> {
        let host = pool.host();
        let data = host.create_connection(context);

        data.connection.connect().await?;

        let io = match data.connection.take_raw_conn() {
            Some(io) => io,
            None => {
                data.connection.close();
                return Err(Error::UpstreamConnection(format!(
                    "raw transport unavailable for {}",
                    data.address
                )));
            }
        };

        let mux_conn = match pool.multiplexer().new_client_conn(io).await {
            Ok(conn) => conn,
            Err(e) => {
                data.connection.close();
                return Err(e);
            }
        };

        let codec_client = match pool.codec_factory().create(
            context,
            Protocol::Http2,
            Arc::clone(&mux_conn),
            &data,
        ) {
            Ok(codec) => codec,
            Err(e) => {
                data.connection.close();
                return Err(e);
            }
        };

        let client = Arc::new(Self {
            pool: pool.downgrade(),
            address: data.address,
            connection: data.connection,
            mux_conn,
            codec_client,
            total_streams: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            close_with_active_req: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        });

        let weak: Weak<ActiveClient> = Arc::downgrade(&client);
        let connection_listener: Weak<dyn ConnectionEventListener> = weak.clone();
        let codec_listener: Weak<dyn CodecClientCallbacks> = weak.clone();
        let stream_conn_listener: Weak<dyn StreamConnectionEventListener> = weak;
        client.codec_client.add_connection_callbacks(connection_listener);
        client.codec_client.set_codec_client_callbacks(codec_listener);
        client.codec_client.set_codec_connection_callbacks(stream_conn_listener);

        let cluster = host.cluster_info();
        for stats in [host.host_stats(), &cluster.stats().upstream] {
            stats.upstream_connection_total.inc(1);
            stats.upstream_connection_active.inc(1);
            stats.upstream_connection_total_http2.inc(1);
        }
        client.codec_client.set_connection_stats(cluster.stats().connection_stats());

        debug!(
            "New HTTP/2 connection {} to {} (transport {})",
            client.id(),
            client.address,
            client.connection.id()
        );

        Ok(client)
    }

    /// Identity of the multiplexed connection
    pub fn id(&self) -> u64 {
        self.mux_conn.id()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn can_take_new_request(&self) -> bool {
        !self.is_closed() && !self.is_retired() && self.mux_conn.can_take_new_request()
    }

    pub fn codec_client(&self) -> &Arc<dyn CodecClient> {
        &self.codec_client
    }

    pub fn total_streams(&self) -> u64 {
        self.total_streams.load(Ordering::Acquire)
    }

    pub fn active_streams(&self) -> u64 {
        self.active_streams.load(Ordering::Acquire)
    }

    /// Set once a stream was reset because the connection terminated or failed
    pub fn closed_with_active_request(&self) -> bool {
        self.close_with_active_req.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Close the codec and the transport connection
    pub fn close(&self) {
        self.codec_client.close();
        self.connection.close();
    }

    pub(crate) fn record_new_stream(&self) {
        self.total_streams.fetch_add(1, Ordering::AcqRel);
        self.active_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_stream_destroyed(&self) {
        let _ = self
            .active_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    pub(crate) fn mark_closed_with_active_request(&self) {
        self.close_with_active_req.store(true, Ordering::Release);
    }

    /// Returns true only for the first caller
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn with_pool(&self, f: impl FnOnce(&ConnPool)) {
        match self.pool.upgrade() {
            Some(pool) => f(&pool),
            None => debug!("Event for connection {} after its pool was dropped", self.id()),
        }
    }
}

impl fmt::Debug for ActiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveClient")
            .field("id", &self.id())
            .field("address", &self.address)
            .field("total_streams", &self.total_streams())
            .field("active_streams", &self.active_streams())
            .field("closed", &self.is_closed())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl ConnectionEventListener for ActiveClient {
    fn on_event(&self, event: ConnectionEvent) {
        self.with_pool(|pool| pool.on_connection_event(self, event));
    }
}

impl CodecClientCallbacks for ActiveClient {
    fn on_stream_destroy(&self) {
        self.with_pool(|pool| pool.on_stream_destroy(self));
    }

    fn on_stream_reset(&self, reason: StreamResetReason) {
        self.with_pool(|pool| pool.on_stream_reset(self, reason));
    }
}

impl StreamConnectionEventListener for ActiveClient {
    fn on_go_away(&self) {
        self.with_pool(|pool| pool.on_go_away(self));
    }
}
