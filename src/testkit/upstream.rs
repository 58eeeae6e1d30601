//! In-memory multiplexer and codec adapter.
//!
//! [`MockUpstream`] plays both external roles a pool depends on: it is the
//! [`MultiplexerFactory`]/[`Multiplexer`] that "handshakes" connections and
//! the [`CodecClientFactory`] that wraps them. Every connection and codec it
//! creates is kept so tests can fire goaway, reset, destroy and close events
//! the way a real codec would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Http2Config;
use crate::error::{Error, Result};
use crate::models::{ConnectionEvent, Protocol, StreamContext, StreamResetReason};
use crate::stats::ConnectionStats;
use crate::upstream::codec::{
    CodecClient, CodecClientCallbacks, CodecClientFactory, ConnectionEventListener,
    StreamConnectionEventListener, StreamReceiver, StreamSender,
};
use crate::upstream::connection::BoxedIo;
use crate::upstream::connection_pool::PoolComponents;
use crate::upstream::host::CreateConnectionData;
use crate::upstream::mux::{DeadConnectionNotifier, Multiplexer, MultiplexerFactory, MuxConnection};

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// MockMuxConnection
// ---------------------------------------------------------------------------

pub struct MockMuxConnection {
    id: u64,
    max_streams: u32,
    open_streams: AtomicU32,
    accepting: AtomicBool,
}

impl MockMuxConnection {
    pub fn new(max_streams: u32) -> Self {
        Self {
            id: NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed),
            max_streams,
            open_streams: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn open_streams(&self) -> u32 {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Stop accepting streams, as after a goaway or on close
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

impl MuxConnection for MockMuxConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn can_take_new_request(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.open_streams() < self.max_streams
    }
}

// ---------------------------------------------------------------------------
// MockCodecClient
// ---------------------------------------------------------------------------

struct MockStreamSender {
    stream_id: String,
}

impl StreamSender for MockStreamSender {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn append_headers(&self, _headers: HashMap<String, String>, _end_stream: bool) -> Result<()> {
        Ok(())
    }

    fn append_data(&self, _data: Bytes, _end_stream: bool) -> Result<()> {
        Ok(())
    }
}

/// Codec adapter that records its listeners and lets tests drive them
pub struct MockCodecClient {
    mux: Arc<MockMuxConnection>,
    connection_listeners: Mutex<Vec<Weak<dyn ConnectionEventListener>>>,
    client_callbacks: Mutex<Option<Weak<dyn CodecClientCallbacks>>>,
    connection_callbacks: Mutex<Option<Weak<dyn StreamConnectionEventListener>>>,
    stats: Mutex<Option<ConnectionStats>>,
    streams: AtomicU64,
    closed: AtomicBool,
    // peer drains the connection as soon as a goaway listener is wired
    go_away_on_wire: bool,
}

impl MockCodecClient {
    fn new(mux: Arc<MockMuxConnection>, go_away_on_wire: bool) -> Self {
        Self {
            mux,
            connection_listeners: Mutex::new(Vec::new()),
            client_callbacks: Mutex::new(None),
            connection_callbacks: Mutex::new(None),
            stats: Mutex::new(None),
            streams: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            go_away_on_wire,
        }
    }

    pub fn mux(&self) -> &Arc<MockMuxConnection> {
        &self.mux
    }

    pub fn streams_created(&self) -> u64 {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_connection_stats(&self) -> bool {
        self.stats.lock().unwrap().is_some()
    }

    /// Deliver a connection event to every registered listener
    pub fn fire_event(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = self.connection_listeners.lock().unwrap().clone();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.on_event(event);
        }
    }

    /// Peer closed the connection
    pub fn remote_close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.mux.stop_accepting();
            self.fire_event(ConnectionEvent::RemoteClose);
        }
    }

    pub fn go_away(&self) {
        self.mux.stop_accepting();
        let listener = self.connection_callbacks.lock().unwrap().clone();
        if let Some(listener) = listener.and_then(|l| l.upgrade()) {
            listener.on_go_away();
        }
    }

    pub fn reset_stream(&self, reason: StreamResetReason) {
        let listener = self.client_callbacks.lock().unwrap().clone();
        if let Some(listener) = listener.and_then(|l| l.upgrade()) {
            listener.on_stream_reset(reason);
        }
    }

    /// Finish one stream, releasing its slot on the connection
    pub fn destroy_stream(&self) {
        let _ = self
            .mux
            .open_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
        let listener = self.client_callbacks.lock().unwrap().clone();
        if let Some(listener) = listener.and_then(|l| l.upgrade()) {
            listener.on_stream_destroy();
        }
    }
}

impl CodecClient for MockCodecClient {
    fn new_stream(
        &self,
        stream_id: &str,
        _receiver: Arc<dyn StreamReceiver>,
    ) -> Box<dyn StreamSender> {
        self.mux.open_streams.fetch_add(1, Ordering::SeqCst);
        self.streams.fetch_add(1, Ordering::SeqCst);
        Box::new(MockStreamSender {
            stream_id: stream_id.to_string(),
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.mux.stop_accepting();
            self.fire_event(ConnectionEvent::LocalClose);
        }
    }

    fn add_connection_callbacks(&self, listener: Weak<dyn ConnectionEventListener>) {
        self.connection_listeners.lock().unwrap().push(listener);
    }

    fn set_codec_client_callbacks(&self, listener: Weak<dyn CodecClientCallbacks>) {
        *self.client_callbacks.lock().unwrap() = Some(listener);
    }

    fn set_codec_connection_callbacks(&self, listener: Weak<dyn StreamConnectionEventListener>) {
        *self.connection_callbacks.lock().unwrap() = Some(listener);
        if self.go_away_on_wire {
            self.go_away();
        }
    }

    fn set_connection_stats(&self, stats: ConnectionStats) {
        *self.stats.lock().unwrap() = Some(stats);
    }
}

// ---------------------------------------------------------------------------
// MockUpstream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    max_streams: AtomicU32,
    builds: AtomicU32,
    fail_handshake: AtomicBool,
    fail_codec: AtomicBool,
    go_away_on_wire: AtomicBool,
    notifier: Mutex<Option<Weak<dyn DeadConnectionNotifier>>>,
    connections: Mutex<Vec<Arc<MockMuxConnection>>>,
    codecs: Mutex<Vec<Arc<MockCodecClient>>>,
}

/// Multiplexer and codec factory backed by in-memory connections
#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<MockState>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool components wired to this mock
    pub fn components(&self, http2: Http2Config) -> PoolComponents {
        PoolComponents {
            multiplexer: Arc::new(self.clone()),
            codec: Arc::new(self.clone()),
            http2,
        }
    }

    pub fn set_fail_handshake(&self, fail: bool) {
        self.state.fail_handshake.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_codec(&self, fail: bool) {
        self.state.fail_codec.store(fail, Ordering::SeqCst);
    }

    /// New codecs report a goaway the moment their listener is wired
    pub fn set_go_away_on_wire(&self, enabled: bool) {
        self.state.go_away_on_wire.store(enabled, Ordering::SeqCst);
    }

    /// How many multiplexers were built from this factory
    pub fn builds(&self) -> u32 {
        self.state.builds.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockMuxConnection>> {
        self.state.connections.lock().unwrap().clone()
    }

    pub fn codecs(&self) -> Vec<Arc<MockCodecClient>> {
        self.state.codecs.lock().unwrap().clone()
    }

    pub fn codec(&self, index: usize) -> Arc<MockCodecClient> {
        Arc::clone(&self.state.codecs.lock().unwrap()[index])
    }

    /// Report a connection as unusable, as the multiplexer would on its own
    pub fn mark_dead(&self, connection_id: u64) {
        let notifier = self.state.notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier.and_then(|n| n.upgrade()) {
            notifier.mark_dead(connection_id);
        }
    }
}

impl MultiplexerFactory for MockUpstream {
    fn build(
        &self,
        notifier: Weak<dyn DeadConnectionNotifier>,
        settings: &Http2Config,
    ) -> Arc<dyn Multiplexer> {
        self.state.builds.fetch_add(1, Ordering::SeqCst);
        self.state.max_streams.store(settings.max_concurrent_streams, Ordering::SeqCst);
        *self.state.notifier.lock().unwrap() = Some(notifier);
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Multiplexer for MockUpstream {
    async fn new_client_conn(&self, _io: BoxedIo) -> Result<Arc<dyn MuxConnection>> {
        if self.state.fail_handshake.load(Ordering::SeqCst) {
            return Err(Error::Handshake("scripted handshake failure".to_string()));
        }
        let conn = Arc::new(MockMuxConnection::new(self.state.max_streams.load(Ordering::SeqCst)));
        self.state.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }
}

impl CodecClientFactory for MockUpstream {
    fn create(
        &self,
        _context: &StreamContext,
        _protocol: Protocol,
        mux_conn: Arc<dyn MuxConnection>,
        _data: &CreateConnectionData,
    ) -> Result<Arc<dyn CodecClient>> {
        if self.state.fail_codec.load(Ordering::SeqCst) {
            return Err(Error::Codec("scripted codec failure".to_string()));
        }
        let mux = self
            .connections()
            .into_iter()
            .find(|conn| conn.id() == mux_conn.id())
            .ok_or_else(|| Error::Codec(format!("unknown connection {}", mux_conn.id())))?;
        let go_away_on_wire = self.state.go_away_on_wire.load(Ordering::SeqCst);
        let codec = Arc::new(MockCodecClient::new(mux, go_away_on_wire));
        self.state.codecs.lock().unwrap().push(Arc::clone(&codec));
        Ok(codec)
    }
}
