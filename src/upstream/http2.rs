//! HTTP/2 multiplexer and codec adapter built on `h2`
//!
//! [`H2Upstream`] is both the [`MultiplexerFactory`] a pool builds its
//! multiplexer from and the [`CodecClientFactory`] that wraps every
//! handshaken connection. Each connection is driven on its own task. When
//! the driver stops, the codec reports the end of the connection to its
//! listeners; a driver error is also reported to the pool through
//! [`DeadConnectionNotifier::mark_dead`].

use crate::config::Http2Config;
use crate::error::{Error, Result};
use crate::models::{ConnectionEvent, Protocol, StreamContext, StreamResetReason};
use crate::stats::ConnectionStats;
use crate::upstream::codec::{
    CodecClient, CodecClientCallbacks, CodecClientFactory, ConnectionEventListener,
    StreamConnectionEventListener, StreamReceiver, StreamSender,
};
use crate::upstream::connection::{next_connection_id, BoxedIo};
use crate::upstream::connection_pool::PoolComponents;
use crate::upstream::host::CreateConnectionData;
use crate::upstream::mux::{
    DeadConnectionNotifier, Multiplexer, MultiplexerFactory, MuxConnection,
};
use async_trait::async_trait;
use bytes::Bytes;
use h2::client::{Builder, Connection, ResponseFuture, SendRequest};
use h2::SendStream;
use http::Request;
use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How a driven connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// Finished without error, including after a graceful goaway
    Closed,
    /// The peer sent a goaway carrying an error code
    GoAway,
    /// I/O or protocol failure
    Failed,
}

/// One handshaken HTTP/2 client connection
pub struct H2Connection {
    id: u64,
    max_streams: usize,
    peer_max_streams: AtomicUsize,
    open_streams: AtomicUsize,
    accepting: AtomicBool,
    send_request: Mutex<SendRequest<Bytes>>,
    shutdown: watch::Sender<Option<Shutdown>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl H2Connection {
    fn new(max_streams: usize, send_request: SendRequest<Bytes>) -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            id: next_connection_id(),
            max_streams,
            peer_max_streams: AtomicUsize::new(max_streams),
            open_streams: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            send_request: Mutex::new(send_request),
            shutdown,
            driver: Mutex::new(None),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::Acquire)
    }

    /// Configured stream limit, capped by the peer's advertised limit
    pub fn stream_ceiling(&self) -> usize {
        self.max_streams.min(self.peer_max_streams.load(Ordering::Acquire))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    fn acquire_stream(&self) {
        self.open_streams.fetch_add(1, Ordering::AcqRel);
    }

    fn release_stream(&self) {
        let _ = self
            .open_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    fn send_request(&self) -> SendRequest<Bytes> {
        lock(&self.send_request).clone()
    }

    fn set_driver(&self, driver: JoinHandle<()>) {
        *lock(&self.driver) = Some(driver);
    }

    // h2 does not wake a parked connection when its last SendRequest is
    // dropped, so a local close stops the driver outright.
    fn abort_driver(&self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }

    fn finish(&self, shutdown: Shutdown) {
        self.stop_accepting();
        self.shutdown.send_replace(Some(shutdown));
    }
}

impl MuxConnection for H2Connection {
    fn id(&self) -> u64 {
        self.id
    }

    fn can_take_new_request(&self) -> bool {
        self.is_accepting() && self.open_streams() < self.stream_ceiling()
    }
}

fn spawn_driver(
    conn: Arc<H2Connection>,
    connection: Connection<BoxedIo, Bytes>,
    notifier: Weak<dyn DeadConnectionNotifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connection = Box::pin(connection);
        let result = poll_fn(|cx| {
            let polled = connection.as_mut().poll(cx);
            conn.peer_max_streams
                .store(connection.max_concurrent_send_streams(), Ordering::Release);
            polled
        })
        .await;
        conn.stop_accepting();

        let shutdown = match result {
            Ok(()) => {
                debug!("HTTP/2 connection {} finished", conn.id);
                Shutdown::Closed
            }
            Err(e) => {
                warn!("HTTP/2 connection {} failed: {}", conn.id, e);
                if let Some(notifier) = notifier.upgrade() {
                    notifier.mark_dead(conn.id);
                }
                if e.is_go_away() && e.is_remote() {
                    Shutdown::GoAway
                } else {
                    Shutdown::Failed
                }
            }
        };
        conn.finish(shutdown);
    })
}

type Handshaken = Arc<Mutex<HashMap<u64, Arc<H2Connection>>>>;

struct H2Multiplexer {
    notifier: Weak<dyn DeadConnectionNotifier>,
    settings: Http2Config,
    // connections waiting for their codec adapter
    handshaken: Handshaken,
}

#[async_trait]
impl Multiplexer for H2Multiplexer {
    async fn new_client_conn(&self, io: BoxedIo) -> Result<Arc<dyn MuxConnection>> {
        let max_streams = self.settings.max_concurrent_streams as usize;
        let mut builder = Builder::new();
        builder.enable_push(false).initial_max_send_streams(max_streams);

        let (send_request, connection) = builder
            .handshake::<BoxedIo, Bytes>(io)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let conn = Arc::new(H2Connection::new(max_streams, send_request));
        conn.set_driver(spawn_driver(Arc::clone(&conn), connection, self.notifier.clone()));
        lock(&self.handshaken).insert(conn.id, Arc::clone(&conn));
        debug!("HTTP/2 handshake done for connection {}", conn.id);

        Ok(conn)
    }
}

/// Production multiplexer and codec factory
#[derive(Clone, Default)]
pub struct H2Upstream {
    handshaken: Handshaken,
}

impl H2Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self, http2: Http2Config) -> PoolComponents {
        PoolComponents {
            multiplexer: Arc::new(self.clone()),
            codec: Arc::new(self.clone()),
            http2,
        }
    }
}

impl MultiplexerFactory for H2Upstream {
    fn build(
        &self,
        notifier: Weak<dyn DeadConnectionNotifier>,
        settings: &Http2Config,
    ) -> Arc<dyn Multiplexer> {
        Arc::new(H2Multiplexer {
            notifier,
            settings: settings.clone(),
            handshaken: Arc::clone(&self.handshaken),
        })
    }
}

impl CodecClientFactory for H2Upstream {
    fn create(
        &self,
        _context: &StreamContext,
        protocol: Protocol,
        mux_conn: Arc<dyn MuxConnection>,
        data: &CreateConnectionData,
    ) -> Result<Arc<dyn CodecClient>> {
        let conn = lock(&self.handshaken).remove(&mux_conn.id()).ok_or_else(|| {
            Error::Codec(format!("connection {} was not handshaken here", mux_conn.id()))
        })?;
        if protocol != Protocol::Http2 {
            conn.abort_driver();
            return Err(Error::Codec(format!("{} is not served by the h2 codec", protocol)));
        }

        let codec = Arc::new(H2CodecClient::new(conn, data.address.clone()));
        codec.watch_shutdown();
        Ok(codec)
    }
}

/// Codec adapter over one [`H2Connection`]
pub struct H2CodecClient {
    conn: Arc<H2Connection>,
    authority: String,
    closed: AtomicBool,
    connection_listeners: Mutex<Vec<Weak<dyn ConnectionEventListener>>>,
    client_callbacks: Mutex<Option<Weak<dyn CodecClientCallbacks>>>,
    connection_callbacks: Mutex<Option<Weak<dyn StreamConnectionEventListener>>>,
    stats: Mutex<Option<ConnectionStats>>,
}

impl H2CodecClient {
    fn new(conn: Arc<H2Connection>, authority: String) -> Self {
        Self {
            conn,
            authority,
            closed: AtomicBool::new(false),
            connection_listeners: Mutex::new(Vec::new()),
            client_callbacks: Mutex::new(None),
            connection_callbacks: Mutex::new(None),
            stats: Mutex::new(None),
        }
    }

    fn watch_shutdown(self: &Arc<Self>) {
        let mut shutdown = self.conn.shutdown.subscribe();
        let codec = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                let current = *shutdown.borrow_and_update();
                if let Some(reason) = current {
                    break reason;
                }
                if shutdown.changed().await.is_err() {
                    return;
                }
            };
            if let Some(codec) = codec.upgrade() {
                codec.on_shutdown(reason);
            }
        });
    }

    fn on_shutdown(&self, shutdown: Shutdown) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if shutdown == Shutdown::GoAway {
            let listener = lock(&self.connection_callbacks).clone();
            if let Some(listener) = listener.and_then(|l| l.upgrade()) {
                listener.on_go_away();
            }
        }
        let event = match shutdown {
            Shutdown::Failed => ConnectionEvent::OnReadErrClose,
            Shutdown::Closed | Shutdown::GoAway => ConnectionEvent::RemoteClose,
        };
        self.fire_event(event);
    }

    fn fire_event(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = lock(&self.connection_listeners).clone();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.on_event(event);
        }
    }
}

impl CodecClient for H2CodecClient {
    fn new_stream(
        &self,
        stream_id: &str,
        receiver: Arc<dyn StreamReceiver>,
    ) -> Box<dyn StreamSender> {
        self.conn.acquire_stream();
        let slot = StreamSlot {
            conn: Arc::clone(&self.conn),
            callbacks: lock(&self.client_callbacks).clone(),
        };
        Box::new(H2StreamSender {
            stream_id: stream_id.to_string(),
            authority: self.authority.clone(),
            send_request: Mutex::new(self.conn.send_request()),
            pending: Mutex::new(Some((slot, receiver))),
            body: Mutex::new(None),
            stats: lock(&self.stats).clone(),
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.stop_accepting();
        self.conn.abort_driver();
        self.fire_event(ConnectionEvent::LocalClose);
    }

    fn add_connection_callbacks(&self, listener: Weak<dyn ConnectionEventListener>) {
        lock(&self.connection_listeners).push(listener);
    }

    fn set_codec_client_callbacks(&self, listener: Weak<dyn CodecClientCallbacks>) {
        *lock(&self.client_callbacks) = Some(listener);
    }

    fn set_codec_connection_callbacks(&self, listener: Weak<dyn StreamConnectionEventListener>) {
        *lock(&self.connection_callbacks) = Some(listener);
    }

    fn set_connection_stats(&self, stats: ConnectionStats) {
        *lock(&self.stats) = Some(stats);
    }
}

/// An open stream's claim on its connection, released once on drop
struct StreamSlot {
    conn: Arc<H2Connection>,
    callbacks: Option<Weak<dyn CodecClientCallbacks>>,
}

impl StreamSlot {
    fn reset(&self, reason: StreamResetReason) {
        if let Some(callbacks) = self.callbacks.as_ref().and_then(Weak::upgrade) {
            callbacks.on_stream_reset(reason);
        }
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.conn.release_stream();
        if let Some(callbacks) = self.callbacks.as_ref().and_then(Weak::upgrade) {
            callbacks.on_stream_destroy();
        }
    }
}

struct H2StreamSender {
    stream_id: String,
    authority: String,
    send_request: Mutex<SendRequest<Bytes>>,
    // taken when headers go out; dropping the sender before that frees the slot
    pending: Mutex<Option<(StreamSlot, Arc<dyn StreamReceiver>)>>,
    body: Mutex<Option<SendStream<Bytes>>>,
    stats: Option<ConnectionStats>,
}

impl StreamSender for H2StreamSender {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn append_headers(&self, headers: HashMap<String, String>, end_stream: bool) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Codec(format!("stream {}: {}", self.stream_id, e)))?;
        let (slot, receiver) = lock(&self.pending).take().ok_or_else(|| {
            Error::Codec(format!("headers already sent on stream {}", self.stream_id))
        })?;

        let request = build_request(&self.authority, headers)?;
        let sent = lock(&self.send_request).send_request(request, end_stream);
        let (response, body) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                slot.reset(reset_reason(&e));
                return Err(e.into());
            }
        };
        if !end_stream {
            *lock(&self.body) = Some(body);
        }

        let stream_id = self.stream_id.clone();
        let stats = self.stats.clone();
        runtime.spawn(async move {
            if let Err(e) = read_response(response, receiver.as_ref(), stats.as_ref()).await {
                debug!("HTTP/2 stream {} ended with error: {}", stream_id, e);
                slot.reset(reset_reason(&e));
            }
            drop(slot);
        });
        Ok(())
    }

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<()> {
        let mut body = lock(&self.body);
        let stream = body.as_mut().ok_or_else(|| {
            Error::Codec(format!("stream {} is not open for data", self.stream_id))
        })?;

        let len = data.len() as u64;
        stream.send_data(data, end_stream)?;
        if let Some(stats) = &self.stats {
            stats.write_total.inc(len);
        }
        if end_stream {
            body.take();
        }
        Ok(())
    }
}

/// Request from pseudo headers; missing ones default to `GET http://<authority>/`
fn build_request(authority: &str, mut headers: HashMap<String, String>) -> Result<Request<()>> {
    let method = headers.remove(":method").unwrap_or_else(|| "GET".to_string());
    let scheme = headers.remove(":scheme").unwrap_or_else(|| "http".to_string());
    let authority = headers.remove(":authority").unwrap_or_else(|| authority.to_string());
    let path = headers.remove(":path").unwrap_or_else(|| "/".to_string());

    let mut request = Request::builder()
        .method(method.as_str())
        .uri(format!("{}://{}{}", scheme, authority, path));
    for (name, value) in headers {
        if name.starts_with(':') {
            return Err(Error::Codec(format!("unsupported pseudo header {}", name)));
        }
        request = request.header(name, value);
    }
    Ok(request.body(())?)
}

async fn read_response(
    response: ResponseFuture,
    receiver: &dyn StreamReceiver,
    stats: Option<&ConnectionStats>,
) -> std::result::Result<(), h2::Error> {
    let (parts, mut body) = response.await?.into_parts();

    let mut headers = HashMap::with_capacity(parts.headers.len() + 1);
    headers.insert(":status".to_string(), parts.status.as_str().to_string());
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let mut ended = body.is_end_stream();
    receiver.on_receive_headers(headers, ended);

    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        if let Some(stats) = stats {
            stats.read_total.inc(chunk.len() as u64);
        }
        ended = body.is_end_stream();
        receiver.on_receive_data(chunk, ended);
    }
    if !ended {
        receiver.on_receive_data(Bytes::new(), true);
    }
    Ok(())
}

fn reset_reason(error: &h2::Error) -> StreamResetReason {
    if error.is_go_away() {
        StreamResetReason::ConnectionTermination
    } else if error.is_io() {
        StreamResetReason::ConnectionFailed
    } else if error.reason() == Some(h2::Reason::REFUSED_STREAM) {
        StreamResetReason::Overflow
    } else if error.is_remote() {
        StreamResetReason::RemoteReset
    } else {
        StreamResetReason::LocalReset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ClusterStats;
    use crate::testkit::{wait_until, RecordingReceiver};
    use crate::upstream::connection::TcpConnection;
    use h2::server;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    const ADDR: &str = "10.0.0.1:8080";

    #[derive(Default)]
    struct DeadConnections(Mutex<Vec<u64>>);

    impl DeadConnections {
        fn contains(&self, id: u64) -> bool {
            self.0.lock().unwrap().contains(&id)
        }
    }

    impl DeadConnectionNotifier for DeadConnections {
        fn mark_dead(&self, connection_id: u64) {
            self.0.lock().unwrap().push(connection_id);
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ConnectionEvent>>,
        resets: Mutex<Vec<StreamResetReason>>,
        destroyed: AtomicUsize,
        go_aways: AtomicUsize,
    }

    impl Recorder {
        fn events(&self) -> Vec<ConnectionEvent> {
            self.events.lock().unwrap().clone()
        }

        fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    impl ConnectionEventListener for Recorder {
        fn on_event(&self, event: ConnectionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CodecClientCallbacks for Recorder {
        fn on_stream_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stream_reset(&self, reason: StreamResetReason) {
            self.resets.lock().unwrap().push(reason);
        }
    }

    impl StreamConnectionEventListener for Recorder {
        fn on_go_away(&self) {
            self.go_aways.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        notifier: Arc<DeadConnections>,
        mux_conn: Arc<dyn MuxConnection>,
        codec: Arc<dyn CodecClient>,
        recorder: Arc<Recorder>,
        stats: ConnectionStats,
    }

    async fn connect(io: DuplexStream, max_streams: u32) -> Fixture {
        let notifier = Arc::new(DeadConnections::default());
        let weak: Weak<DeadConnections> = Arc::downgrade(&notifier);
        let upstream = H2Upstream::new();
        let mux = upstream.build(weak, &Http2Config { max_concurrent_streams: max_streams });
        let mux_conn = mux.new_client_conn(Box::new(io)).await.unwrap();

        let data = CreateConnectionData {
            connection: Box::new(TcpConnection::new(ADDR, Duration::from_secs(1))),
            address: ADDR.to_string(),
        };
        let codec = upstream
            .create(&StreamContext::new(), Protocol::Http2, Arc::clone(&mux_conn), &data)
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let weak: Weak<Recorder> = Arc::downgrade(&recorder);
        codec.add_connection_callbacks(weak.clone());
        codec.set_codec_client_callbacks(weak.clone());
        codec.set_codec_connection_callbacks(weak);
        let stats = ClusterStats::new().connection_stats();
        codec.set_connection_stats(stats.clone());

        Fixture {
            notifier,
            mux_conn,
            codec,
            recorder,
            stats,
        }
    }

    /// Answer every request with 200 and a four byte body
    async fn serve(io: DuplexStream, max_streams: u32) {
        let mut builder = server::Builder::new();
        builder.max_concurrent_streams(max_streams);
        let Ok(mut conn) = builder.handshake::<_, Bytes>(io).await else {
            return;
        };
        while let Some(Ok((_request, mut respond))) = conn.accept().await {
            let response = http::Response::builder()
                .status(200)
                .header("x-upstream", "test")
                .body(())
                .unwrap();
            if let Ok(mut body) = respond.send_response(response, false) {
                let _ = body.send_data(Bytes::from_static(b"pong"), true);
            }
        }
    }

    fn get(path: &str) -> HashMap<String, String> {
        HashMap::from([
            (":method".to_string(), "GET".to_string()),
            (":path".to_string(), path.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(serve(server_io, 100));
        let fixture = connect(client_io, 1).await;

        let receiver = Arc::new(RecordingReceiver::new());
        let sender = fixture.codec.new_stream("s1", receiver.clone());
        assert_eq!(sender.stream_id(), "s1");
        // a single-stream connection is full while the stream is open
        assert!(!fixture.mux_conn.can_take_new_request());

        sender.append_headers(get("/ping"), true).unwrap();
        assert!(wait_until(|| fixture.recorder.destroyed() == 1).await);

        assert!(receiver.finished());
        let headers = receiver.headers();
        assert_eq!(headers[0].get(":status").map(String::as_str), Some("200"));
        assert_eq!(headers[0].get("x-upstream").map(String::as_str), Some("test"));
        assert_eq!(receiver.body(), b"pong".to_vec());
        assert_eq!(fixture.stats.read_total.value(), 4);
        assert!(fixture.mux_conn.can_take_new_request());

        // headers go out once per stream
        assert!(sender.append_headers(get("/again"), true).is_err());
        assert!(sender.append_data(Bytes::from_static(b"x"), true).is_err());
    }

    #[tokio::test]
    async fn test_stream_ceiling_follows_peer_settings() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(serve(server_io, 1));
        let fixture = connect(client_io, 100).await;

        let sender = fixture.codec.new_stream("s1", RecordingReceiver::shared());
        assert!(wait_until(|| !fixture.mux_conn.can_take_new_request()).await);

        // a stream dropped before its headers are sent gives its slot back
        drop(sender);
        assert_eq!(fixture.recorder.destroyed(), 1);
        assert!(fixture.mux_conn.can_take_new_request());
    }

    #[tokio::test]
    async fn test_connection_error_marks_dead() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut conn = server::handshake(server_io).await.unwrap();
            conn.abrupt_shutdown(h2::Reason::INTERNAL_ERROR);
            while let Some(Ok(_)) = conn.accept().await {}
        });
        let fixture = connect(client_io, 100).await;
        let id = fixture.mux_conn.id();

        assert!(wait_until(|| fixture.notifier.contains(id)).await);
        assert!(wait_until(|| fixture.recorder.events().iter().any(|e| e.is_close())).await);
        assert!(!fixture.mux_conn.can_take_new_request());
        assert_eq!(fixture.recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_local_close_reports_once() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(serve(server_io, 100));
        let fixture = connect(client_io, 100).await;

        fixture.codec.close();
        fixture.codec.close();

        assert_eq!(fixture.recorder.events(), vec![ConnectionEvent::LocalClose]);
        assert!(!fixture.mux_conn.can_take_new_request());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.recorder.events().len(), 1);
        assert!(!fixture.notifier.contains(fixture.mux_conn.id()));
    }

    #[tokio::test]
    async fn test_codec_requires_handshaken_connection() {
        let (client_io, server_io) = duplex(64 * 1024);
        tokio::spawn(serve(server_io, 100));
        let notifier: Arc<DeadConnections> = Arc::new(DeadConnections::default());
        let weak: Weak<DeadConnections> = Arc::downgrade(&notifier);
        let upstream = H2Upstream::new();
        let mux = upstream.build(weak, &Http2Config::default());
        let mux_conn = mux.new_client_conn(Box::new(client_io)).await.unwrap();

        let data = CreateConnectionData {
            connection: Box::new(TcpConnection::new(ADDR, Duration::from_secs(1))),
            address: ADDR.to_string(),
        };
        let ctx = StreamContext::new();
        let refused = upstream.create(&ctx, Protocol::Http1, Arc::clone(&mux_conn), &data);
        assert!(matches!(refused, Err(Error::Codec(_))));
        // the connection is consumed by the first attempt
        let again = upstream.create(&ctx, Protocol::Http2, mux_conn, &data);
        assert!(matches!(again, Err(Error::Codec(_))));
    }

    #[test]
    fn test_build_request_from_pseudo_headers() {
        let mut headers = get("/items?page=2");
        headers.insert(":method".to_string(), "POST".to_string());
        headers.insert("x-trace".to_string(), "abc".to_string());

        let request = build_request(ADDR, headers).unwrap();
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().to_string(), "http://10.0.0.1:8080/items?page=2");
        assert_eq!(request.headers()["x-trace"], "abc");

        let defaults = build_request(ADDR, HashMap::new()).unwrap();
        assert_eq!(defaults.method(), http::Method::GET);
        assert_eq!(defaults.uri().path(), "/");

        let bogus = HashMap::from([(":protocol".to_string(), "ws".to_string())]);
        assert!(matches!(build_request(ADDR, bogus), Err(Error::Codec(_))));
    }

    #[test]
    fn test_reset_reason_from_h2_errors() {
        let io = h2::Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(reset_reason(&io), StreamResetReason::ConnectionFailed);

        let refused = h2::Error::from(h2::Reason::REFUSED_STREAM);
        assert_eq!(reset_reason(&refused), StreamResetReason::Overflow);

        let cancel = h2::Error::from(h2::Reason::CANCEL);
        assert_eq!(reset_reason(&cancel), StreamResetReason::LocalReset);
    }
}
