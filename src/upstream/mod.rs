//! Upstream HTTP/2 connection pooling

pub mod client;
pub mod codec;
pub mod connection;
pub mod connection_pool;
pub mod host;
pub mod http2;
pub mod mux;

pub use client::ActiveClient;
pub use codec::{
    CodecClient, CodecClientCallbacks, CodecClientFactory, ConnectionEventListener,
    StreamConnectionEventListener, StreamReceiver, StreamSender,
};
pub use connection::{BoxedIo, ClientConnection, Connector, TcpConnection, TcpConnector};
pub use connection_pool::{
    Cancellable, ConnPool, ConnectionPool, PoolComponents, PoolEventListener, PoolStats,
};
pub use host::{
    BoundedResource, ClusterInfo, CreateConnectionData, Host, Resource, ResourceManager,
    UpstreamHost,
};
pub use http2::{H2CodecClient, H2Connection, H2Upstream};
pub use mux::{DeadConnectionNotifier, Multiplexer, MultiplexerFactory, MuxConnection};
