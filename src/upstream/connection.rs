//! Raw transport connections to an upstream target

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream a multiplexer can run a protocol over
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a transport connection
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Physical connection to an upstream target
#[async_trait]
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> u64;

    /// Establish the transport connection
    async fn connect(&self) -> Result<()>;

    /// Hand the raw byte stream over to a multiplexer.
    /// Returns `None` if the connection is not established or was already taken.
    fn take_raw_conn(&self) -> Option<BoxedIo>;

    fn close(&self);
}

/// Creates unconnected transport connections for an address
pub trait Connector: Send + Sync {
    fn connection(&self, address: &str) -> Box<dyn ClientConnection>;
}

/// Plain TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for TcpConnector {
    fn connection(&self, address: &str) -> Box<dyn ClientConnection> {
        Box::new(TcpConnection::new(address, self.connect_timeout))
    }
}

pub struct TcpConnection {
    id: u64,
    address: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpConnection {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            id: next_connection_id(),
            address: address.into(),
            connect_timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ClientConnection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn connect(&self) -> Result<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await?
            .map_err(|e| Error::UpstreamConnection(format!("{}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;

        debug!("TCP connection {} established to {}", self.id, self.address);
        *self.slot() = Some(stream);
        Ok(())
    }

    fn take_raw_conn(&self) -> Option<BoxedIo> {
        self.slot().take().map(|stream| Box::new(stream) as BoxedIo)
    }

    fn close(&self) {
        if self.slot().take().is_some() {
            debug!("TCP connection {} to {} closed", self.id, self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_and_take() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let connector = TcpConnector::new(Duration::from_secs(2));
        let conn = connector.connection(&addr);
        assert!(conn.take_raw_conn().is_none());

        conn.connect().await.unwrap();
        let _accepted = listener.accept().await.unwrap();

        assert!(conn.take_raw_conn().is_some());
        // the stream can only be handed over once
        assert!(conn.take_raw_conn().is_none());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let conn = TcpConnection::new(addr, Duration::from_secs(2));
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::UpstreamConnection(_)));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = TcpConnection::new("127.0.0.1:1", Duration::from_secs(1));
        let b = TcpConnection::new("127.0.0.1:1", Duration::from_secs(1));
        assert_ne!(a.id(), b.id());
    }
}
