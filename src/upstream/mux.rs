//! Transport-level HTTP/2 multiplexer seam
//!
//! The multiplexer turns a raw byte stream into a connection that can carry
//! many concurrent streams. It may independently decide that a connection is
//! unusable (stream id exhaustion, protocol errors) and reports that through
//! the [`DeadConnectionNotifier`] it was built with.

use crate::config::Http2Config;
use crate::error::Result;
use crate::upstream::connection::BoxedIo;
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// A multiplexed client connection
pub trait MuxConnection: Send + Sync {
    /// Identity used by dead-connection notifications
    fn id(&self) -> u64;

    /// Whether one more stream can be opened: under the concurrent stream
    /// ceiling and not closing or draining after a goaway
    fn can_take_new_request(&self) -> bool;
}

/// Receives dead-connection notifications from a multiplexer
pub trait DeadConnectionNotifier: Send + Sync {
    fn mark_dead(&self, connection_id: u64);

    /// Lookup hook some multiplexers expect; pools select through `new_stream`
    fn get_client_conn(&self, _address: &str) -> Option<Arc<dyn MuxConnection>> {
        None
    }
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Run the client handshake over `io`
    async fn new_client_conn(&self, io: BoxedIo) -> Result<Arc<dyn MuxConnection>>;
}

/// Builds the multiplexer owned by one pool
pub trait MultiplexerFactory: Send + Sync {
    fn build(
        &self,
        notifier: Weak<dyn DeadConnectionNotifier>,
        settings: &Http2Config,
    ) -> Arc<dyn Multiplexer>;
}
