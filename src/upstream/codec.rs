//! Stream codec adapter seam
//!
//! A codec client turns one multiplexed connection into request/response
//! streams and reports connection and stream lifecycle back through three
//! narrow listener traits.

use crate::error::Result;
use crate::models::{ConnectionEvent, Protocol, StreamContext, StreamResetReason};
use crate::stats::ConnectionStats;
use crate::upstream::host::CreateConnectionData;
use crate::upstream::mux::MuxConnection;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Encoder side of a stream, handed to the caller on `on_ready`
pub trait StreamSender: Send + Sync {
    fn stream_id(&self) -> &str;
    fn append_headers(&self, headers: HashMap<String, String>, end_stream: bool) -> Result<()>;
    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<()>;
}

/// Decoder side of a stream, supplied by the caller
pub trait StreamReceiver: Send + Sync {
    fn on_receive_headers(&self, headers: HashMap<String, String>, end_stream: bool);
    fn on_receive_data(&self, data: Bytes, end_stream: bool);
}

pub trait ConnectionEventListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}

pub trait CodecClientCallbacks: Send + Sync {
    fn on_stream_destroy(&self);
    fn on_stream_reset(&self, reason: StreamResetReason);
}

pub trait StreamConnectionEventListener: Send + Sync {
    fn on_go_away(&self);
}

/// Codec adapter bound to one multiplexed connection.
/// Listeners are held weakly; the adapter must not keep its owner alive.
pub trait CodecClient: Send + Sync {
    fn new_stream(
        &self,
        stream_id: &str,
        receiver: Arc<dyn StreamReceiver>,
    ) -> Box<dyn StreamSender>;

    fn close(&self);

    fn add_connection_callbacks(&self, listener: Weak<dyn ConnectionEventListener>);

    fn set_codec_client_callbacks(&self, listener: Weak<dyn CodecClientCallbacks>);

    fn set_codec_connection_callbacks(&self, listener: Weak<dyn StreamConnectionEventListener>);

    fn set_connection_stats(&self, stats: ConnectionStats);
}

pub trait CodecClientFactory: Send + Sync {
    fn create(
        &self,
        context: &StreamContext,
        protocol: Protocol,
        mux_conn: Arc<dyn MuxConnection>,
        data: &CreateConnectionData,
    ) -> Result<Arc<dyn CodecClient>>;
}
