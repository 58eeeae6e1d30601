//! Recording [`PoolEventListener`] and stream receivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::models::PoolFailureReason;
use crate::upstream::codec::{StreamReceiver, StreamSender};
use crate::upstream::connection_pool::PoolEventListener;
use crate::upstream::host::Host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOutcome {
    Ready { stream_id: String, host: String },
    Failure { stream_id: String, reason: PoolFailureReason },
}

/// Listener that remembers every outcome in arrival order and keeps the
/// senders it was handed
#[derive(Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<PoolOutcome>>,
    senders: Mutex<HashMap<String, Box<dyn StreamSender>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<PoolOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn ready_count(&self) -> usize {
        self.outcomes()
            .iter()
            .filter(|o| matches!(o, PoolOutcome::Ready { .. }))
            .count()
    }

    pub fn take_sender(&self, stream_id: &str) -> Option<Box<dyn StreamSender>> {
        self.senders.lock().unwrap().remove(stream_id)
    }

    pub fn failures(&self) -> Vec<PoolFailureReason> {
        self.outcomes()
            .into_iter()
            .filter_map(|o| match o {
                PoolOutcome::Failure { reason, .. } => Some(reason),
                PoolOutcome::Ready { .. } => None,
            })
            .collect()
    }
}

impl PoolEventListener for RecordingListener {
    fn on_ready(&self, stream_id: &str, sender: Box<dyn StreamSender>, host: Arc<dyn Host>) {
        assert_eq!(sender.stream_id(), stream_id);
        self.outcomes.lock().unwrap().push(PoolOutcome::Ready {
            stream_id: stream_id.to_string(),
            host: host.address_string().to_string(),
        });
        self.senders.lock().unwrap().insert(stream_id.to_string(), sender);
    }

    fn on_failure(&self, stream_id: &str, reason: PoolFailureReason, _host: Option<Arc<dyn Host>>) {
        self.outcomes.lock().unwrap().push(PoolOutcome::Failure {
            stream_id: stream_id.to_string(),
            reason,
        });
    }
}

/// Receiver that discards everything
#[derive(Debug, Default)]
pub struct NullReceiver;

impl NullReceiver {
    pub fn shared() -> Arc<dyn StreamReceiver> {
        Arc::new(NullReceiver)
    }
}

impl StreamReceiver for NullReceiver {
    fn on_receive_headers(&self, _headers: HashMap<String, String>, _end_stream: bool) {}

    fn on_receive_data(&self, _data: Bytes, _end_stream: bool) {}
}

/// Receiver that keeps response headers and body
#[derive(Debug, Default)]
pub struct RecordingReceiver {
    headers: Mutex<Vec<HashMap<String, String>>>,
    body: Mutex<Vec<u8>>,
    finished: AtomicBool,
}

impl RecordingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn StreamReceiver> {
        Arc::new(Self::new())
    }

    pub fn headers(&self) -> Vec<HashMap<String, String>> {
        self.headers.lock().unwrap().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap().clone()
    }

    /// Whether the end of the response was delivered
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl StreamReceiver for RecordingReceiver {
    fn on_receive_headers(&self, headers: HashMap<String, String>, end_stream: bool) {
        self.headers.lock().unwrap().push(headers);
        if end_stream {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn on_receive_data(&self, data: Bytes, end_stream: bool) {
        self.body.lock().unwrap().extend_from_slice(&data);
        if end_stream {
            self.finished.store(true, Ordering::SeqCst);
        }
    }
}
