//! Scripted [`ClientConnection`]s for pool tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::upstream::connection::{next_connection_id, BoxedIo, ClientConnection, Connector};

/// Connection whose `connect` succeeds or fails as scripted.
/// A connected instance hands out one in-memory duplex stream.
pub struct ScriptedConnection {
    id: u64,
    fail_connect: bool,
    connected: AtomicBool,
    closed: Arc<AtomicU32>,
    io: Mutex<Option<BoxedIo>>,
}

impl ScriptedConnection {
    pub fn new(fail_connect: bool) -> Self {
        Self::with_close_counter(fail_connect, Arc::new(AtomicU32::new(0)))
    }

    fn with_close_counter(fail_connect: bool, closed: Arc<AtomicU32>) -> Self {
        Self {
            id: next_connection_id(),
            fail_connect,
            connected: AtomicBool::new(false),
            closed,
            io: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ClientConnection for ScriptedConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect {
            return Err(Error::UpstreamConnection("scripted connect failure".to_string()));
        }
        let (local, _remote) = tokio::io::duplex(1024);
        *self.io.lock().unwrap() = Some(Box::new(local));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn take_raw_conn(&self) -> Option<BoxedIo> {
        self.io.lock().unwrap().take()
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Connector producing [`ScriptedConnection`]s and counting them
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    created: Arc<AtomicU32>,
    closed: Arc<AtomicU32>,
    fail: Arc<AtomicBool>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `connect` fail (or succeed again)
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connection(&self, _address: &str) -> Box<dyn ClientConnection> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedConnection::with_close_counter(
            self.fail.load(Ordering::SeqCst),
            Arc::clone(&self.closed),
        ))
    }
}
