use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// Protocol served by a connection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http1,
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "HTTP/1.1"),
            Protocol::Http2 => write!(f, "HTTP/2"),
        }
    }
}

// Connection-level lifecycle events reported by the codec layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    LocalClose,
    RemoteClose,
    OnReadErrClose,
    OnWriteErrClose,
    ConnectTimeout,
    ConnectFailed,
}

impl ConnectionEvent {
    /// Whether the event means the underlying connection is gone
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::LocalClose
                | ConnectionEvent::RemoteClose
                | ConnectionEvent::OnReadErrClose
                | ConnectionEvent::OnWriteErrClose
        )
    }
}

// Why a stream was reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamResetReason {
    ConnectionTermination,
    ConnectionFailed,
    LocalReset,
    RemoteReset,
    Overflow,
}

impl StreamResetReason {
    /// Resets caused by the connection going away rather than by either peer
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            StreamResetReason::ConnectionTermination | StreamResetReason::ConnectionFailed
        )
    }
}

// Failure reported to a pool caller through `PoolEventListener::on_failure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolFailureReason {
    ConnectionFailure,
    Overflow,
}

impl fmt::Display for PoolFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolFailureReason::ConnectionFailure => write!(f, "connection failure"),
            PoolFailureReason::Overflow => write!(f, "overflow"),
        }
    }
}

/// Per-request context threaded from the proxy into connection creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamContext {
    pub trace_id: Option<String>,
    pub labels: HashMap<String, String>,
}

impl StreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_events() {
        assert!(ConnectionEvent::LocalClose.is_close());
        assert!(ConnectionEvent::RemoteClose.is_close());
        assert!(ConnectionEvent::OnReadErrClose.is_close());
        assert!(!ConnectionEvent::ConnectTimeout.is_close());
        assert!(!ConnectionEvent::ConnectFailed.is_close());
        assert!(!ConnectionEvent::Connected.is_close());
    }

    #[test]
    fn test_reset_reason_classification() {
        assert!(StreamResetReason::ConnectionTermination.is_connection_failure());
        assert!(StreamResetReason::ConnectionFailed.is_connection_failure());
        assert!(!StreamResetReason::LocalReset.is_connection_failure());
        assert!(!StreamResetReason::RemoteReset.is_connection_failure());
    }

    #[test]
    fn test_stream_context() {
        let ctx = StreamContext::new().with_trace_id("abc123");
        assert_eq!(ctx.trace_id.as_deref(), Some("abc123"));
        assert!(ctx.labels.is_empty());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PoolFailureReason::ConnectionFailure).unwrap();
        assert_eq!(json, "\"connection_failure\"");
        let protocol: Protocol = serde_json::from_str("\"http2\"").unwrap();
        assert_eq!(protocol, Protocol::Http2);
        assert_eq!(protocol.to_string(), "HTTP/2");
    }
}
