//! Transport Port
//!
//! The engine speaks to the remote service through this port: a factory
//! that dials, and a transport that splits into a write half and a lazy,
//! infinite, non-restartable read half. The production adapter is a
//! WebSocket ([`websocket`]); tests substitute channel-backed doubles.

use async_trait::async_trait;

use crate::infrastructure::config::ConnectionConfig;

pub mod websocket;

pub use websocket::{WebSocketFactory, WebSocketTransport};

/// Socket-level failures. These are consumed by the connection's reconnect
/// state machine; callers only observe them directly from a failed dial.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Dialing or upgrading the connection failed.
    #[error("transport handshake failed: {0}")]
    Handshake(String),

    /// Writing a frame failed.
    #[error("transport write failed: {0}")]
    Write(String),

    /// Reading a frame failed.
    #[error("transport read failed: {0}")]
    Read(String),

    /// The peer closed the connection.
    #[error("transport closed by peer")]
    Closed,
}

/// Write half of an established transport.
#[async_trait]
pub trait TransportSink: Send {
    /// Write one serialized message atomically.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Close the transport, best effort.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of an established transport: a lazy sequence of inbound
/// frames ending with `None` (peer closed) or an error.
#[async_trait]
pub trait TransportStream: Send {
    /// Await the next inbound frame.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// One established bidirectional transport session.
pub trait Transport: Send {
    /// Split into independently owned write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>);
}

/// Dials new transport sessions for a connection, both for the initial
/// open and for every reconnect attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establish a fresh transport session.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, TransportError>;
}
