//! WebSocket Transport Adapter
//!
//! Production [`Transport`] implementation on top of `tokio-tungstenite`.
//! Messages are JSON text frames; binary frames are tolerated when they
//! decode as UTF-8, control frames are handled transparently.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Transport, TransportError, TransportFactory, TransportSink, TransportStream};
use crate::infrastructure::config::ConnectionConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established WebSocket session.
pub struct WebSocketTransport {
    inner: WsStream,
}

impl WebSocketTransport {
    /// Dial a WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] when the TCP connect, TLS
    /// setup, or WebSocket upgrade fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        tracing::debug!(url, "Dialing WebSocket endpoint");
        let (inner, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl Transport for WebSocketTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        let (sink, stream) = self.inner.split();
        (
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketReader { stream }),
        )
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WebSocketReader {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("Dropping non-UTF-8 binary frame");
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(TransportError::Read(e.to_string()))),
            }
        }
    }
}

/// Factory dialing WebSocket sessions from a connection's configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl WebSocketFactory {
    /// Create the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>, TransportError> {
        let transport = WebSocketTransport::connect(config.websocket_url()).await?;
        Ok(Box::new(transport))
    }
}
