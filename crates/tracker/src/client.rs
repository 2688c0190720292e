//! WebSocket transport for progress channels.
//!
//! [`Transport`] opens [`Channel`]s. The session driver only ever sees
//! these traits, so tests can script channel behaviour without a
//! server. [`WsTransport`] is the real implementation over
//! `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::OutboundFrame;

/// Opens progress channels for one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError>;
}

/// One open bidirectional text channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Next text frame. `None` once the peer closed the channel.
    ///
    /// Must be cancel-safe: the driver calls it from `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the channel. Errors are logged, never returned.
    async fn close(&mut self);
}

/// Errors that can occur on a progress channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Connects to a fixed WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// * `url` - full channel URL, e.g. `ws://host:8009/afe/api/ws/lecture_evaluation`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Box<dyn Channel>, TransportError> {
        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            TransportError::Connection(format!("Failed to connect to {}: {e}", self.url))
        })?;

        tracing::debug!(url = %self.url, "Progress channel connected");
        Ok(Box::new(WsChannel { stream }))
    }
}

/// A live WebSocket progress channel.
pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame.to_text()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Progress channel closed by peer");
                    return None;
                }
                // Binary, ping, pong and raw frames carry no progress data.
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error closing progress channel");
        }
    }
}
