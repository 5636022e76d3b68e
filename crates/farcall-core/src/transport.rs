//! Message transport
//!
//! A bidirectional, ordered, message-oriented connection between one client
//! and one server. Each WebSocket text frame carries exactly one payload;
//! there is no request/response correlation at this layer.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use crate::config::defaults::{DEFAULT_HOST, DEFAULT_PORT};

/// Host and port a server listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// WebSocket URL for this endpoint
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Address suitable for binding a TCP listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors that can occur with transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::Closed
            }
            tungstenite::Error::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// One side of a message-oriented connection
///
/// `receive` blocks until one full message is available. Messages arrive in
/// the order the peer sent them.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    async fn receive(&mut self) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket connection carrying one payload per text frame
pub struct WsConnection<S> {
    stream: WebSocketStream<S>,
    peer: String,
}

impl<S> WsConnection<S> {
    pub fn new(stream: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl<S> MessageTransport for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        trace!("→ {}: {}", self.peer, preview(&message));
        self.stream.send(Message::Text(message)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => {
                    trace!("← {}: {}", self.peer, preview(&text));
                    return Ok(text);
                }
                Message::Binary(data) => {
                    return String::from_utf8(data).map_err(|e| {
                        TransportError::WebSocket(format!("binary frame is not UTF-8: {e}"))
                    });
                }
                Message::Close(_) => return Err(TransportError::Closed),
                // Ping/pong are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Err(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Leading part of a message for log lines, cut on a char boundary
pub(crate) fn preview(message: &str) -> &str {
    match message.char_indices().nth(200) {
        Some((end, _)) => &message[..end],
        None => message,
    }
}

/// Client-side WebSocket connection
pub type ClientConnection = WsConnection<MaybeTlsStream<TcpStream>>;

/// Connect to a server; a refused connection surfaces as `ConnectFailed`
pub async fn connect(endpoint: &Endpoint) -> Result<ClientConnection, TransportError> {
    let (stream, _response) = tokio_tungstenite::connect_async(endpoint.url())
        .await
        .map_err(|e| TransportError::ConnectFailed {
            addr: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    Ok(WsConnection::new(stream, endpoint.to_string()))
}

/// Complete the server side of the WebSocket handshake on an accepted socket
pub async fn accept(stream: TcpStream) -> Result<WsConnection<TcpStream>, TransportError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(WsConnection::new(ws, peer))
}

/// In-process transport over channels, one end per side
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create two connected in-memory transport ends
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}
