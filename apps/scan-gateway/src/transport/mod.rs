use async_trait::async_trait;
use thiserror::Error;

pub mod mock;
pub mod websocket;

pub use websocket::WebSocketConnection;

/// A data message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    Disconnected,
    #[error("websocket error: {0}")]
    Socket(String),
}

/// Message-oriented connection a session runs over.
///
/// Control frames (ping/pong) never surface through `recv`; a close frame or
/// a dead socket is reported as [`TransportError::Disconnected`].
#[async_trait]
pub trait Connection: Send {
    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: &'static str) -> Result<(), TransportError>;
}
