use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};

use super::{Connection, Inbound, TransportError};

/// [`Connection`] over an upgraded axum WebSocket.
pub struct WebSocketConnection {
    socket: WebSocket,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            let frame = self
                .socket
                .recv()
                .await
                .ok_or(TransportError::Disconnected)?
                .map_err(|err| TransportError::Socket(err.to_string()))?;
            match frame {
                Message::Text(text) => return Ok(Inbound::Text(text)),
                Message::Binary(bytes) => return Ok(Inbound::Binary(bytes)),
                Message::Close(_) => return Err(TransportError::Disconnected),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Socket(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &'static str) -> Result<(), TransportError> {
        self.socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Borrowed(reason),
            })))
            .await
            .map_err(|err| TransportError::Socket(err.to_string()))
    }
}
