use std::collections::VecDeque;

use async_trait::async_trait;

use super::{Connection, Inbound, TransportError};

/// Scripted in-memory connection for driving sessions without a socket.
///
/// Inbound messages are replayed in order; once the script runs dry every
/// further `recv` reports a disconnect.
#[derive(Debug, Default)]
pub struct MockConnection {
    inbound: VecDeque<Inbound>,
    outbound: Vec<Outbound>,
    recv_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(mut self, text: impl Into<String>) -> Self {
        self.inbound.push_back(Inbound::Text(text.into()));
        self
    }

    pub fn push_binary(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.inbound.push_back(Inbound::Binary(bytes.into()));
        self
    }

    /// Splits `payload` into binary messages of at most `chunk` bytes.
    pub fn push_chunked(mut self, payload: &[u8], chunk: usize) -> Self {
        for piece in payload.chunks(chunk.max(1)) {
            self.inbound.push_back(Inbound::Binary(piece.to_vec()));
        }
        self
    }

    pub fn outbound(&self) -> &[Outbound] {
        &self.outbound
    }

    pub fn recv_calls(&self) -> usize {
        self.recv_calls
    }

    pub fn close_code(&self) -> Option<u16> {
        self.outbound.iter().rev().find_map(|message| match message {
            Outbound::Close { code, .. } => Some(*code),
            Outbound::Text(_) => None,
        })
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        self.recv_calls += 1;
        self.inbound.pop_front().ok_or(TransportError::Disconnected)
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.push(Outbound::Text(text));
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &'static str) -> Result<(), TransportError> {
        self.outbound.push(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
