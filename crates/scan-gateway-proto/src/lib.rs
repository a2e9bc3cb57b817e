//! Wire messages exchanged on the scan-gateway `/component` WebSocket.
//!
//! A client opens the socket and sends, in order:
//!
//! 1. a text message holding [`TransferMetadata`] as JSON,
//! 2. a text message holding [`ScanConfig`] as JSON,
//! 3. binary messages carrying exactly `TransferMetadata::total_length` bytes
//!    of the outer archive.
//!
//! The server answers with the agent exit code (decimal text) followed by a
//! JSON [`ScanResult`], or closes the socket with one of the [`CloseReason`]
//! codes. The shapes here are a fixed contract with existing clients, so field
//! names on the wire are not derived from the Rust names.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declares the size of the upcoming outer archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Exact number of payload bytes the client will send.
    #[serde(rename = "length", alias = "totalLength")]
    pub total_length: u64,
    /// Upper bound the client promises for a single binary message.
    #[serde(rename = "chunkSize")]
    pub chunk_size: u32,
}

impl TransferMetadata {
    pub fn new(total_length: u64, chunk_size: u32) -> Self {
        Self {
            total_length,
            chunk_size,
        }
    }

    pub fn from_json(payload: &str) -> Result<Self, ControlMessageError> {
        serde_json::from_str(payload).map_err(ControlMessageError::from)
    }

    /// Rejects declarations whose chunk size exceeds the whole transfer.
    pub fn ensure_chunk_fits(&self) -> Result<(), CloseReason> {
        if u64::from(self.chunk_size) > self.total_length {
            Err(CloseReason::ChunkSizeTooBig)
        } else {
            Ok(())
        }
    }
}

/// Agent settings supplied by the client for one scan.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    pub project_name: String,
    pub api_key: String,
    pub user_key: String,
    pub wss_url: String,
    pub product_token: String,
    pub project_version: String,
    pub requester_email: String,
    /// Extra `key=value` lines appended to the generated agent config.
    #[serde(
        default,
        rename = "extraWsConfig",
        alias = "extraConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub extra_config: Option<BTreeMap<String, String>>,
}

impl ScanConfig {
    pub fn from_json(payload: &str) -> Result<Self, ControlMessageError> {
        serde_json::from_str(payload).map_err(ControlMessageError::from)
    }

    pub fn extra_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra_config
            .iter()
            .flat_map(|map| map.iter())
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

// Credentials never reach the logs.
impl fmt::Debug for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfig")
            .field("project_name", &self.project_name)
            .field("api_key", &"<redacted>")
            .field("user_key", &"<redacted>")
            .field("wss_url", &self.wss_url)
            .field("product_token", &"<redacted>")
            .field("project_version", &self.project_version)
            .field("requester_email", &self.requester_email)
            .field(
                "extra_config_keys",
                &self
                    .extra_config
                    .as_ref()
                    .map(|map| map.keys().collect::<Vec<_>>()),
            )
            .finish()
    }
}

/// Final message of a successful session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub successful: bool,
    pub message: String,
}

impl ScanResult {
    /// Builds the result from captured agent output: stdout alone when the
    /// agent exited zero, stderr followed by stdout otherwise.
    pub fn from_output(exit_code: i32, stdout: &[u8], stderr: &[u8]) -> Self {
        let successful = exit_code == 0;
        let message = if successful {
            String::from_utf8_lossy(stdout).into_owned()
        } else {
            let mut message = String::from_utf8_lossy(stderr).into_owned();
            message.push_str(&String::from_utf8_lossy(stdout));
            message
        };
        Self {
            successful,
            message,
        }
    }
}

/// Close codes the server uses to abort a session before a result exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// A control message was not valid JSON or missed a required field.
    ContractViolation,
    /// `chunkSize` was larger than `length`.
    ChunkSizeTooBig,
    /// The payload could not be read as the expected nested archive.
    BinaryCorrupted,
    /// The server failed on its own side (disk, agent launch).
    InternalError,
}

impl CloseReason {
    pub const CONTRACT_VIOLATION: u16 = 4000;
    pub const CHUNK_SIZE_TOO_BIG: u16 = 4001;
    pub const BINARY_CORRUPTED: u16 = 4002;
    /// RFC 6455 "internal error".
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn code(self) -> u16 {
        match self {
            CloseReason::ContractViolation => Self::CONTRACT_VIOLATION,
            CloseReason::ChunkSizeTooBig => Self::CHUNK_SIZE_TOO_BIG,
            CloseReason::BinaryCorrupted => Self::BINARY_CORRUPTED,
            CloseReason::InternalError => Self::INTERNAL_ERROR,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            Self::CONTRACT_VIOLATION => Some(CloseReason::ContractViolation),
            Self::CHUNK_SIZE_TOO_BIG => Some(CloseReason::ChunkSizeTooBig),
            Self::BINARY_CORRUPTED => Some(CloseReason::BinaryCorrupted),
            Self::INTERNAL_ERROR => Some(CloseReason::InternalError),
            _ => None,
        }
    }

    /// Short reason string sent in the close frame and used as a metric label.
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::ContractViolation => "contract_violation",
            CloseReason::ChunkSizeTooBig => "chunk_size_too_big",
            CloseReason::BinaryCorrupted => "binary_corrupted",
            CloseReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.code())
    }
}

/// Failure to decode a control message.
#[derive(Debug, Error)]
pub enum ControlMessageError {
    #[error("control message is not valid JSON: {0}")]
    Syntax(serde_json::Error),
    #[error("control message has missing or mistyped fields: {0}")]
    Shape(serde_json::Error),
}

impl From<serde_json::Error> for ControlMessageError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Data => ControlMessageError::Shape(err),
            _ => ControlMessageError::Syntax(err),
        }
    }
}
