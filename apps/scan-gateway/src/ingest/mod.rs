//! Receives the chunked outer archive and expands it into a scan workspace.
//!
//! The payload is first staged to a temp file next to the workspace so that a
//! corrupt archive is only reported once the client has sent every byte it
//! declared. Extraction then runs in two steps: the outer archive is
//! unpacked, after which every top-level `*.tar` file is unpacked into a
//! directory named after it (suffix stripped) and deleted. At both levels
//! duplicate entries and dangling links are logged and skipped; a stream that
//! cannot be read as an archive aborts.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Instant,
};

use scan_gateway_proto::{CloseReason, TransferMetadata};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
    metrics,
    transport::{Connection, Inbound, TransportError},
};

mod extract;

use extract::UnpackError;

pub const INNER_ARCHIVE_SUFFIX: &str = ".tar";
pub const STAGING_PREFIX: &str = ".payload-";

/// A classified problem with one archive entry or with the stream itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractFault {
    #[error("duplicate entry `{0}`")]
    DuplicateEntry(String),
    #[error("link `{path}` points at `{target}`, which is not in the archive")]
    MissingLinkTarget { path: String, target: String },
    #[error("malformed archive stream: {0}")]
    MalformedStream(String),
    #[error("entry name is not valid UTF-8: {0}")]
    UndecodableBytes(String),
}

impl ExtractFault {
    /// Faults an inner layer may skip over without aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExtractFault::DuplicateEntry(_) | ExtractFault::MissingLinkTarget { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("outer archive: {0}")]
    Outer(ExtractFault),
    #[error("layer `{layer}`: {fault}")]
    Layer { layer: String, fault: ExtractFault },
    #[error("workspace i/o error: {0}")]
    Io(#[from] io::Error),
}

impl IngestError {
    fn outer(err: UnpackError) -> Self {
        match err {
            UnpackError::Fault(fault) => IngestError::Outer(fault),
            UnpackError::Io(err) => IngestError::Io(err),
        }
    }

    fn layer(layer: &str, err: UnpackError) -> Self {
        match err {
            UnpackError::Fault(fault) => IngestError::Layer {
                layer: layer.to_string(),
                fault,
            },
            UnpackError::Io(err) => IngestError::Io(err),
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            IngestError::Outer(_) | IngestError::Layer { .. } => CloseReason::BinaryCorrupted,
            IngestError::Io(_) => CloseReason::InternalError,
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("binary message of {len} bytes exceeds declared chunk size {limit}")]
    ChunkTooLarge { len: u64, limit: u64 },
    #[error("client sent {received} bytes but declared {expected}")]
    Overrun { received: u64, expected: u64 },
    #[error("text message received after {received} payload bytes")]
    UnexpectedText { received: u64 },
    #[error("failed to stage payload: {0}")]
    Io(#[from] io::Error),
}

impl StageError {
    /// `None` when the peer is gone and there is nobody to tell.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            StageError::Transport(_) => None,
            StageError::ChunkTooLarge { .. }
            | StageError::Overrun { .. }
            | StageError::UnexpectedText { .. } => Some(CloseReason::ContractViolation),
            StageError::Io(_) => Some(CloseReason::InternalError),
        }
    }
}

/// Either half of [`ArchiveIngestor::ingest`] failing.
#[derive(Debug, Error)]
pub enum IngestFailure {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Extract(#[from] IngestError),
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestFailure {
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            IngestFailure::Stage(err) => err.close_reason(),
            IngestFailure::Extract(err) => Some(err.close_reason()),
            IngestFailure::Join(_) => Some(CloseReason::InternalError),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagePolicy {
    /// Abort when a binary message is larger than the declared `chunkSize`.
    /// Off by default: existing clients only treat the value as a hint.
    pub enforce_chunk_size: bool,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Entries written by the outer archive (layer archives included).
    pub entries: usize,
    /// Outer entries left out.
    pub skipped: Vec<ExtractFault>,
    pub layers: Vec<LayerReport>,
}

impl IngestReport {
    pub fn skipped_entries(&self) -> usize {
        self.skipped.len()
            + self
                .layers
                .iter()
                .map(|layer| layer.skipped.len())
                .sum::<usize>()
    }
}

#[derive(Debug)]
pub struct LayerReport {
    pub name: String,
    pub entries: usize,
    pub skipped: Vec<ExtractFault>,
}

/// Complete payload on disk, not yet extracted.
pub struct StagedArchive {
    file: NamedTempFile,
    len: u64,
}

impl fmt::Debug for StagedArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedArchive")
            .field("path", &self.file.path())
            .field("len", &self.len)
            .finish()
    }
}

impl StagedArchive {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unpacks the payload into `dest` and expands its layer archives.
    /// Blocking; run it on a blocking thread. The staged file is removed when
    /// this returns.
    pub fn extract(self, dest: &Path) -> Result<IngestReport, IngestError> {
        fs::create_dir_all(dest)?;
        let file = self.file.reopen()?;
        let stream = extract::open_stream(file).map_err(IngestError::outer)?;
        let outer = extract::unpack(stream, dest, "outer").map_err(IngestError::outer)?;
        debug!(
            entries = outer.entries,
            skipped = outer.skipped.len(),
            "outer archive extracted"
        );

        let layers = expand_layers(dest)?;
        let report = IngestReport {
            entries: outer.entries,
            skipped: outer.skipped,
            layers,
        };
        metrics::record_layers_extracted(report.layers.len(), report.skipped_entries());
        Ok(report)
    }
}

/// Receives payloads into a staging directory.
#[derive(Debug, Clone)]
pub struct ArchiveIngestor {
    staging_dir: PathBuf,
    policy: StagePolicy,
}

impl ArchiveIngestor {
    pub fn new(staging_dir: impl Into<PathBuf>, policy: StagePolicy) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            policy,
        }
    }

    pub fn policy(&self) -> StagePolicy {
        self.policy
    }

    /// Reads binary messages until exactly `metadata.total_length` bytes have
    /// arrived. A zero-length transfer reads nothing.
    pub async fn stage<C>(
        &self,
        conn: &mut C,
        metadata: &TransferMetadata,
    ) -> Result<StagedArchive, StageError>
    where
        C: Connection + ?Sized,
    {
        let staged = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&self.staging_dir)?;
        let mut file = tokio::fs::File::from_std(staged.as_file().try_clone()?);

        let expected = metadata.total_length;
        let limit = u64::from(metadata.chunk_size);
        let started = Instant::now();
        let mut received = 0u64;
        info!(size = %human_size(expected), "receiving payload");

        while received < expected {
            let chunk = match conn.recv().await? {
                Inbound::Binary(chunk) => chunk,
                Inbound::Text(_) => return Err(StageError::UnexpectedText { received }),
            };
            let len = chunk.len() as u64;
            if len > limit {
                if self.policy.enforce_chunk_size {
                    return Err(StageError::ChunkTooLarge { len, limit });
                }
                debug!(len, limit, "binary message larger than declared chunk size");
            }
            if received + len > expected {
                return Err(StageError::Overrun {
                    received: received + len,
                    expected,
                });
            }
            file.write_all(&chunk).await?;
            received += len;
            debug!(
                "received {}/{} ({received}/{expected})",
                human_size(received),
                human_size(expected)
            );
        }
        file.flush().await?;

        let elapsed = started.elapsed();
        info!(
            size = %human_size(received),
            elapsed_ms = elapsed.as_millis() as u64,
            "payload received"
        );
        metrics::record_payload_received(received, elapsed);
        Ok(StagedArchive {
            file: staged,
            len: received,
        })
    }

    /// Stages the payload from `conn` and extracts it into `dest`.
    pub async fn ingest<C>(
        &self,
        conn: &mut C,
        metadata: &TransferMetadata,
        dest: &Path,
    ) -> Result<IngestReport, IngestFailure>
    where
        C: Connection + ?Sized,
    {
        let staged = self.stage(conn, metadata).await?;
        let dest = dest.to_path_buf();
        let report = tokio::task::spawn_blocking(move || staged.extract(&dest)).await??;
        Ok(report)
    }
}

fn expand_layers(dest: &Path) -> Result<Vec<LayerReport>, IngestError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dest)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(INNER_ARCHIVE_SUFFIX) {
            names.push(name);
        }
    }
    names.sort();

    names
        .iter()
        .map(|name| expand_layer(dest, name))
        .collect()
}

fn expand_layer(dest: &Path, file_name: &str) -> Result<LayerReport, IngestError> {
    let archive_path = dest.join(file_name);
    let layer = file_name
        .strip_suffix(INNER_ARCHIVE_SUFFIX)
        .unwrap_or(file_name);
    let skipped_layer = |fault: ExtractFault| -> Result<LayerReport, IngestError> {
        warn!(layer = file_name, fault = %fault, "skipping layer archive");
        fs::remove_file(&archive_path)?;
        Ok(LayerReport {
            name: layer.to_string(),
            entries: 0,
            skipped: vec![fault],
        })
    };

    if layer.is_empty() {
        return skipped_layer(ExtractFault::DuplicateEntry(file_name.to_string()));
    }
    let layer_dir = dest.join(layer);
    match fs::symlink_metadata(&layer_dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return skipped_layer(ExtractFault::DuplicateEntry(layer.to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir(&layer_dir)?,
        Err(err) => return Err(err.into()),
    }

    let file = fs::File::open(&archive_path)?;
    let stream = extract::open_stream(file).map_err(|err| IngestError::layer(layer, err))?;
    let stats = extract::unpack(stream, &layer_dir, layer)
        .map_err(|err| IngestError::layer(layer, err))?;
    fs::remove_file(&archive_path)?;

    info!(
        layer,
        entries = stats.entries,
        skipped = stats.skipped.len(),
        "layer extracted"
    );
    Ok(LayerReport {
        name: layer.to_string(),
        entries: stats.entries,
        skipped: stats.skipped,
    })
}

/// Binary-prefixed size with one decimal, e.g. `1.5KiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value.abs() < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}YiB")
}
