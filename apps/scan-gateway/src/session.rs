//! One `/component` conversation, from the first control message to the
//! final result.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use scan_gateway_proto::{CloseReason, ControlMessageError, ScanConfig, TransferMetadata};
use thiserror::Error;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::{
    agent_cache::{AgentCache, AgentCacheError},
    ingest::{ArchiveIngestor, IngestError, StageError},
    metrics,
    scan::{ScanError, ScanInvoker, GENERATED_CONFIG_FILE},
    transport::{Connection, Inbound, TransportError},
};

/// Close code for a session that ran to completion (RFC 6455 "normal").
pub const NORMAL_CLOSE: u16 = 1000;
pub const WORKSPACE_PREFIX: &str = "scan-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitMetadata,
    AwaitConfig,
    Receiving,
    Extracting,
    Scanning,
    Responding,
    Closed,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitMetadata => "await_metadata",
            SessionState::AwaitConfig => "await_config",
            SessionState::Receiving => "receiving",
            SessionState::Extracting => "extracting",
            SessionState::Scanning => "scanning",
            SessionState::Responding => "responding",
            SessionState::Closed => "closed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything a session borrows from the process.
#[derive(Debug, Clone)]
pub struct SessionServices {
    pub agent_cache: AgentCache,
    pub invoker: ScanInvoker,
    pub ingestor: ArchiveIngestor,
    /// Parent of every per-session workspace.
    pub scratch_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { exit_code: i32 },
    /// `reason` is `None` when the client disconnected and nothing was sent.
    Aborted { reason: Option<CloseReason> },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{message} message rejected: {detail}")]
    Contract {
        message: &'static str,
        detail: String,
    },
    #[error("chunk size {chunk_size} exceeds declared length {total_length}")]
    ChunkSizeTooBig { chunk_size: u32, total_length: u64 },
    #[error("archive contains `{0}`, which the gateway writes itself")]
    ReservedEntry(String),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("failed to create scratch workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("scan agent unavailable: {0}")]
    Agent(#[from] AgentCacheError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to encode scan result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    fn contract(message: &'static str, err: ControlMessageError) -> Self {
        SessionError::Contract {
            message,
            detail: err.to_string(),
        }
    }

    /// Close code to send, or `None` when the peer is already gone.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionError::Transport(_) => None,
            SessionError::Contract { .. } | SessionError::ReservedEntry(_) => {
                Some(CloseReason::ContractViolation)
            }
            SessionError::ChunkSizeTooBig { .. } => Some(CloseReason::ChunkSizeTooBig),
            SessionError::Stage(err) => err.close_reason(),
            SessionError::Ingest(err) => Some(err.close_reason()),
            SessionError::Workspace(_)
            | SessionError::Agent(_)
            | SessionError::Scan(_)
            | SessionError::Join(_)
            | SessionError::Encode(_) => Some(CloseReason::InternalError),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self.close_reason() {
            None => "disconnected",
            Some(reason) => reason.label(),
        }
    }
}

/// Drives one session over `conn` and closes it with the matching code.
pub async fn run_session<C>(
    conn: &mut C,
    services: &SessionServices,
    session_id: Uuid,
) -> SessionOutcome
where
    C: Connection + ?Sized,
{
    let span = info_span!("session", %session_id, project = field::Empty);
    let mut session = Session {
        services,
        state: SessionState::AwaitMetadata,
        span: span.clone(),
    };
    session.run(conn).instrument(span).await
}

struct Session<'a> {
    services: &'a SessionServices,
    state: SessionState,
    span: Span,
}

impl Session<'_> {
    fn advance(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
    }

    async fn run<C>(&mut self, conn: &mut C) -> SessionOutcome
    where
        C: Connection + ?Sized,
    {
        match self.drive(conn).await {
            Ok(exit_code) => {
                self.advance(SessionState::Closed);
                if let Err(err) = conn.close(NORMAL_CLOSE, "").await {
                    debug!(error = %err, "close after result failed");
                }
                metrics::record_session_completed(exit_code);
                info!(exit_code, "session complete");
                SessionOutcome::Completed { exit_code }
            }
            Err(err) => {
                let failed_in = self.state;
                self.advance(SessionState::Aborted);
                let reason = err.close_reason();
                match reason {
                    Some(reason) => {
                        warn!(state = %failed_in, error = %err, close = %reason, "session aborted");
                        if let Err(close_err) = conn.close(reason.code(), reason.label()).await {
                            debug!(error = %close_err, "close frame not delivered");
                        }
                    }
                    None => info!(state = %failed_in, error = %err, "client went away"),
                }
                metrics::record_session_aborted(err.metric_label());
                SessionOutcome::Aborted { reason }
            }
        }
    }

    async fn drive<C>(&mut self, conn: &mut C) -> Result<i32, SessionError>
    where
        C: Connection + ?Sized,
    {
        let raw = recv_control(conn, "metadata").await?;
        let metadata =
            TransferMetadata::from_json(&raw).map_err(|err| SessionError::contract("metadata", err))?;

        self.advance(SessionState::AwaitConfig);
        let raw = recv_control(conn, "config").await?;
        let config =
            ScanConfig::from_json(&raw).map_err(|err| SessionError::contract("config", err))?;
        self.span.record("project", config.project_name.as_str());
        debug!(?metadata, ?config, "control messages accepted");

        if metadata.ensure_chunk_fits().is_err() {
            return Err(SessionError::ChunkSizeTooBig {
                chunk_size: metadata.chunk_size,
                total_length: metadata.total_length,
            });
        }

        let workspace = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.services.scratch_root)
            .map_err(SessionError::Workspace)?;

        self.advance(SessionState::Receiving);
        let staged = self.services.ingestor.stage(conn, &metadata).await?;

        self.advance(SessionState::Extracting);
        let dest = workspace.path().to_path_buf();
        let report = tokio::task::spawn_blocking(move || staged.extract(&dest)).await??;
        info!(
            entries = report.entries,
            layers = report.layers.len(),
            skipped = report.skipped_entries(),
            "archive extracted"
        );
        self.ensure_unreserved(workspace.path())?;

        self.advance(SessionState::Scanning);
        let agent = self.services.agent_cache.reference(workspace.path()).await?;
        let outcome = self
            .services
            .invoker
            .invoke(agent.path(), workspace.path(), &config)
            .await;
        if let Err(err) = agent.release() {
            warn!(error = %err, "failed to unlink agent reference");
        }
        let outcome = outcome?;

        self.advance(SessionState::Responding);
        let result = serde_json::to_string(&outcome.result())?;
        conn.send_text(outcome.exit_code.to_string()).await?;
        conn.send_text(result).await?;

        if let Err(err) = workspace.close() {
            warn!(error = %err, "failed to remove scratch workspace");
        }
        Ok(outcome.exit_code)
    }

    /// The agent link and the generated config live at the workspace top level
    /// next to the extracted tree, so the archive may not ship either name.
    fn ensure_unreserved(&self, workspace: &Path) -> Result<(), SessionError> {
        let reserved = [self.services.agent_cache.file_name(), GENERATED_CONFIG_FILE];
        match reserved
            .into_iter()
            .find(|name| workspace.join(name).symlink_metadata().is_ok())
        {
            Some(name) => Err(SessionError::ReservedEntry(name.to_string())),
            None => Ok(()),
        }
    }
}

/// Control messages normally arrive as text; binary frames holding UTF-8 are
/// accepted too.
async fn recv_control<C>(conn: &mut C, message: &'static str) -> Result<String, SessionError>
where
    C: Connection + ?Sized,
{
    match conn.recv().await? {
        Inbound::Text(text) => Ok(text),
        Inbound::Binary(bytes) => String::from_utf8(bytes).map_err(|_| SessionError::Contract {
            message,
            detail: "binary frame is not UTF-8".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent_cache::{AgentCacheConfig, DEFAULT_AGENT_FILE_NAME},
        ingest::{
            fixtures::{tarball, Node},
            StagePolicy,
        },
        transport::mock::{MockConnection, Outbound},
    };
    use std::fs;

    struct Harness {
        _root: tempfile::TempDir,
        services: SessionServices,
    }

    impl Harness {
        /// Agent pre-seeded on disk so no download is attempted.
        fn new(runtime: impl FnOnce(&Path) -> String) -> Self {
            let root = tempfile::tempdir().unwrap();
            let agent_dir = root.path().join("agent");
            let scratch_root = root.path().join("scratch");
            fs::create_dir_all(&agent_dir).unwrap();
            fs::create_dir_all(&scratch_root).unwrap();

            let config = AgentCacheConfig::new("http://127.0.0.1:9/agent.jar", &agent_dir);
            fs::write(agent_dir.join(&config.file_name), b"agent-v1").unwrap();
            let services = SessionServices {
                agent_cache: AgentCache::new(config).unwrap(),
                invoker: ScanInvoker::new(runtime(root.path())),
                ingestor: ArchiveIngestor::new(&scratch_root, StagePolicy::default()),
                scratch_root,
            };
            Self {
                _root: root,
                services,
            }
        }

        fn without_runtime() -> Self {
            Self::new(|_| "/nonexistent/java".to_string())
        }

        fn scratch_entries(&self) -> usize {
            fs::read_dir(&self.services.scratch_root).unwrap().count()
        }
    }

    fn metadata(total: u64, chunk: u32) -> String {
        serde_json::json!({ "length": total, "chunkSize": chunk }).to_string()
    }

    fn config() -> String {
        serde_json::json!({
            "projectName": "gardener/etcd",
            "apiKey": "api",
            "userKey": "user",
            "wssUrl": "https://saas.example/agent",
            "productToken": "product",
            "projectVersion": "1.2.3",
            "requesterEmail": "dev@example.com",
            "extraWsConfig": { "excludes": "**/*.md" },
        })
        .to_string()
    }

    fn image() -> Vec<u8> {
        let layer = tarball(&[Node::File("app/manifest.json", b"{}")]);
        tarball(&[Node::File("layerA.tar", &layer)])
    }

    async fn run(conn: &mut MockConnection, harness: &Harness) -> SessionOutcome {
        run_session(conn, &harness.services, Uuid::new_v4()).await
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_metadata_is_a_contract_violation() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new().push_text("{not json");
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                reason: Some(CloseReason::ContractViolation)
            }
        );
        assert_eq!(conn.close_code(), Some(CloseReason::CONTRACT_VIOLATION));
        assert_eq!(conn.recv_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn config_missing_a_field_is_a_contract_violation() {
        let harness = Harness::without_runtime();
        let mut partial: serde_json::Value = serde_json::from_str(&config()).unwrap();
        partial.as_object_mut().unwrap().remove("productToken");

        let mut conn = MockConnection::new()
            .push_text(metadata(2048, 512))
            .push_text(partial.to_string());
        run(&mut conn, &harness).await;
        assert_eq!(conn.close_code(), Some(CloseReason::CONTRACT_VIOLATION));
        assert_eq!(harness.scratch_entries(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn control_messages_may_arrive_as_binary_utf8() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new()
            .push_binary(metadata(100, 200).into_bytes())
            .push_binary(config().into_bytes());
        run(&mut conn, &harness).await;
        assert_eq!(conn.close_code(), Some(CloseReason::CHUNK_SIZE_TOO_BIG));
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_chunk_declaration_closes_before_payload() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new()
            .push_text(metadata(100, 200))
            .push_text(config())
            .push_binary(vec![0u8; 100]);
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                reason: Some(CloseReason::ChunkSizeTooBig)
            }
        );
        assert_eq!(conn.recv_calls(), 2);
        assert_eq!(
            conn.outbound(),
            [Outbound::Close {
                code: CloseReason::CHUNK_SIZE_TOO_BIG,
                reason: "chunk_size_too_big".into()
            }]
        );
        assert_eq!(harness.scratch_entries(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_mid_payload_is_silent() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new()
            .push_text(metadata(4096, 1024))
            .push_text(config())
            .push_binary(vec![0u8; 1024]);
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(outcome, SessionOutcome::Aborted { reason: None });
        assert!(conn.outbound().is_empty());
        assert_eq!(harness.scratch_entries(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn text_during_payload_is_a_contract_violation() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new()
            .push_text(metadata(4096, 1024))
            .push_text(config())
            .push_binary(vec![0u8; 1024])
            .push_text("done?");
        run(&mut conn, &harness).await;
        assert_eq!(conn.close_code(), Some(CloseReason::CONTRACT_VIOLATION));
    }

    #[test_timeout::tokio_timeout_test]
    async fn corrupt_payload_closes_after_last_byte() {
        let harness = Harness::without_runtime();
        let mut conn = MockConnection::new()
            .push_text(metadata(2048, 512))
            .push_text(config())
            .push_chunked(&[b'x'; 2048], 512);
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                reason: Some(CloseReason::BinaryCorrupted)
            }
        );
        assert_eq!(conn.recv_calls(), 6);
        assert_eq!(conn.close_code(), Some(CloseReason::BINARY_CORRUPTED));
        assert_eq!(harness.scratch_entries(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_runtime_is_an_internal_error() {
        let harness = Harness::without_runtime();
        let payload = image();
        let mut conn = MockConnection::new()
            .push_text(metadata(payload.len() as u64, 512))
            .push_text(config())
            .push_chunked(&payload, 512);
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(
            outcome,
            SessionOutcome::Aborted {
                reason: Some(CloseReason::InternalError)
            }
        );
        assert_eq!(conn.close_code(), Some(CloseReason::INTERNAL_ERROR));
        assert_eq!(harness.scratch_entries(), 0);
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn completed_scan_sends_exit_code_then_result() {
        use std::os::unix::fs::PermissionsExt;

        let harness = Harness::new(|dir| {
            let script = dir.join("fake-java");
            fs::write(
                &script,
                "#!/bin/sh\n\
                 [ \"$3\" = \"-detect\" ] && exit 0\n\
                 test -f layerA/app/manifest.json || exit 9\n\
                 test -e layerA.tar && exit 8\n\
                 echo scanned\n",
            )
            .unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            script.display().to_string()
        });
        let payload = image();
        let mut conn = MockConnection::new()
            .push_text(metadata(payload.len() as u64, 512))
            .push_text(config())
            .push_chunked(&payload, 512);
        let outcome = run(&mut conn, &harness).await;

        assert_eq!(outcome, SessionOutcome::Completed { exit_code: 0 });
        assert_eq!(
            conn.outbound(),
            [
                Outbound::Text("0".into()),
                Outbound::Text(r#"{"successful":true,"message":"scanned\n"}"#.into()),
                Outbound::Close {
                    code: NORMAL_CLOSE,
                    reason: String::new()
                },
            ]
        );
        assert_eq!(harness.scratch_entries(), 0);
        assert!(harness.services.agent_cache.canonical_path().is_file());
    }

    #[test_timeout::tokio_timeout_test]
    async fn archive_shipping_gateway_files_is_a_contract_violation() {
        for reserved in [DEFAULT_AGENT_FILE_NAME, GENERATED_CONFIG_FILE] {
            let harness = Harness::without_runtime();
            let payload = tarball(&[
                Node::File("layerA.tar", &tarball(&[Node::File("a", b"a")])),
                Node::File(reserved, b"planted"),
            ]);
            let mut conn = MockConnection::new()
                .push_text(metadata(payload.len() as u64, 512))
                .push_text(config())
                .push_chunked(&payload, 512);
            let outcome = run(&mut conn, &harness).await;

            assert_eq!(
                outcome,
                SessionOutcome::Aborted {
                    reason: Some(CloseReason::ContractViolation)
                },
                "{reserved}"
            );
            assert_eq!(conn.close_code(), Some(CloseReason::CONTRACT_VIOLATION));
            assert_eq!(harness.scratch_entries(), 0);
        }
    }

    #[test_timeout::timeout]
    fn transport_errors_map_to_no_close_code() {
        let err = SessionError::from(TransportError::Disconnected);
        assert_eq!(err.close_reason(), None);
        assert_eq!(err.metric_label(), "disconnected");

        let err = SessionError::ChunkSizeTooBig {
            chunk_size: 200,
            total_length: 100,
        };
        assert_eq!(err.metric_label(), "chunk_size_too_big");
    }
}
