//! Drives real `/component` sessions over a socket. The agent download is
//! served by a local route and the runtime is a shell script that records
//! what it was asked to scan.
#![cfg(unix)]

use std::{
    fs,
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, routing::get, Router};
use futures_util::{SinkExt, StreamExt};
use scan_gateway::{
    agent_cache::{AgentCache, AgentCacheConfig},
    ingest::{ArchiveIngestor, StagePolicy},
    scan::{ScanInvoker, GENERATED_CONFIG_FILE},
    server::{self, AppState},
    session::SessionServices,
};
use scan_gateway_proto::{CloseReason, ScanResult};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const AGENT_BYTES: &[u8] = b"fake unified agent";

struct Gateway {
    root: tempfile::TempDir,
    addr: SocketAddr,
    agent_hits: Arc<AtomicUsize>,
}

impl Gateway {
    /// `scan_body` runs in the workspace after the arguments, file tree and
    /// config have been logged.
    async fn start(scan_body: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["agent", "scratch", "logs", "bin"] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
        }

        let agent_hits = Arc::new(AtomicUsize::new(0));
        let agent_url = serve_agent(agent_hits.clone()).await;
        let runtime = write_runtime(root.path(), scan_body);

        let scratch = root.path().join("scratch");
        let services = SessionServices {
            agent_cache: AgentCache::new(AgentCacheConfig::new(agent_url, root.path().join("agent")))
                .unwrap(),
            invoker: ScanInvoker::new(runtime),
            ingestor: ArchiveIngestor::new(&scratch, StagePolicy::default()),
            scratch_root: scratch,
        };
        let state = Arc::new(AppState::new(services, None));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, state, std::future::pending()));

        Self {
            root,
            addr,
            agent_hits,
        }
    }

    async fn connect(&self) -> Client {
        let (client, _) = connect_async(format!("ws://{}/component", self.addr))
            .await
            .unwrap();
        client
    }

    fn scratch(&self) -> PathBuf {
        self.root.path().join("scratch")
    }

    fn log(&self, name: &str) -> String {
        fs::read_to_string(self.root.path().join("logs").join(name)).unwrap()
    }

    fn scratch_is_empty(&self) -> bool {
        fs::read_dir(self.scratch()).unwrap().next().is_none()
    }
}

async fn serve_agent(hits: Arc<AtomicUsize>) -> String {
    async fn agent(State(hits): State<Arc<AtomicUsize>>) -> &'static [u8] {
        hits.fetch_add(1, Ordering::SeqCst);
        AGENT_BYTES
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/wss-unified-agent.jar", get(agent))
        .with_state(hits);
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/wss-unified-agent.jar")
}

fn write_runtime(root: &Path, scan_body: &str) -> String {
    let logs = root.join("logs");
    let script = format!(
        "#!/bin/sh\n\
         if [ \"$3\" = \"-detect\" ]; then\n\
         \x20 echo '# detected' > {GENERATED_CONFIG_FILE}\n\
         \x20 exit 0\n\
         fi\n\
         printf '%s\\n' \"$@\" > '{logs}/args'\n\
         find . | sort > '{logs}/tree'\n\
         cp {GENERATED_CONFIG_FILE} '{logs}/config'\n\
         {scan_body}\n",
        logs = logs.display(),
    );
    let path = root.join("bin/fake-java");
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn image() -> Vec<u8> {
    let layer = tar_of(&[("app/manifest.json", br#"{"name":"app"}"#)]);
    tar_of(&[("manifest.json", b"[]"), ("layerA.tar", &layer)])
}

fn metadata(total: usize, chunk: usize) -> Message {
    Message::Text(serde_json::json!({ "length": total, "chunkSize": chunk }).to_string())
}

fn config() -> Message {
    Message::Text(
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
        .to_string(),
    )
}

#[derive(Debug, Default)]
struct Reply {
    texts: Vec<String>,
    close_code: Option<u16>,
}

async fn send_payload(client: &mut Client, payload: &[u8], chunk: usize) {
    for piece in payload.chunks(chunk) {
        client.send(Message::Binary(piece.to_vec())).await.unwrap();
    }
}

async fn read_reply(client: &mut Client) -> Reply {
    let mut reply = Reply::default();
    while let Some(message) = client.next().await {
        match message {
            Ok(Message::Text(text)) => reply.texts.push(text),
            Ok(Message::Close(frame)) => {
                reply.close_code = frame.map(|frame| u16::from(frame.code));
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    reply
}

async fn scan(gateway: &Gateway, payload: &[u8], chunk: usize) -> Reply {
    let mut client = gateway.connect().await;
    client.send(metadata(payload.len(), chunk)).await.unwrap();
    client.send(config()).await.unwrap();
    send_payload(&mut client, payload, chunk).await;
    read_reply(&mut client).await
}

#[test_timeout::tokio_timeout_test]
async fn scans_reconstructed_image_and_reports_result() {
    let gateway = Gateway::start("echo 'scan ok'").await;
    let reply = scan(&gateway, &image(), 512).await;

    assert_eq!(reply.close_code, Some(1000));
    assert_eq!(reply.texts.len(), 2);
    assert_eq!(reply.texts[0], "0");
    let result: ScanResult = serde_json::from_str(&reply.texts[1]).unwrap();
    assert_eq!(
        result,
        ScanResult {
            successful: true,
            message: "scan ok\n".into()
        }
    );

    let args: Vec<String> = gateway.log("args").lines().map(str::to_owned).collect();
    let dir = args
        .iter()
        .position(|arg| arg == "-d")
        .map(|index| PathBuf::from(&args[index + 1]))
        .unwrap();
    assert_eq!(dir.parent(), Some(gateway.scratch().as_path()));
    assert!(dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("scan-"));
    assert!(!args.contains(&"1.2.3".to_string()));

    let tree = gateway.log("tree");
    assert!(tree.lines().any(|line| line == "./layerA/app/manifest.json"));
    assert!(tree.lines().any(|line| line == "./manifest.json"));
    assert!(tree.lines().any(|line| line == "./wss-unified-agent.jar"));
    assert!(!tree.contains("layerA.tar"));

    let generated = gateway.log("config");
    assert!(generated.starts_with("# detected\n"));
    assert!(generated.contains("\nrequesterEmail=dev@example.com"));
    assert!(generated.ends_with("\nexcludes=**/*.md"));

    assert!(gateway.scratch_is_empty());
    assert_eq!(gateway.agent_hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read(gateway.root.path().join("agent/wss-unified-agent.jar")).unwrap(),
        AGENT_BYTES
    );
}

#[test_timeout::tokio_timeout_test]
async fn failing_agent_reports_both_streams() {
    let gateway = Gateway::start("echo 'partial'\necho 'violations found' >&2\nexit 3").await;
    let reply = scan(&gateway, &image(), 1024).await;

    assert_eq!(reply.texts[0], "3");
    let result: ScanResult = serde_json::from_str(&reply.texts[1]).unwrap();
    assert!(!result.successful);
    assert_eq!(result.message, "violations found\npartial\n");
    assert_eq!(reply.close_code, Some(1000));
}

#[test_timeout::tokio_timeout_test]
async fn oversized_chunk_declaration_is_rejected_before_payload() {
    let gateway = Gateway::start("exit 0").await;
    let mut client = gateway.connect().await;
    client.send(metadata(100, 200)).await.unwrap();
    client.send(config()).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert!(reply.texts.is_empty());
    assert_eq!(reply.close_code, Some(CloseReason::CHUNK_SIZE_TOO_BIG));
    assert!(gateway.scratch_is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn malformed_control_messages_violate_the_contract() {
    let gateway = Gateway::start("exit 0").await;

    let mut client = gateway.connect().await;
    client.send(Message::Text("{\"length\": ".into())).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(reply.close_code, Some(CloseReason::CONTRACT_VIOLATION));

    let mut client = gateway.connect().await;
    client.send(metadata(2048, 512)).await.unwrap();
    client
        .send(Message::Text(r#"{"projectName": "only-a-name"}"#.into()))
        .await
        .unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(reply.close_code, Some(CloseReason::CONTRACT_VIOLATION));
}

#[test_timeout::tokio_timeout_test]
async fn corrupt_payload_is_rejected_only_after_every_byte() {
    let gateway = Gateway::start("exit 0").await;
    let payload = vec![b'x'; 4096];
    let mut client = gateway.connect().await;
    client.send(metadata(payload.len(), 1024)).await.unwrap();
    client.send(config()).await.unwrap();

    send_payload(&mut client, &payload[..2048], 1024).await;
    let early = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(early.is_err(), "server answered before the payload was complete");

    send_payload(&mut client, &payload[2048..], 1024).await;
    let reply = read_reply(&mut client).await;
    assert!(reply.texts.is_empty());
    assert_eq!(reply.close_code, Some(CloseReason::BINARY_CORRUPTED));
    assert!(gateway.scratch_is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn dangling_symlink_in_layer_does_not_stop_the_scan() {
    let gateway = Gateway::start("echo 'scan ok'").await;

    let mut layer = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o755);
    layer.append_data(&mut header, "bin/tool", &b"elf!"[..]).unwrap();
    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_link_name("nowhere").unwrap();
    layer.append_data(&mut link, "bin/ghost", std::io::empty()).unwrap();
    let layer = layer.into_inner().unwrap();
    let payload = tar_of(&[("base.tar", &layer)]);

    let reply = scan(&gateway, &payload, 512).await;
    assert_eq!(reply.texts.first().map(String::as_str), Some("0"));

    let tree = gateway.log("tree");
    assert!(tree.lines().any(|line| line == "./base/bin/tool"));
    assert!(!tree.contains("ghost"));
}

#[test_timeout::tokio_timeout_test]
async fn dangling_symlink_in_outer_archive_does_not_stop_the_scan() {
    let gateway = Gateway::start("echo 'scan ok'").await;

    let layer = tar_of(&[("app/manifest.json", br#"{"name":"app"}"#)]);
    let mut outer = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(layer.len() as u64);
    header.set_mode(0o644);
    outer.append_data(&mut header, "layerA.tar", &layer[..]).unwrap();
    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_link_name("layerA-old.tar").unwrap();
    outer.append_data(&mut link, "latest", std::io::empty()).unwrap();
    let payload = outer.into_inner().unwrap();

    let reply = scan(&gateway, &payload, 512).await;
    assert_eq!(reply.texts.first().map(String::as_str), Some("0"));
    assert_eq!(reply.close_code, Some(1000));

    let tree = gateway.log("tree");
    assert!(tree.lines().any(|line| line == "./layerA/app/manifest.json"));
    assert!(!tree.lines().any(|line| line == "./latest"));
    assert!(gateway.scratch_is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn repeated_sessions_see_identical_workspaces() {
    let gateway = Gateway::start("exit 0").await;

    scan(&gateway, &image(), 700).await;
    let first = gateway.log("tree");
    scan(&gateway, &image(), 700).await;
    let second = gateway.log("tree");

    assert_eq!(first, second);
    assert!(gateway.scratch_is_empty());
    assert_eq!(gateway.agent_hits.load(Ordering::SeqCst), 1);
}
