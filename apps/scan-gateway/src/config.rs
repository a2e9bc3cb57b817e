use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;

use crate::{
    agent_cache::{AgentCacheConfig, DEFAULT_AGENT_FILE_NAME, DEFAULT_AGENT_URL},
    ingest::StagePolicy,
    scan::DEFAULT_RUNTIME,
};

#[derive(Debug, Parser)]
#[command(
    name = "scan-gateway",
    author,
    version,
    about = "Receives layered component archives over WebSocket and scans them with the unified agent"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SCAN_GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Shortcut for the port part of the listen address.
    #[arg(long, env = "SCAN_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Tokio worker threads.
    #[arg(long, env = "SCAN_GATEWAY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Directory holding the shared agent binary.
    #[arg(long, env = "SCAN_GATEWAY_AGENT_DIR")]
    pub agent_dir: Option<PathBuf>,

    /// Parent directory for per-session workspaces. Must share a filesystem
    /// with the agent directory. Defaults to the agent directory.
    #[arg(long, env = "SCAN_GATEWAY_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(long, env = "SCAN_GATEWAY_AGENT_URL", default_value = DEFAULT_AGENT_URL)]
    pub agent_url: String,

    #[arg(long, env = "SCAN_GATEWAY_AGENT_FILE_NAME", default_value = DEFAULT_AGENT_FILE_NAME)]
    pub agent_file_name: String,

    /// Program used to launch the agent.
    #[arg(long, env = "SCAN_GATEWAY_RUNTIME", default_value = DEFAULT_RUNTIME)]
    pub runtime: String,

    /// Age after which the cached agent is refreshed in the background.
    #[arg(long, env = "SCAN_GATEWAY_AGENT_REFRESH_HOURS", default_value_t = 24)]
    pub agent_refresh_hours: u64,

    /// Kill the agent after this many seconds. Unbounded when unset.
    #[arg(long, env = "SCAN_GATEWAY_SCAN_TIMEOUT_SECS")]
    pub scan_timeout_secs: Option<u64>,

    /// Reject binary messages larger than the declared chunk size.
    #[arg(long, env = "SCAN_GATEWAY_ENFORCE_CHUNK_SIZE", default_value_t = false)]
    pub enforce_chunk_size: bool,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SCAN_GATEWAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "SCAN_GATEWAY_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub workers: usize,
    pub agent: AgentCacheConfig,
    pub scratch_dir: PathBuf,
    pub runtime: String,
    pub scan_timeout: Option<Duration>,
    pub stage_policy: StagePolicy,
    pub shutdown_grace: Duration,
    pub log_filter: String,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if let Some(port) = cli.port {
            listen_addr.set_port(port);
        }
        ensure!(cli.workers > 0, "worker count must be at least 1");
        ensure!(
            cli.agent_refresh_hours > 0,
            "agent refresh interval must be at least one hour"
        );
        ensure!(
            !cli.agent_file_name.is_empty() && !cli.agent_file_name.contains('/'),
            "agent file name must be a plain file name: {:?}",
            cli.agent_file_name
        );

        let agent_dir = cli
            .agent_dir
            .unwrap_or_else(|| std::env::temp_dir().join("scan-gateway"));
        let scratch_dir = cli.scratch_dir.unwrap_or_else(|| agent_dir.clone());

        let mut agent = AgentCacheConfig::new(cli.agent_url, agent_dir);
        agent.file_name = cli.agent_file_name;
        agent.max_age = Duration::from_secs(cli.agent_refresh_hours * 60 * 60);

        Ok(ServerConfig {
            listen_addr,
            workers: cli.workers,
            agent,
            scratch_dir,
            runtime: cli.runtime,
            scan_timeout: cli.scan_timeout_secs.map(Duration::from_secs),
            stage_policy: StagePolicy {
                enforce_chunk_size: cli.enforce_chunk_size,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            log_filter: cli.log_filter,
        })
    }
}
