use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use scan_gateway::{
    config::{Cli, ServerConfig},
    server,
    telemetry::Telemetry,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let telemetry = Telemetry::init(&config.log_filter)?;
        info!(
            listen_addr = %config.listen_addr,
            workers = config.workers,
            agent_dir = %config.agent.dir.display(),
            scratch_dir = %config.scratch_dir.display(),
            runtime = %config.runtime,
            "starting scan-gateway"
        );
        server::run(config, telemetry.metrics_handle()).await
    })
}
