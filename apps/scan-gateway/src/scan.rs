//! Runs the scanning agent against an extracted workspace.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use scan_gateway_proto::{ScanConfig, ScanResult};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, warn};

use crate::metrics;

pub const DEFAULT_RUNTIME: &str = "java";
pub const GENERATED_CONFIG_FILE: &str = "wss-generated-file.config";

/// Settings forced onto every scan after the agent's own detection pass.
const POLICY_LINES: [&str; 5] = [
    "go.collectDependenciesAtRuntime=true",
    "failErrorLevel=ALL",
    "fileSystemScan=true",
    "resolveAllDependencies=true",
    "python.installVirtualEnv=true",
];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to write agent config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {runtime}: {source}")]
    Launch {
        runtime: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for agent: {0}")]
    Wait(#[source] io::Error),
    #[error("agent did not finish within {0:?}")]
    TimedOut(Duration),
}

impl ScanError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ScanError::Config { .. } => "config",
            ScanError::Launch { .. } => "launch",
            ScanError::Wait(_) => "wait",
            ScanError::TimedOut(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ScanOutcome {
    pub fn result(&self) -> ScanResult {
        ScanResult::from_output(self.exit_code, &self.stdout, &self.stderr)
    }
}

#[derive(Debug, Clone)]
pub struct ScanInvoker {
    runtime: String,
    timeout: Option<Duration>,
}

impl Default for ScanInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

impl ScanInvoker {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            timeout: None,
        }
    }

    /// Kills the agent once `timeout` elapses. Unbounded when `None`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub async fn invoke(
        &self,
        agent: &Path,
        work_dir: &Path,
        config: &ScanConfig,
    ) -> Result<ScanOutcome, ScanError> {
        let config_path = self.write_config(agent, work_dir, config).await?;
        let args = scan_args(agent, &config_path, work_dir, config);

        info!(runtime = %self.runtime, "agent start");
        let started = Instant::now();
        let child = Command::new(&self.runtime)
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScanError::Launch {
                runtime: self.runtime.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ScanError::TimedOut(limit))?,
            None => child.wait_with_output().await,
        }
        .map_err(ScanError::Wait)?;

        let elapsed = started.elapsed();
        let exit_code = exit_code(output.status);
        metrics::record_scan_duration(elapsed);
        info!(
            exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "agent finished"
        );
        Ok(ScanOutcome {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
        })
    }

    /// Lets the agent write its baseline config into `work_dir`, then
    /// appends the forced settings and the client's extra entries.
    pub async fn write_config(
        &self,
        agent: &Path,
        work_dir: &Path,
        config: &ScanConfig,
    ) -> Result<PathBuf, ScanError> {
        self.detect(agent, work_dir).await;

        let path = work_dir.join(GENERATED_CONFIG_FILE);
        let mut appended = format!("\nrequesterEmail={}", config.requester_email);
        for line in POLICY_LINES {
            appended.push('\n');
            appended.push_str(line);
        }
        for (key, value) in config.extra_entries() {
            appended.push_str(&format!("\n{key}={value}"));
        }

        let config_error = |source| ScanError::Config {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(config_error)?;
        file.write_all(appended.as_bytes())
            .await
            .map_err(config_error)?;
        file.flush().await.map_err(config_error)?;
        Ok(path)
    }

    async fn detect(&self, agent: &Path, work_dir: &Path) {
        debug!("generating agent config");
        let status = Command::new(&self.runtime)
            .arg("-jar")
            .arg(agent)
            .arg("-detect")
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, status).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(?limit, "agent config detection timed out");
                    return;
                }
            },
            None => status.await,
        };
        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(exit_code = exit_code(status), "agent config detection failed"),
            Err(err) => warn!(runtime = %self.runtime, error = %err, "agent config detection could not start"),
        }
    }
}

/// Arguments for the scan run. `projectVersion` is never passed; the agent
/// would register a separate project for every version.
pub fn scan_args(
    agent: &Path,
    config_path: &Path,
    work_dir: &Path,
    config: &ScanConfig,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-Xms256m".into(),
        "-Xmx512m".into(),
        "-jar".into(),
        agent.into(),
        "-c".into(),
        config_path.into(),
        "-d".into(),
        work_dir.into(),
    ];
    for (flag, value) in [
        ("-apiKey", &config.api_key),
        ("-userKey", &config.user_key),
        ("-wss.url", &config.wss_url),
        ("-productToken", &config.product_token),
        ("-project", &config.project_name),
    ] {
        args.push(flag.into());
        args.push(value.into());
    }
    args
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
