//! Local copy of the scanning agent shared by every session.
//!
//! The canonical file is only ever replaced by renaming a fully written
//! sibling temp file over it, so readers see either the old or the new agent,
//! never a partial one. Sessions pin the version they scan with by hard
//! linking the canonical file into their scratch workspace; a later refresh
//! swaps the directory entry but leaves the linked inode alone.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::{io::AsyncWriteExt, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::metrics;

pub const DEFAULT_AGENT_URL: &str =
    "https://github.com/whitesource/unified-agent-distribution/releases/latest/download/wss-unified-agent.jar";
pub const DEFAULT_AGENT_FILE_NAME: &str = "wss-unified-agent.jar";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct AgentCacheConfig {
    pub url: String,
    pub dir: PathBuf,
    pub file_name: String,
    pub max_age: Duration,
}

impl AgentCacheConfig {
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dir: dir.into(),
            file_name: DEFAULT_AGENT_FILE_NAME.to_string(),
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentCacheError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("agent download from {url} failed: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("agent download from {url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("agent cache i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AgentCacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        AgentCacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// State of the canonical file as seen on disk right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    Stale { age: Duration },
    Fresh { age: Duration },
}

#[derive(Debug, Clone)]
pub struct AgentCache {
    inner: Arc<AgentCacheInner>,
}

#[derive(Debug)]
struct AgentCacheInner {
    config: AgentCacheConfig,
    canonical: PathBuf,
    client: reqwest::Client,
}

impl AgentCache {
    pub fn new(config: AgentCacheConfig) -> Result<Self, AgentCacheError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scan-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(AgentCacheError::Client)?;
        let canonical = config.dir.join(&config.file_name);
        Ok(Self {
            inner: Arc::new(AgentCacheInner {
                config,
                canonical,
                client,
            }),
        })
    }

    pub fn canonical_path(&self) -> &Path {
        &self.inner.canonical
    }

    pub fn file_name(&self) -> &str {
        &self.inner.config.file_name
    }

    pub async fn freshness(&self) -> Result<Freshness, AgentCacheError> {
        let path = self.canonical_path();
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(Freshness::Missing),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Freshness::Missing),
            Err(err) => return Err(AgentCacheError::io(path, err)),
        };
        let modified = metadata
            .modified()
            .map_err(|err| AgentCacheError::io(path, err))?;
        // A timestamp in the future counts as brand new.
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > self.inner.config.max_age {
            Ok(Freshness::Stale { age })
        } else {
            Ok(Freshness::Fresh { age })
        }
    }

    /// Makes sure a usable agent exists on disk.
    ///
    /// Downloads synchronously when nothing is cached yet. A stale copy is
    /// returned as-is while a detached task fetches the replacement.
    pub async fn ensure_fresh(&self) -> Result<(), AgentCacheError> {
        match self.freshness().await? {
            Freshness::Missing => {
                info!(
                    path = %self.canonical_path().display(),
                    "scan agent not found on disk; downloading now"
                );
                self.fetch().await.map(|_| ())
            }
            Freshness::Stale { age } => {
                info!(
                    age_hours = age.as_secs() / 3600,
                    "scan agent is stale; refreshing in background"
                );
                self.refresh_in_background();
                Ok(())
            }
            Freshness::Fresh { age } => {
                debug!(age_secs = age.as_secs(), "scan agent is up to date");
                Ok(())
            }
        }
    }

    /// Downloads the agent and atomically installs it as the canonical file.
    /// Returns the number of bytes written.
    pub async fn fetch(&self) -> Result<u64, AgentCacheError> {
        let result = self.fetch_inner().await;
        match &result {
            Ok(bytes) => {
                metrics::record_agent_refresh("ok");
                info!(bytes, "scan agent downloaded");
            }
            Err(err) => {
                metrics::record_agent_refresh("error");
                error!(error = %err, "scan agent download failed");
            }
        }
        result
    }

    async fn fetch_inner(&self) -> Result<u64, AgentCacheError> {
        let dir = &self.inner.config.dir;
        let url = &self.inner.config.url;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| AgentCacheError::io(dir, err))?;

        // Same directory as the canonical file so the final rename never
        // crosses a filesystem boundary. Dropping it on any error path
        // removes the partial download.
        let staged = tempfile::Builder::new()
            .prefix(".agent-")
            .suffix(".partial")
            .tempfile_in(dir)
            .map_err(|err| AgentCacheError::io(dir, err))?;
        let staged_path = staged.path().to_path_buf();
        let handle = staged
            .as_file()
            .try_clone()
            .map_err(|err| AgentCacheError::io(&staged_path, err))?;
        let mut file = tokio::fs::File::from_std(handle);

        let mut response = self
            .inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| AgentCacheError::Download {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentCacheError::Status {
                url: url.clone(),
                status,
            });
        }

        let mut written = 0u64;
        while let Some(chunk) =
            response
                .chunk()
                .await
                .map_err(|source| AgentCacheError::Download {
                    url: url.clone(),
                    source,
                })?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| AgentCacheError::io(&staged_path, err))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| AgentCacheError::io(&staged_path, err))?;
        file.sync_all()
            .await
            .map_err(|err| AgentCacheError::io(&staged_path, err))?;
        drop(file);

        mark_executable(&staged_path).map_err(|err| AgentCacheError::io(&staged_path, err))?;

        let canonical = self.canonical_path();
        staged
            .persist(canonical)
            .map_err(|err| AgentCacheError::io(canonical, err.error))?;
        Ok(written)
    }

    /// Fire-and-forget refresh. Failures are logged and the current agent
    /// stays in place.
    pub fn refresh_in_background(&self) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.fetch().await {
                warn!(error = %err, "background agent refresh failed; keeping current agent");
            }
        })
    }

    /// Primes the cache once at startup without holding up the listener.
    pub fn spawn_warmup(&self) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.ensure_fresh().await {
                warn!(error = %err, "initial agent download failed; sessions will retry");
            }
        })
    }

    /// Pins the current agent into `scratch_dir` via a hard link.
    pub async fn reference(&self, scratch_dir: &Path) -> Result<AgentReference, AgentCacheError> {
        self.ensure_fresh().await?;
        let link = scratch_dir.join(self.file_name());
        tokio::fs::hard_link(self.canonical_path(), &link)
            .await
            .map_err(|err| AgentCacheError::io(&link, err))?;
        debug!(link = %link.display(), "agent reference created");
        Ok(AgentReference {
            path: link,
            released: false,
        })
    }
}

/// Session-private hard link to the agent. Unlinked by [`release`] or, as a
/// fallback, on drop.
///
/// [`release`]: AgentReference::release
#[derive(Debug)]
pub struct AgentReference {
    path: PathBuf,
    released: bool,
}

impl AgentReference {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)
    }
}

impl Drop for AgentReference {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
