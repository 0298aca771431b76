//! File-system bid protocol.
//!
//! A runner owns a job directory while the directory contains a
//! [`BID_MARKER`] file that the runner created. Creation uses exclusive-create
//! semantics, so of any number of runners racing for the same directory at
//! most one succeeds. The marker body is diagnostic only: other runners test
//! its existence and never parse it to decide a claim.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};

/// Name of the claim marker inside a job directory.
pub const BID_MARKER: &str = "runner.bid";

/// Diagnostic content of a claim marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidClaim {
    /// Owner identifier of the claiming runner.
    pub owner: String,

    /// Host the claiming runner runs on.
    pub host: String,

    /// Process id of the claiming runner.
    pub pid: u32,

    /// When the claim was made.
    pub claimed_at: DateTime<Utc>,
}

impl BidClaim {
    /// Describe a claim made by the current process.
    pub fn current(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            host: hostname(),
            pid: std::process::id(),
            claimed_at: Utc::now(),
        }
    }

    /// Whether the claim was made on this host.
    pub fn is_local(&self) -> bool {
        self.host == hostname()
    }

    /// Time elapsed since the claim was made.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.claimed_at
    }
}

/// Capability to claim, release and inspect job directories.
#[async_trait]
pub trait Bidder: Send + Sync {
    /// Attempt to claim a job directory for `owner`.
    ///
    /// Returns `Ok(true)` when the caller now owns the directory and
    /// `Ok(false)` when another runner already does or the directory has
    /// vanished since it was scanned.
    async fn try_claim(&self, job_dir: &Path, owner: &str) -> SchedResult<bool>;

    /// Remove the claim marker. Releasing an unclaimed directory is a no-op.
    async fn release_claim(&self, job_dir: &Path) -> SchedResult<()>;

    /// Whether the directory currently carries a claim marker.
    async fn is_claimed(&self, job_dir: &Path) -> bool;
}

/// Bidder backed by exclusive creation of [`BID_MARKER`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBidder;

impl FileBidder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Bidder for FileBidder {
    async fn try_claim(&self, job_dir: &Path, owner: &str) -> SchedResult<bool> {
        let path = marker_path(job_dir);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("{} already claimed", job_dir.display());
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} vanished before it could be claimed", job_dir.display());
                return Ok(false);
            }
            Err(source) => return Err(SchedError::ClaimIo { path, source }),
        };

        // The claim is held from here on; the body only aids diagnostics.
        let body = serde_json::to_vec(&BidClaim::current(owner))?;
        if let Err(e) = file.write_all(&body).await {
            warn!("Failed to describe claim in {}: {}", path.display(), e);
        } else if let Err(e) = file.flush().await {
            warn!("Failed to flush claim in {}: {}", path.display(), e);
        }

        Ok(true)
    }

    async fn release_claim(&self, job_dir: &Path) -> SchedResult<()> {
        match tokio::fs::remove_file(marker_path(job_dir)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_claimed(&self, job_dir: &Path) -> bool {
        tokio::fs::try_exists(marker_path(job_dir))
            .await
            .unwrap_or(false)
    }
}

/// Path of the claim marker for a job directory.
pub fn marker_path(job_dir: &Path) -> PathBuf {
    job_dir.join(BID_MARKER)
}

/// Read the diagnostic content of a claim marker.
///
/// Returns `None` when the directory is unclaimed or the marker cannot be
/// parsed, e.g. because its owner is still writing it.
pub async fn read_claim(job_dir: &Path) -> Option<BidClaim> {
    let bytes = tokio::fs::read(marker_path(job_dir)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Name of the current host.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
    }
}

/// Whether a process with this pid exists on the current host.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // The process exists but belongs to another user.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
