//! Run directory scanning.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bid::marker_path;
use crate::error::SchedResult;

/// Order in which unclaimed job directories are offered to a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOrder {
    /// Whatever order the file system lists entries in.
    #[default]
    Listing,

    /// Lexicographic by directory name.
    Sorted,

    /// Random order, spreading concurrent runners over different candidates.
    Shuffled,
}

/// Lists candidate job directories of a run directory.
///
/// Every call re-lists the directory; nothing is cached between scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunDirectoryScanner {
    order: ScanOrder,
}

impl RunDirectoryScanner {
    /// Create a scanner with the given ordering.
    pub fn new(order: ScanOrder) -> Self {
        Self { order }
    }

    /// The configured ordering.
    pub fn order(&self) -> ScanOrder {
        self.order
    }

    /// Immediate job subdirectories without an active claim.
    pub async fn scan(&self, run_dir: &Path) -> SchedResult<Vec<PathBuf>> {
        let mut candidates = Vec::new();
        for job_dir in job_directories(run_dir).await? {
            if !tokio::fs::try_exists(marker_path(&job_dir))
                .await
                .unwrap_or(false)
            {
                candidates.push(job_dir);
            }
        }

        match self.order {
            ScanOrder::Listing => {}
            ScanOrder::Sorted => candidates.sort(),
            ScanOrder::Shuffled => candidates.shuffle(&mut rand::thread_rng()),
        }

        debug!(
            "Scanned {}: {} unclaimed job directories",
            run_dir.display(),
            candidates.len()
        );
        Ok(candidates)
    }

    /// Number of remaining job directories, claimed or not.
    pub async fn count(&self, run_dir: &Path) -> SchedResult<usize> {
        Ok(job_directories(run_dir).await?.len())
    }
}

/// Immediate, non-hidden subdirectories of a run directory in listing order.
pub(crate) async fn job_directories(run_dir: &Path) -> SchedResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(run_dir).await?;
    let mut dirs = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        // Entries may disappear between listing and inspection.
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }

    Ok(dirs)
}
