//! Administrative tools: resetting errored jobs, recovering orphans and
//! moving jobs between run directories.
//!
//! Job directories are always deleted in the same order: every regular file
//! and subdirectory first, the claim marker last. A directory that is
//! half-deleted therefore still carries its marker and is never picked up by
//! a runner.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::JobArchive;
use crate::bid::{BID_MARKER, BidClaim, Bidder, FileBidder, marker_path, process_alive, read_claim};
use crate::calculation::{CALC_LOG, DEFAULT_RESULTS_FILE, detect_calc_style};
use crate::error::{SchedError, SchedResult};
use crate::persistence::JobStore;
use crate::record::{CalculationRecord, RecordFilter, RecordStatus};
use crate::scanner::job_directories;

/// Options for [`clean_errored`] and the deletion helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanPolicy {
    /// Only reset records whose error message contains this text.
    pub error_filter: Option<String>,

    /// Attempts per path when deleting a job directory.
    pub delete_attempts: u32,

    /// Pause between deletion attempts.
    pub delete_delay: Duration,

    /// Claims made on other hosts count as orphaned after this age.
    pub orphan_min_age: Duration,

    /// Files left by a crashed attempt that are removed before an orphan is
    /// released.
    pub stale_outputs: Vec<String>,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            error_filter: None,
            delete_attempts: 10,
            delete_delay: Duration::from_millis(200),
            orphan_min_age: Duration::from_secs(24 * 3600),
            stale_outputs: vec![CALC_LOG.to_string(), DEFAULT_RESULTS_FILE.to_string()],
        }
    }
}

impl CleanPolicy {
    /// Only reset records whose error contains `filter`.
    pub fn with_error_filter(mut self, filter: impl Into<String>) -> Self {
        self.error_filter = Some(filter.into());
        self
    }

    /// Set the orphan age threshold for claims from other hosts.
    pub fn with_orphan_min_age(mut self, age: Duration) -> Self {
        self.orphan_min_age = age;
        self
    }

    fn selects(&self, error: Option<&str>) -> bool {
        match &self.error_filter {
            Some(filter) => error.is_some_and(|e| e.contains(filter.as_str())),
            None => true,
        }
    }
}

/// What [`clean_errored`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    /// Errored records returned to `not_calculated`.
    pub reset: Vec<String>,

    /// Jobs whose inputs were restored from their archive.
    pub restored: Vec<String>,

    /// Existing job directories removed before restoring.
    pub removed: Vec<String>,

    /// Errored jobs without an archive, reset in place with their inputs
    /// kept in the job directory.
    pub kept: Vec<String>,

    /// Orphaned jobs released back into the pool.
    pub orphans: Vec<String>,

    /// Jobs that could not be cleaned, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Why a claimed job directory is considered orphaned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// The owner ran on this host and its process is gone.
    DeadOwner,

    /// The owner ran on another host and the claim is older than the
    /// threshold.
    Stale,

    /// The marker cannot be parsed and is older than the threshold.
    UnreadableClaim,
}

/// A claimed job directory whose owner is no longer working on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub name: String,
    pub job_dir: PathBuf,
    pub claim: Option<BidClaim>,
    pub reason: OrphanReason,
}

/// Retry an I/O operation, treating a missing path as done.
async fn with_attempts<F, Fut>(attempts: u32, delay: Duration, mut op: F) -> std::io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!("Delete attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Delete every entry of a job directory except its claim marker.
pub async fn clear_job_directory(job_dir: &Path, attempts: u32, delay: Duration) -> SchedResult<()> {
    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == BID_MARKER {
            continue;
        }
        let path = entry.path();
        let is_dir = entry.file_type().await?.is_dir();
        with_attempts(attempts, delay, || {
            let path = path.clone();
            async move {
                if is_dir {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                }
            }
        })
        .await?;
    }
    Ok(())
}

/// Delete a job directory: contents first, marker last, then the directory.
pub async fn remove_job_directory(job_dir: &Path, attempts: u32, delay: Duration) -> SchedResult<()> {
    match clear_job_directory(job_dir, attempts, delay).await {
        Err(SchedError::IoError(e)) if e.kind() == ErrorKind::NotFound => return Ok(()),
        other => other?,
    }

    let marker = marker_path(job_dir);
    with_attempts(attempts, delay, || tokio::fs::remove_file(&marker)).await?;
    with_attempts(attempts, delay, || tokio::fs::remove_dir(job_dir)).await?;
    Ok(())
}

/// Whether a marker's owner has stopped working on the job.
async fn orphan_reason(job_dir: &Path, min_age: Duration) -> SchedResult<Option<(Option<BidClaim>, OrphanReason)>> {
    let claim = read_claim(job_dir).await;
    let min_age = chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::MAX);

    let reason = match &claim {
        Some(claim) if claim.is_local() => {
            (!process_alive(claim.pid)).then_some(OrphanReason::DeadOwner)
        }
        Some(claim) => (claim.age() > min_age).then_some(OrphanReason::Stale),
        None => {
            let modified = match tokio::fs::metadata(marker_path(job_dir)).await {
                Ok(meta) => meta.modified()?,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let age = modified.elapsed().unwrap_or_default();
            let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
            (age > min_age).then_some(OrphanReason::UnreadableClaim)
        }
    };

    Ok(reason.map(|r| (claim, r)))
}

/// Claimed job directories whose owner is no longer working on them.
pub async fn find_orphans(run_dir: &Path, min_age: Duration) -> SchedResult<Vec<OrphanReport>> {
    let mut orphans = Vec::new();

    for job_dir in job_directories(run_dir).await? {
        if !tokio::fs::try_exists(marker_path(&job_dir)).await? {
            continue;
        }
        if let Some((claim, reason)) = orphan_reason(&job_dir, min_age).await? {
            let name = dir_name(&job_dir);
            warn!("Orphaned job {} ({:?})", name, reason);
            orphans.push(OrphanReport {
                name,
                job_dir,
                claim,
                reason,
            });
        }
    }

    orphans.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(orphans)
}

/// Owner written into claims taken by the cleanup tools.
const CLEANER_OWNER: &str = "atomrun-clean";

/// How the cleanup tools hold a job directory while working on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// The existing marker belongs to an owner that stopped working on it.
    Orphaned,
    /// The directory was unclaimed and is now claimed by the cleaner.
    Claimed,
    /// A live runner owns the directory.
    Busy,
}

/// Take over a job directory, claiming it if nobody holds it.
async fn hold_job_directory(job_dir: &Path, min_age: Duration) -> SchedResult<Hold> {
    if tokio::fs::try_exists(marker_path(job_dir)).await? {
        return Ok(match orphan_reason(job_dir, min_age).await? {
            Some(_) => Hold::Orphaned,
            None => Hold::Busy,
        });
    }
    if FileBidder::new().try_claim(job_dir, CLEANER_OWNER).await? {
        Ok(Hold::Claimed)
    } else {
        Ok(Hold::Busy)
    }
}

/// Whether an orphan should be released while cleaning `record_style`.
/// Jobs of other calculation styles are left for the pass over their own
/// records.
async fn belongs_to_style(job_dir: &Path, record_style: &str) -> bool {
    match detect_calc_style(job_dir).await {
        Ok(Some(calc_style)) => {
            record_style == calc_style || record_style.ends_with(&format!("_{calc_style}"))
        }
        _ => true,
    }
}

/// Reset errored records and release orphaned jobs so they run again.
///
/// A record is reset only once its job directory is runnable again: either
/// restored from the archive, or kept in place with its inputs when no
/// archive exists. Records with neither are reported as failed and stay in
/// `error`. `message` is logged with every reset as the administrator's note.
pub async fn clean_errored(
    store: &dyn JobStore,
    run_dir: &Path,
    record_style: &str,
    message: &str,
    policy: &CleanPolicy,
) -> SchedResult<CleanReport> {
    let mut report = CleanReport::default();

    let errored = store
        .get_records(record_style, &RecordFilter::status(RecordStatus::Error))
        .await?;

    for record in errored {
        if !policy.selects(record.error.as_deref()) {
            continue;
        }
        let name = record.name.clone();
        match clean_record(store, run_dir, record_style, record, message, policy, &mut report).await
        {
            Ok(()) => {}
            Err(e) if e.is_transient() || matches!(e, SchedError::StoreUnavailable { .. }) => {
                return Err(e);
            }
            Err(e) => {
                warn!("Could not clean {}: {}", name, e);
                report.failed.push((name, e.to_string()));
            }
        }
    }

    for orphan in find_orphans(run_dir, policy.orphan_min_age).await? {
        if !belongs_to_style(&orphan.job_dir, record_style).await {
            debug!("Orphan {} belongs to another style", orphan.name);
            continue;
        }
        match release_orphan(store, record_style, &orphan, policy).await {
            Ok(()) => {
                info!("Released orphan {}: {}", orphan.name, message);
                report.orphans.push(orphan.name);
            }
            Err(e) if e.is_transient() || matches!(e, SchedError::StoreUnavailable { .. }) => {
                return Err(e);
            }
            Err(e) => {
                warn!("Could not release orphan {}: {}", orphan.name, e);
                report.failed.push((orphan.name, e.to_string()));
            }
        }
    }

    Ok(report)
}

async fn clean_record(
    store: &dyn JobStore,
    run_dir: &Path,
    record_style: &str,
    record: CalculationRecord,
    message: &str,
    policy: &CleanPolicy,
    report: &mut CleanReport,
) -> SchedResult<()> {
    let name = record.name.clone();
    let job_dir = run_dir.join(&name);

    let hold = if tokio::fs::try_exists(&job_dir).await? {
        match hold_job_directory(&job_dir, policy.orphan_min_age).await? {
            Hold::Busy => {
                warn!("{} is claimed by a live runner, not resetting", name);
                report.failed.push((name, "claimed by a live runner".to_string()));
                return Ok(());
            }
            hold => Some(hold),
        }
    } else {
        None
    };

    let archive = match store.get_blob(record_style, &name).await {
        Ok(Some(blob)) => JobArchive::decode(&blob).map(Some),
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    };
    let archive = match archive {
        Ok(archive) => archive,
        Err(e) => {
            if hold == Some(Hold::Claimed) {
                let _ = FileBidder::new().release_claim(&job_dir).await;
            }
            return Err(e);
        }
    };

    let previous = record.error.clone().unwrap_or_default();
    let result = match (archive, hold) {
        (Some(archive), hold) => {
            let dir_exists = hold.is_some();
            restore_record(
                store,
                run_dir,
                record_style,
                record,
                &archive,
                dir_exists,
                policy,
                report,
            )
            .await
        }
        (None, Some(_)) => reset_in_place(store, &job_dir, record, policy, report).await,
        (None, None) => {
            warn!("{} has neither an archive nor a job directory", name);
            report
                .failed
                .push((name, "no archive and no job directory to rerun".to_string()));
            return Ok(());
        }
    };

    if result.is_err() && hold == Some(Hold::Claimed) {
        let _ = FileBidder::new().release_claim(&job_dir).await;
    }
    result?;

    info!("Reset {} (was: {}): {}", name, previous, message);
    report.reset.push(name);
    Ok(())
}

/// Replace the job directory with the archived inputs.
///
/// The inputs are staged in a hidden directory and the record is reset
/// before the staged directory is renamed into place, so a runner never
/// sees a restored job whose record is still `error`.
#[allow(clippy::too_many_arguments)]
async fn restore_record(
    store: &dyn JobStore,
    run_dir: &Path,
    record_style: &str,
    mut record: CalculationRecord,
    archive: &JobArchive,
    dir_exists: bool,
    policy: &CleanPolicy,
    report: &mut CleanReport,
) -> SchedResult<()> {
    let name = record.name.clone();
    let job_dir = run_dir.join(&name);
    let previous = record.error.clone().unwrap_or_default();

    let staging = stage_inputs(archive, run_dir, &name).await?;
    let placed = async {
        if dir_exists {
            remove_job_directory(&job_dir, policy.delete_attempts, policy.delete_delay).await?;
            report.removed.push(name.clone());
        }
        record.reset()?;
        store.update_record(&record).await?;

        if let Err(e) = tokio::fs::rename(&staging, &job_dir).await {
            // The archive is kept, so a later clean can retry.
            if record.mark_error(previous.clone()).is_ok() {
                let _ = store.update_record(&record).await;
            }
            return Err(e.into());
        }
        Ok::<(), SchedError>(())
    }
    .await;

    if let Err(e) = placed {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }

    store.delete_blob(record_style, &name).await?;
    report.restored.push(name);
    Ok(())
}

/// Reset a job with no archive, keeping its inputs. Outputs of the failed
/// attempt are removed and the marker goes last.
async fn reset_in_place(
    store: &dyn JobStore,
    job_dir: &Path,
    mut record: CalculationRecord,
    policy: &CleanPolicy,
    report: &mut CleanReport,
) -> SchedResult<()> {
    remove_stale_outputs(job_dir, policy).await?;
    record.reset()?;
    store.update_record(&record).await?;

    let marker = marker_path(job_dir);
    with_attempts(policy.delete_attempts, policy.delete_delay, || {
        tokio::fs::remove_file(&marker)
    })
    .await?;

    warn!("No archive for {}, keeping its job directory", record.name);
    report.kept.push(record.name);
    Ok(())
}

async fn remove_stale_outputs(job_dir: &Path, policy: &CleanPolicy) -> SchedResult<()> {
    for stale in &policy.stale_outputs {
        let path = job_dir.join(stale);
        with_attempts(policy.delete_attempts, policy.delete_delay, || {
            tokio::fs::remove_file(&path)
        })
        .await?;
    }
    Ok(())
}

/// Write the archived inputs into a hidden staging directory of `run_dir`.
async fn stage_inputs(archive: &JobArchive, run_dir: &Path, name: &str) -> SchedResult<PathBuf> {
    let staging = run_dir.join(format!(".restore-{name}-{}", uuid::Uuid::new_v4()));
    if let Err(e) = archive.restore_inputs(&staging).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }
    Ok(staging)
}

async fn release_orphan(
    store: &dyn JobStore,
    record_style: &str,
    orphan: &OrphanReport,
    policy: &CleanPolicy,
) -> SchedResult<()> {
    if let Some(mut record) = store.get_record(record_style, &orphan.name).await? {
        if matches!(record.status, RecordStatus::Running | RecordStatus::Error) {
            record.reset()?;
            store.update_record(&record).await?;
        }
    }

    remove_stale_outputs(&orphan.job_dir, policy).await?;

    let marker = marker_path(&orphan.job_dir);
    with_attempts(policy.delete_attempts, policy.delete_delay, || {
        tokio::fs::remove_file(&marker)
    })
    .await?;
    Ok(())
}

/// What [`reposition_orphans`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositionReport {
    /// Jobs moved to the target run directory.
    pub moved: Vec<String>,

    /// Jobs left in place: live claims, or a name already taken in the target.
    pub skipped: Vec<String>,
}

/// Move the jobs of one calculation style from `source` to `target`.
///
/// Unclaimed jobs are claimed before they are moved, so a runner on the
/// source cannot start them mid-move. Orphaned claims (as classified by
/// [`find_orphans`] with `min_age`) are taken over. The claim is dropped in
/// the target so the jobs re-enter its pool. Live claims are left alone.
pub async fn reposition_orphans(
    source: &Path,
    target: &Path,
    calc_style: &str,
    min_age: Duration,
) -> SchedResult<RepositionReport> {
    tokio::fs::create_dir_all(target).await?;
    let mut report = RepositionReport::default();
    let policy = CleanPolicy::default();
    let bidder = FileBidder::new();

    for job_dir in job_directories(source).await? {
        match detect_calc_style(&job_dir).await {
            Ok(Some(style)) if style == calc_style => {}
            Ok(_) => continue,
            Err(e) => {
                debug!("Skipping {}: {}", job_dir.display(), e);
                continue;
            }
        }

        let name = dir_name(&job_dir);
        let hold = hold_job_directory(&job_dir, min_age).await?;
        if hold == Hold::Busy {
            debug!("Skipping live claim on {}", name);
            report.skipped.push(name);
            continue;
        }

        let destination = target.join(&name);
        if tokio::fs::try_exists(&destination).await? {
            warn!("{} already exists, not moving {}", destination.display(), name);
            if hold == Hold::Claimed {
                bidder.release_claim(&job_dir).await?;
            }
            report.skipped.push(name);
            continue;
        }

        if let Err(e) = move_directory(&job_dir, &destination, &policy).await {
            if hold == Hold::Claimed {
                let _ = bidder.release_claim(&job_dir).await;
            }
            return Err(e);
        }
        with_attempts(policy.delete_attempts, policy.delete_delay, || {
            tokio::fs::remove_file(marker_path(&destination))
        })
        .await?;
        info!("Moved {} to {}", name, target.display());
        report.moved.push(name);
    }

    Ok(report)
}

/// Rename a directory, copying and deleting when a rename is impossible
/// (e.g. across filesystems).
async fn move_directory(from: &Path, to: &Path, policy: &CleanPolicy) -> SchedResult<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => debug!("Rename of {} failed ({}), copying", from.display(), e),
    }

    let parent = to.parent().unwrap_or(to);
    let staging = parent.join(format!(".move-{}-{}", dir_name(to), uuid::Uuid::new_v4()));
    if let Err(e) = copy_tree(from, &staging).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }
    tokio::fs::rename(&staging, to).await?;
    remove_job_directory(from, policy.delete_attempts, policy.delete_delay).await
}

/// Recursively copy a directory tree.
async fn copy_tree(from: &Path, to: &Path) -> SchedResult<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
