//! The runner loop: scan, bid, execute, report, release.
//!
//! Runners coordinate only through claim markers in the run directory, so
//! any number of them may work on the same directory from different
//! processes or hosts. Within one job the order is strict: the claim is
//! taken first and released only after the record and the archive are
//! persisted and the directory contents are deleted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::archive::{JobArchive, relative_files};
use crate::bid::{Bidder, FileBidder, hostname};
use crate::calculation::{CalcOutcome, CalculationRegistry, detect_calc_style};
use crate::cleanup::{clear_job_directory, remove_job_directory};
use crate::error::{SchedError, SchedResult};
use crate::persistence::{JobStore, save_record};
use crate::record::{CalculationRecord, RecordStatus};
use crate::runlog::{
    BID_TRIES_EXHAUSTED, NO_JOBS_LEFT, RUNNER_STOPPED, RunnerLog, SINGLE_JOB_COMPLETE,
};
use crate::scanner::{RunDirectoryScanner, ScanOrder};

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Consecutive failed claims after which the runner gives up.
    pub bidtries: u32,

    /// Prefix of the store partition; records of calculation style `s` live
    /// under `<record_style>_<s>`.
    pub record_style: String,

    /// Owner id written into claims. Derived from host, pid and worker index
    /// when unset.
    pub owner: Option<String>,

    /// Directory for the runner log file. No log file when unset.
    pub log_dir: Option<PathBuf>,

    /// Candidate ordering.
    pub scan_order: ScanOrder,

    /// Worker index when several runners share a process.
    pub worker: Option<usize>,

    /// Attempts per path when deleting job directory contents.
    pub delete_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bidtries: 10,
            record_style: "calculation".to_string(),
            owner: None,
            log_dir: None,
            scan_order: ScanOrder::default(),
            worker: None,
            delete_attempts: 10,
        }
    }
}

impl RunnerConfig {
    /// Store partition for a calculation style.
    pub fn store_style(&self, calc_style: &str) -> String {
        format!("{}_{}", self.record_style, calc_style)
    }

    /// Owner id of this runner.
    pub fn owner_id(&self) -> String {
        self.owner.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                hostname(),
                std::process::id(),
                self.worker.unwrap_or(0)
            )
        })
    }
}

/// Why a runner stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExit {
    /// The run directory has no unclaimed jobs.
    NoJobsLeft,

    /// `bidtries` consecutive claims failed.
    BidTriesExhausted,

    /// The requested job was processed.
    SingleJobDone,

    /// The requested job does not exist or is claimed by another runner.
    SingleJobUnavailable,

    /// The job store stayed unreachable through the retry budget.
    StoreUnavailable(String),
}

impl RunExit {
    /// Whether this is a normal end of work.
    pub fn is_clean(&self) -> bool {
        !matches!(self, RunExit::StoreUnavailable(_))
    }

    /// Final line written to the runner log.
    pub fn terminal_line(&self) -> String {
        match self {
            RunExit::NoJobsLeft => NO_JOBS_LEFT.to_string(),
            RunExit::BidTriesExhausted => BID_TRIES_EXHAUSTED.to_string(),
            RunExit::SingleJobDone => SINGLE_JOB_COMPLETE.to_string(),
            RunExit::SingleJobUnavailable => format!("{RUNNER_STOPPED} requested job unavailable"),
            RunExit::StoreUnavailable(reason) => format!("{RUNNER_STOPPED} {reason}"),
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.terminal_line())
    }
}

/// What a runner did before it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub owner: String,
    pub exit: RunExit,
    /// Jobs reported as finished.
    pub finished: usize,
    /// Jobs reported as errored.
    pub errored: usize,
    /// Jobs left claimed for administrative review.
    pub left_claimed: usize,
    /// Empty job directories removed.
    pub discarded: usize,
    pub claim_attempts: usize,
    pub log_path: Option<PathBuf>,
}

impl RunSummary {
    fn new(owner: String) -> Self {
        Self {
            owner,
            exit: RunExit::NoJobsLeft,
            finished: 0,
            errored: 0,
            left_claimed: 0,
            discarded: 0,
            claim_attempts: 0,
            log_path: None,
        }
    }

    /// Jobs this runner claimed and completed.
    pub fn processed(&self) -> usize {
        self.finished + self.errored
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Finished,
    Errored,
    LeftClaimed,
    Discarded,
}

/// A bid-based runner over one job store and calculation registry.
pub struct Runner {
    store: Arc<dyn JobStore>,
    registry: Arc<CalculationRegistry>,
    bidder: Arc<dyn Bidder>,
    scanner: RunDirectoryScanner,
    config: RunnerConfig,
}

impl Runner {
    /// Create a runner with the default configuration and a [`FileBidder`].
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<CalculationRegistry>) -> Self {
        let config = RunnerConfig::default();
        Self {
            store,
            registry,
            bidder: Arc::new(FileBidder::new()),
            scanner: RunDirectoryScanner::new(config.scan_order),
            config,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.scanner = RunDirectoryScanner::new(config.scan_order);
        self.config = config;
        self
    }

    pub fn with_bidder(mut self, bidder: Arc<dyn Bidder>) -> Self {
        self.bidder = bidder;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Work on `run_dir` until no job is left, bids keep failing or the
    /// store becomes unavailable. With `job_name`, process only that job.
    ///
    /// Returns an error only when the run directory itself cannot be read.
    pub async fn run(&self, run_dir: &Path, job_name: Option<&str>) -> SchedResult<RunSummary> {
        let owner = self.config.owner_id();
        let mut summary = RunSummary::new(owner.clone());

        let mut log = match &self.config.log_dir {
            Some(dir) => RunnerLog::open(dir, std::process::id(), self.config.worker).await?,
            None => RunnerLog::disabled(),
        };
        if !log.path().as_os_str().is_empty() {
            summary.log_path = Some(log.path().to_path_buf());
        }
        log.started(std::process::id()).await;
        info!("Runner {} started on {}", owner, run_dir.display());

        let result = match job_name {
            Some(name) => self.run_single(run_dir, name, &owner, &mut log, &mut summary).await,
            None => self.run_loop(run_dir, &owner, &mut log, &mut summary).await,
        };

        match result {
            Ok(exit) => {
                log.line(exit.terminal_line()).await;
                if exit.is_clean() {
                    info!("Runner {} done: {}", owner, exit);
                } else {
                    error!("Runner {} stopped: {}", owner, exit);
                }
                summary.exit = exit;
                Ok(summary)
            }
            Err(e) => {
                log.line(format!("{RUNNER_STOPPED} {e}")).await;
                error!("Runner {} failed: {}", owner, e);
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        run_dir: &Path,
        owner: &str,
        log: &mut RunnerLog,
        summary: &mut RunSummary,
    ) -> SchedResult<RunExit> {
        let bidtries = self.config.bidtries.max(1);
        let mut failed = 0u32;

        loop {
            let candidates = self.scanner.scan(run_dir).await?;
            if candidates.is_empty() {
                return Ok(RunExit::NoJobsLeft);
            }
            debug!("{} candidates in {}", candidates.len(), run_dir.display());

            for job_dir in candidates {
                summary.claim_attempts += 1;
                match self.bidder.try_claim(&job_dir, owner).await {
                    Ok(true) => {
                        failed = 0;
                        if let Some(exit) = self.process(&job_dir, log, summary).await {
                            return Ok(exit);
                        }
                        break;
                    }
                    Ok(false) => debug!("Lost bid on {}", job_dir.display()),
                    Err(e) => warn!("Skipping {}: {}", job_dir.display(), e),
                }

                failed += 1;
                if failed >= bidtries {
                    return Ok(RunExit::BidTriesExhausted);
                }
            }
        }
    }

    async fn run_single(
        &self,
        run_dir: &Path,
        name: &str,
        owner: &str,
        log: &mut RunnerLog,
        summary: &mut RunSummary,
    ) -> SchedResult<RunExit> {
        let job_dir = run_dir.join(name);
        if !tokio::fs::metadata(&job_dir)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            warn!("Job {} not found in {}", name, run_dir.display());
            return Ok(RunExit::SingleJobUnavailable);
        }

        summary.claim_attempts += 1;
        match self.bidder.try_claim(&job_dir, owner).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Job {} is claimed by another runner", name);
                return Ok(RunExit::SingleJobUnavailable);
            }
            Err(e) => {
                warn!("Could not claim {}: {}", name, e);
                return Ok(RunExit::SingleJobUnavailable);
            }
        }

        Ok(self
            .process(&job_dir, log, summary)
            .await
            .unwrap_or(RunExit::SingleJobDone))
    }

    /// Process a claimed job and update the summary. Returns an exit when
    /// the runner has to stop.
    async fn process(
        &self,
        job_dir: &Path,
        log: &mut RunnerLog,
        summary: &mut RunSummary,
    ) -> Option<RunExit> {
        match self.process_job(job_dir, log).await {
            Ok(JobResult::Finished) => summary.finished += 1,
            Ok(JobResult::Errored) => summary.errored += 1,
            Ok(JobResult::LeftClaimed) => summary.left_claimed += 1,
            Ok(JobResult::Discarded) => summary.discarded += 1,
            Err(e) => {
                summary.left_claimed += 1;
                return Some(RunExit::StoreUnavailable(e.to_string()));
            }
        }
        None
    }

    /// Execute and report one claimed job. Fails only when the store is
    /// unavailable; every other problem is logged and absorbed.
    async fn process_job(&self, job_dir: &Path, log: &mut RunnerLog) -> SchedResult<JobResult> {
        let name = job_name(job_dir);
        let started = Instant::now();
        log.line(format!("{name} claimed")).await;
        info!("Claimed {}", name);

        let inputs = match relative_files(job_dir).await {
            Ok(inputs) => inputs,
            Err(e) => return Ok(self.leave_claimed(&name, &e, log).await),
        };

        let calc_style = match detect_calc_style(job_dir).await {
            Ok(Some(style)) => style,
            Ok(None) if inputs.is_empty() => {
                info!("{} is empty, removing", name);
                if let Err(e) = self.remove_empty(job_dir).await {
                    return Ok(self.leave_claimed(&name, &e, log).await);
                }
                log.line(format!("{name} removed: empty job directory")).await;
                return Ok(JobResult::Discarded);
            }
            Ok(None) => {
                let e = SchedError::UnknownCalculation(format!("no input script in {name}"));
                return Ok(self.leave_claimed(&name, &e, log).await);
            }
            Err(e) => return Ok(self.leave_claimed(&name, &e, log).await),
        };

        let outcome = match self.registry.get(&calc_style) {
            Ok(calculation) => calculation.execute(job_dir).await,
            Err(e) => CalcOutcome::Error(e.to_string()),
        };

        let style = self.config.store_style(&calc_style);
        match self
            .report(job_dir, &name, &style, &calc_style, &outcome, &inputs)
            .await
        {
            Ok(()) => {}
            Err(e @ SchedError::StoreUnavailable { .. }) => {
                error!("Job store unavailable while reporting {}: {}", name, e);
                log.line(format!("{name} left claimed: {e}")).await;
                return Err(e);
            }
            Err(e) => return Ok(self.leave_claimed(&name, &e, log).await),
        }

        let secs = started.elapsed().as_secs_f64();
        match outcome {
            CalcOutcome::Finished(_) => {
                info!("{} finished in {:.1}s", name, secs);
                log.line(format!("{name} finished in {secs:.1}s")).await;
                Ok(JobResult::Finished)
            }
            CalcOutcome::Error(msg) => {
                error!("{} error: {}", name, msg);
                log.line(format!("{name} error: {msg}")).await;
                Ok(JobResult::Errored)
            }
        }
    }

    /// Persist the outcome, archive the directory and release it.
    async fn report(
        &self,
        job_dir: &Path,
        name: &str,
        style: &str,
        calc_style: &str,
        outcome: &CalcOutcome,
        inputs: &[String],
    ) -> SchedResult<()> {
        let mut record = match self.store.get_record(style, name).await? {
            Some(record) => record,
            None => CalculationRecord::new(name, style, calc_style),
        };
        if record.status == RecordStatus::NotCalculated {
            record.mark_running()?;
        }
        match outcome {
            CalcOutcome::Finished(results) => record.mark_finished(results.clone())?,
            CalcOutcome::Error(message) => record.mark_error(message.clone())?,
        }
        save_record(self.store.as_ref(), &record).await?;

        let archive = JobArchive::from_directory(job_dir, inputs).await?.encode()?;
        self.store.add_blob(style, name, &archive).await?;

        clear_job_directory(job_dir, self.config.delete_attempts, DELETE_DELAY).await?;
        self.bidder.release_claim(job_dir).await?;
        if let Err(e) = tokio::fs::remove_dir(job_dir).await {
            // Another runner may have claimed the empty directory already.
            debug!("Leaving {}: {}", job_dir.display(), e);
        }
        Ok(())
    }

    async fn remove_empty(&self, job_dir: &Path) -> SchedResult<()> {
        remove_job_directory(job_dir, self.config.delete_attempts, DELETE_DELAY).await
    }

    async fn leave_claimed(&self, name: &str, e: &SchedError, log: &mut RunnerLog) -> JobResult {
        error!("{} left claimed: {}", name, e);
        log.line(format!("{name} left claimed: {e}")).await;
        JobResult::LeftClaimed
    }
}

const DELETE_DELAY: Duration = Duration::from_millis(200);

fn job_name(job_dir: &Path) -> String {
    job_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
