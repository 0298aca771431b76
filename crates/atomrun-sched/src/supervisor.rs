//! Running several runners at once, and waiting for a run directory to
//! drain.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::bid::{Bidder, FileBidder};
use crate::calculation::CalculationRegistry;
use crate::error::{SchedError, SchedResult};
use crate::persistence::JobStore;
use crate::runner::{RunSummary, Runner, RunnerConfig};
use crate::scanner::RunDirectoryScanner;

/// Bounded pool of async tasks producing values of one type.
pub struct WorkerPool<T> {
    tasks: JoinSet<T>,
    permits: Arc<Semaphore>,
}

/// Handle to a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    /// Cancel the task. A running calculation child is killed with it.
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Pool running at most `max_concurrent` tasks at a time.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Queue a task. It starts as soon as a slot is free.
    pub fn submit<F>(&mut self, task: F) -> TaskHandle
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = self.permits.clone();
        let abort = self.tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            task.await
        });
        TaskHandle { abort }
    }

    /// Number of tasks not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, in completion order.
    pub async fn join_all(mut self) -> Vec<SchedResult<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            results.push(joined.map_err(|e| SchedError::TaskFailed(e.to_string())));
        }
        results
    }
}

/// Aggregated outcome of the runners of one supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSummary {
    /// Summaries of the runners that stopped normally, ordered by worker.
    pub runs: Vec<RunSummary>,

    /// Runners that failed outright.
    pub failures: Vec<String>,
}

impl SupervisorSummary {
    pub fn finished(&self) -> usize {
        self.runs.iter().map(|r| r.finished).sum()
    }

    pub fn errored(&self) -> usize {
        self.runs.iter().map(|r| r.errored).sum()
    }

    pub fn left_claimed(&self) -> usize {
        self.runs.iter().map(|r| r.left_claimed).sum()
    }

    /// Whether every runner stopped with a clean exit.
    pub fn all_clean(&self) -> bool {
        self.failures.is_empty() && self.runs.iter().all(|r| r.exit.is_clean())
    }
}

/// Exit of one runner process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub worker: usize,
    pub pid: Option<u32>,
    /// Exit code; `None` when killed by a signal or never started.
    pub code: Option<i32>,
    /// Spawn or wait failure.
    pub error: Option<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Starts several runners against one run directory.
pub struct MultiRunnerSupervisor {
    store: Arc<dyn JobStore>,
    registry: Arc<CalculationRegistry>,
    bidder: Arc<dyn Bidder>,
    config: RunnerConfig,
}

impl MultiRunnerSupervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<CalculationRegistry>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bidder: Arc::new(FileBidder::new()),
            config,
        }
    }

    pub fn with_bidder(mut self, bidder: Arc<dyn Bidder>) -> Self {
        self.bidder = bidder;
        self
    }

    /// Run `n` runner loops in this process, each with its own owner id and
    /// log file.
    pub async fn run_tasks(&self, n: usize, run_dir: &Path) -> SchedResult<SupervisorSummary> {
        if !tokio::fs::metadata(run_dir).await?.is_dir() {
            return Err(SchedError::UnknownRunDirectory(
                run_dir.display().to_string(),
            ));
        }

        info!("Starting {} runners on {}", n, run_dir.display());
        let mut pool = WorkerPool::new(n);
        for worker in 0..n {
            let config = RunnerConfig {
                worker: Some(worker),
                owner: self.config.owner.as_ref().map(|o| format!("{o}-{worker}")),
                ..self.config.clone()
            };
            let runner = Runner::new(self.store.clone(), self.registry.clone())
                .with_config(config)
                .with_bidder(self.bidder.clone());
            let run_dir = run_dir.to_path_buf();
            pool.submit(async move { (worker, runner.run(&run_dir, None).await) });
        }

        let mut summary = SupervisorSummary::default();
        let mut runs = Vec::with_capacity(n);
        for joined in pool.join_all().await {
            match joined {
                Ok((worker, Ok(run))) => runs.push((worker, run)),
                Ok((worker, Err(e))) => {
                    warn!("Runner {} failed: {}", worker, e);
                    summary.failures.push(format!("worker {worker}: {e}"));
                }
                Err(e) => {
                    warn!("{}", e);
                    summary.failures.push(e.to_string());
                }
            }
        }
        runs.sort_by_key(|(worker, _)| *worker);
        summary.runs = runs.into_iter().map(|(_, run)| run).collect();

        info!(
            "{} runners done: {} finished, {} errored",
            n,
            summary.finished(),
            summary.errored()
        );
        Ok(summary)
    }

    /// Launch `n` copies of `program` and wait for all of them.
    pub async fn spawn_processes(
        program: impl AsRef<Path>,
        args: &[String],
        n: usize,
    ) -> Vec<ProcessExit> {
        let program: PathBuf = program.as_ref().to_path_buf();
        let mut pool = WorkerPool::new(n);

        for worker in 0..n {
            let mut command = Command::new(&program);
            command.args(args).stdin(Stdio::null());
            pool.submit(async move {
                let mut child = match command.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        return ProcessExit {
                            worker,
                            pid: None,
                            code: None,
                            error: Some(e.to_string()),
                        };
                    }
                };
                let pid = child.id();
                debug!("Runner process {} started with pid {:?}", worker, pid);
                match child.wait().await {
                    Ok(status) => ProcessExit {
                        worker,
                        pid,
                        code: status.code(),
                        error: None,
                    },
                    Err(e) => ProcessExit {
                        worker,
                        pid,
                        code: None,
                        error: Some(e.to_string()),
                    },
                }
            });
        }

        let mut exits: Vec<ProcessExit> = pool
            .join_all()
            .await
            .into_iter()
            .enumerate()
            .map(|(i, joined)| {
                joined.unwrap_or_else(|e| ProcessExit {
                    worker: i,
                    pid: None,
                    code: None,
                    error: Some(e.to_string()),
                })
            })
            .collect();
        exits.sort_by_key(|e| e.worker);

        for exit in exits.iter().filter(|e| !e.success()) {
            warn!("Runner process {} exited with {:?}", exit.worker, exit);
        }
        exits
    }
}

/// Poll a run directory until it holds no job directories. Sleeps
/// `initial` first, then `initial + delta`, growing by `delta` each round.
///
/// Returns the total time slept.
pub async fn sleep_until_done(
    scanner: &RunDirectoryScanner,
    run_dir: &Path,
    initial: Duration,
    delta: Duration,
) -> SchedResult<Duration> {
    let mut wait = initial;
    let mut slept = Duration::ZERO;

    loop {
        let remaining = scanner.count(run_dir).await?;
        if remaining == 0 {
            info!("{} is empty after {:?}", run_dir.display(), slept);
            return Ok(slept);
        }
        info!("{} jobs remaining, sleeping {:?}", remaining, wait);
        tokio::time::sleep(wait).await;
        slept += wait;
        wait += delta;
    }
}

/// Parse `90`, `30s`, `5m` or `2h` into a duration. Bare numbers are
/// seconds.
pub fn parse_duration(text: &str) -> SchedResult<Duration> {
    let text = text.trim();
    let invalid = || SchedError::InvalidDuration(text.to_string());

    let (digits, scale) = match text.char_indices().last() {
        Some((i, 's')) => (&text[..i], 1),
        Some((i, 'm')) => (&text[..i], 60),
        Some((i, 'h')) => (&text[..i], 3600),
        Some(_) => (text, 1),
        None => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}
