//! Runner log files and their audit.
//!
//! Every runner appends to `runner_<pid>.txt` (or `runner_<pid>_<worker>.txt`
//! for runners sharing a process) in a log directory. The first line names
//! the pid and the last line of a cleanly stopped runner is one of a fixed
//! set of terminal phrases, so a log without one belongs to a runner that is
//! still working or has crashed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::bid::process_alive;
use crate::error::SchedResult;

/// Terminal line of a runner that found no unclaimed jobs.
pub const NO_JOBS_LEFT: &str = "No simulations left to run";

/// Terminal line of a runner that lost too many consecutive bids.
pub const BID_TRIES_EXHAUSTED: &str = "Bid tries exhausted";

/// Terminal line of a runner that processed its single requested job.
pub const SINGLE_JOB_COMPLETE: &str = "Single job complete";

/// Prefix of the terminal line of a runner stopped for any other reason.
pub const RUNNER_STOPPED: &str = "Runner stopped:";

/// Append-only log of one runner.
#[derive(Debug)]
pub struct RunnerLog {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl RunnerLog {
    /// Open (creating if needed) the log for `pid` in `log_dir`.
    pub async fn open(log_dir: &Path, pid: u32, worker: Option<usize>) -> SchedResult<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        let file_name = match worker {
            Some(worker) => format!("runner_{pid}_{worker}.txt"),
            None => format!("runner_{pid}.txt"),
        };
        let path = log_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// A log that discards every line.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            file: None,
        }
    }

    /// Path of the log file; empty for a disabled log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line. Write failures are reported through `tracing` only.
    pub async fn line(&mut self, message: impl AsRef<str>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let mut text = message.as_ref().to_string();
        text.push('\n');
        let written = match file.write_all(text.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write runner log {}: {}", self.path.display(), e);
        }
    }

    /// Write the startup line.
    pub async fn started(&mut self, pid: u32) {
        self.line(format!("Runner started with pid {pid}")).await;
    }
}

/// Whether a log line is one of the terminal phrases.
pub fn is_terminal_line(line: &str) -> bool {
    let line = line.trim();
    line == NO_JOBS_LEFT
        || line == BID_TRIES_EXHAUSTED
        || line == SINGLE_JOB_COMPLETE
        || line.starts_with(RUNNER_STOPPED)
}

/// State of a runner as seen from its log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// The log ends with a terminal phrase.
    Finished,

    /// No terminal phrase and the process is gone.
    Crashed,

    /// No terminal phrase and the process is alive.
    Active,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Finished => write!(f, "finished"),
            RunnerState::Crashed => write!(f, "crashed"),
            RunnerState::Active => write!(f, "active"),
        }
    }
}

/// Audit result for one runner log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerLogStatus {
    pub path: PathBuf,
    pub pid: u32,
    pub state: RunnerState,
    /// Last non-empty line of the log.
    pub last_line: Option<String>,
}

/// Extract the pid from a `runner_<pid>[_<worker>].txt` file name.
fn parse_log_name(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_prefix("runner_")?.strip_suffix(".txt")?;
    let pid = stem.split('_').next()?;
    pid.parse().ok()
}

/// Classify every runner log in `log_dir`, sorted by file name.
pub async fn check_runners(log_dir: &Path) -> SchedResult<Vec<RunnerLogStatus>> {
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut logs = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(pid) = parse_log_name(&file_name) {
            logs.push((entry.path(), pid));
        }
    }
    logs.sort();

    let mut statuses = Vec::with_capacity(logs.len());
    for (path, pid) in logs {
        let content = tokio::fs::read_to_string(&path).await?;
        let last_line = content
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string());

        let state = if last_line.as_deref().is_some_and(is_terminal_line) {
            RunnerState::Finished
        } else if process_alive(pid) {
            RunnerState::Active
        } else {
            RunnerState::Crashed
        };

        statuses.push(RunnerLogStatus {
            path,
            pid,
            state,
            last_line,
        });
    }

    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_name() {
        assert_eq!(parse_log_name("runner_1234.txt"), Some(1234));
        assert_eq!(parse_log_name("runner_1234_3.txt"), Some(1234));
        assert_eq!(parse_log_name("runner_x.txt"), None);
        assert_eq!(parse_log_name("calc.log"), None);
    }

    #[test]
    fn test_terminal_lines() {
        assert!(is_terminal_line(NO_JOBS_LEFT));
        assert!(is_terminal_line("Bid tries exhausted\n"));
        assert!(is_terminal_line("Runner stopped: job store unavailable"));
        assert!(!is_terminal_line("job-a claimed"));
    }

    #[tokio::test]
    async fn test_runner_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunnerLog::open(dir.path(), 42, None).await.unwrap();
        log.started(42).await;
        log.line("job-a claimed").await;
        log.line(NO_JOBS_LEFT).await;

        let content = tokio::fs::read_to_string(dir.path().join("runner_42.txt"))
            .await
            .unwrap();
        assert_eq!(
            content,
            "Runner started with pid 42\njob-a claimed\nNo simulations left to run\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_runners() {
        let dir = tempfile::tempdir().unwrap();
        let me = std::process::id();
        // Beyond the default pid_max on Linux, so never a live process.
        let dead = 4_194_304 + 17;

        tokio::fs::write(
            dir.path().join("runner_1.txt"),
            "Runner started with pid 1\nBid tries exhausted\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join(format!("runner_{dead}.txt")),
            format!("Runner started with pid {dead}\njob-b claimed\n"),
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join(format!("runner_{me}_0.txt")),
            format!("Runner started with pid {me}\n"),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored")
            .await
            .unwrap();

        let statuses = check_runners(dir.path()).await.unwrap();
        assert_eq!(statuses.len(), 3);

        let state_of = |pid: u32| statuses.iter().find(|s| s.pid == pid).unwrap().state;
        assert_eq!(state_of(1), RunnerState::Finished);
        assert_eq!(state_of(dead), RunnerState::Crashed);
        assert_eq!(state_of(me), RunnerState::Active);
    }
}
