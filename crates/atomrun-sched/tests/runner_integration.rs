//! Runner Integration Tests
//!
//! These tests drive complete runners against real run directories in
//! scratch space: several runners competing for the same jobs, crashed
//! runners and their recovery, and runners reporting through the HTTP job
//! store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::json;

use atomrun_sched::{
    BidClaim, Bidder, CalcOutcome, Calculation, CalculationRegistry, CleanPolicy, FileBidder,
    JobArchive, JobStore, LocalStore, MultiRunnerSupervisor, OrphanReason, RecordFilter,
    RecordStatus, RestStore, RetryPolicy, RunExit, Runner, RunnerConfig, SchedResult,
    clean_errored, find_orphans, store_router,
};
use atomrun_sched::bid::marker_path;

const CALC_STYLE: &str = "E_vs_r_scan";
const RECORD_STYLE: &str = "calculation_E_vs_r_scan";

/// Counts how often each job is executed.
#[derive(Default)]
struct CountingCalculation {
    runs: Mutex<FxHashMap<String, usize>>,
}

impl CountingCalculation {
    fn runs(&self) -> FxHashMap<String, usize> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Calculation for CountingCalculation {
    fn style(&self) -> &str {
        CALC_STYLE
    }

    async fn execute(&self, job_dir: &Path) -> CalcOutcome {
        let name = job_dir.file_name().unwrap().to_string_lossy().into_owned();
        *self.runs.lock().unwrap().entry(name.clone()).or_default() += 1;

        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = tokio::fs::write(job_dir.join("calc.log"), format!("scanned {name}")).await;
        CalcOutcome::Finished(json!({ "job": name, "energy": -3.54 }))
    }
}

/// Lets a rival runner win every bid, counting the attempts.
struct RacingBidder {
    inner: FileBidder,
    attempts: AtomicUsize,
}

#[async_trait]
impl Bidder for RacingBidder {
    async fn try_claim(&self, job_dir: &Path, owner: &str) -> SchedResult<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.try_claim(job_dir, "rival").await?;
        self.inner.try_claim(job_dir, owner).await
    }

    async fn release_claim(&self, job_dir: &Path) -> SchedResult<()> {
        self.inner.release_claim(job_dir).await
    }

    async fn is_claimed(&self, job_dir: &Path) -> bool {
        self.inner.is_claimed(job_dir).await
    }
}

async fn add_job(run_dir: &Path, name: &str) -> PathBuf {
    let dir = run_dir.join(name);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(format!("calc_{CALC_STYLE}.in")), "r 2.0 6.0 0.1\n")
        .await
        .unwrap();
    dir
}

async fn remaining_entries(run_dir: &Path) -> Vec<String> {
    let mut entries = tokio::fs::read_dir(run_dir).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion() {
    let run = tempfile::tempdir().unwrap();
    let jobs = 24;
    for i in 0..jobs {
        add_job(run.path(), &format!("job-{i:02}")).await;
    }

    let calculation = Arc::new(CountingCalculation::default());
    let mut registry = CalculationRegistry::new();
    registry.register(calculation.clone());
    let store = Arc::new(LocalStore::temp().await.unwrap());

    let supervisor = MultiRunnerSupervisor::new(
        store.clone(),
        Arc::new(registry),
        RunnerConfig {
            owner: Some("node".to_string()),
            bidtries: 50,
            ..Default::default()
        },
    );
    let summary = supervisor.run_tasks(6, run.path()).await.unwrap();

    assert!(summary.all_clean(), "{summary:?}");
    assert_eq!(summary.runs.len(), 6);
    assert_eq!(summary.finished(), jobs);

    let runs = calculation.runs();
    assert_eq!(runs.len(), jobs);
    assert!(runs.values().all(|&n| n == 1), "{runs:?}");

    let owners: std::collections::HashSet<_> =
        summary.runs.iter().map(|r| r.owner.clone()).collect();
    assert_eq!(owners.len(), 6);

    assert!(remaining_entries(run.path()).await.is_empty());
    let finished = store
        .get_records(RECORD_STYLE, &RecordFilter::status(RecordStatus::Finished))
        .await
        .unwrap();
    assert_eq!(finished.len(), jobs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_runners_share_directory() {
    let run = tempfile::tempdir().unwrap();
    for i in 0..16 {
        add_job(run.path(), &format!("job-{i:02}")).await;
    }

    let calculation = Arc::new(CountingCalculation::default());
    let mut registry = CalculationRegistry::new();
    registry.register(calculation.clone());
    let registry = Arc::new(registry);
    let store: Arc<dyn JobStore> = Arc::new(LocalStore::temp().await.unwrap());

    let mut handles = Vec::new();
    for worker in 0..4 {
        let runner = Runner::new(store.clone(), registry.clone()).with_config(RunnerConfig {
            worker: Some(worker),
            bidtries: 50,
            ..Default::default()
        });
        let run_dir = run.path().to_path_buf();
        handles.push(tokio::spawn(async move { runner.run(&run_dir, None).await }));
    }

    let mut processed = 0;
    for handle in handles {
        let summary = handle.await.unwrap().unwrap();
        assert!(summary.exit.is_clean());
        processed += summary.processed();
    }

    assert_eq!(processed, 16);
    assert!(calculation.runs().values().all(|&n| n == 1));
}

#[cfg(unix)]
#[tokio::test]
async fn test_end_to_end_script_calculation() {
    use atomrun_sched::ScriptCalculation;

    let run = tempfile::tempdir().unwrap();
    for name in ["job-a", "job-b", "job-c"] {
        add_job(run.path(), name).await;
    }
    // job-c fails inside the calculation.
    tokio::fs::write(run.path().join("job-c/fail"), "").await.unwrap();

    let script = ScriptCalculation::new(CALC_STYLE, "sh").with_args([
        "-c",
        r#"if [ -f fail ]; then echo 'potential diverged' >&2; exit 2; fi
printf '{"energy": -3.54, "input": "%s"}' "$1" > results.json"#,
        "calc",
    ]);
    let store = Arc::new(LocalStore::temp().await.unwrap());
    let runner = Runner::new(
        store.clone(),
        Arc::new(CalculationRegistry::new().with(script)),
    );

    let summary = runner.run(run.path(), None).await.unwrap();
    assert_eq!(summary.exit, RunExit::NoJobsLeft);
    assert_eq!(summary.finished, 2);
    assert_eq!(summary.errored, 1);
    assert!(remaining_entries(run.path()).await.is_empty());

    for name in ["job-a", "job-b"] {
        let rec = store.get_record(RECORD_STYLE, name).await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Finished);
        assert_eq!(
            rec.results,
            Some(json!({ "energy": -3.54, "input": "calc_E_vs_r_scan.in" }))
        );
    }

    let failed = store.get_record(RECORD_STYLE, "job-c").await.unwrap().unwrap();
    assert_eq!(failed.status, RecordStatus::Error);
    assert!(failed.error.unwrap().contains("potential diverged"));

    let blob = store.get_blob(RECORD_STYLE, "job-c").await.unwrap().unwrap();
    let archive = JobArchive::decode(&blob).unwrap();
    assert_eq!(archive.inputs, ["calc_E_vs_r_scan.in", "fail"]);
    assert!(archive.file("runner.bid").unwrap().is_none());
    let log = archive.file("calc.log").unwrap().unwrap();
    assert!(String::from_utf8_lossy(&log).contains("potential diverged"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_crash_recovery() {
    let run = tempfile::tempdir().unwrap();
    let crashed = add_job(run.path(), "job-crashed").await;
    tokio::fs::write(crashed.join("calc.log"), "half a trajectory")
        .await
        .unwrap();
    // Claimed by a process that no longer exists.
    let claim = BidClaim {
        pid: 4_194_304 + 7,
        ..BidClaim::current("crashed-runner")
    };
    tokio::fs::write(marker_path(&crashed), serde_json::to_vec(&claim).unwrap())
        .await
        .unwrap();

    let calculation = Arc::new(CountingCalculation::default());
    let mut registry = CalculationRegistry::new();
    registry.register(calculation.clone());
    let store = Arc::new(LocalStore::temp().await.unwrap());
    let runner = Runner::new(store.clone(), Arc::new(registry));

    // The orphan is invisible to runners.
    let summary = runner.run(run.path(), None).await.unwrap();
    assert_eq!(summary.exit, RunExit::NoJobsLeft);
    assert!(calculation.runs().is_empty());

    let orphans = find_orphans(run.path(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].reason, OrphanReason::DeadOwner);
    assert_eq!(orphans[0].claim.as_ref().unwrap().owner, "crashed-runner");

    let report = clean_errored(
        store.as_ref(),
        run.path(),
        RECORD_STYLE,
        "runner node crashed",
        &CleanPolicy::default(),
    )
    .await
    .unwrap();
    assert_eq!(report.orphans, ["job-crashed"]);
    assert!(!marker_path(&crashed).exists());
    assert!(!crashed.join("calc.log").exists());

    let summary = runner.run(run.path(), None).await.unwrap();
    assert_eq!(summary.finished, 1);
    assert_eq!(calculation.runs()["job-crashed"], 1);
    let rec = store
        .get_record(RECORD_STYLE, "job-crashed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, RecordStatus::Finished);
}

#[tokio::test]
async fn test_bounded_bid_retries() {
    let run = tempfile::tempdir().unwrap();
    for name in ["j1", "j2", "j3", "j4", "j5"] {
        add_job(run.path(), name).await;
    }

    let bidder = Arc::new(RacingBidder {
        inner: FileBidder::new(),
        attempts: AtomicUsize::new(0),
    });
    let runner = Runner::new(
        Arc::new(LocalStore::temp().await.unwrap()),
        Arc::new(CalculationRegistry::new().with(CountingCalculation::default())),
    )
    .with_config(RunnerConfig {
        bidtries: 3,
        ..Default::default()
    })
    .with_bidder(bidder.clone());

    let summary = runner.run(run.path(), None).await.unwrap();
    assert_eq!(summary.exit, RunExit::BidTriesExhausted);
    assert_eq!(bidder.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(summary.processed(), 0);

    let mut claimed = 0;
    for name in ["j1", "j2", "j3", "j4", "j5"] {
        if FileBidder::new().is_claimed(&run.path().join(name)).await {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 3);
}

async fn serve(store: Arc<dyn JobStore>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, store_router(store)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_runner_reports_through_rest_store() {
    let run = tempfile::tempdir().unwrap();
    add_job(run.path(), "job-a").await;
    add_job(run.path(), "job-b").await;

    let backend = Arc::new(LocalStore::temp().await.unwrap());
    let url = serve(backend.clone()).await;
    let remote = Arc::new(RestStore::new(url).unwrap());

    let runner = Runner::new(
        remote,
        Arc::new(CalculationRegistry::new().with(CountingCalculation::default())),
    );
    let summary = runner.run(run.path(), None).await.unwrap();
    assert_eq!(summary.finished, 2);

    let rec = backend.get_record(RECORD_STYLE, "job-b").await.unwrap().unwrap();
    assert_eq!(rec.status, RecordStatus::Finished);
    assert_eq!(rec.results.unwrap()["job"], "job-b");
    assert!(backend.has_blob(RECORD_STYLE, "job-a").await.unwrap());
}

#[tokio::test]
async fn test_unavailable_store_stops_runner() {
    let run = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let job = add_job(run.path(), "job-a").await;

    // A port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = RestStore::new(format!("http://{addr}"))
        .unwrap()
        .with_retry(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        });
    let runner = Runner::new(
        Arc::new(remote),
        Arc::new(CalculationRegistry::new().with(CountingCalculation::default())),
    )
    .with_config(RunnerConfig {
        log_dir: Some(logs.path().to_path_buf()),
        ..Default::default()
    });

    let summary = runner.run(run.path(), None).await.unwrap();
    assert!(matches!(summary.exit, RunExit::StoreUnavailable(_)));
    assert!(!summary.exit.is_clean());
    assert_eq!(summary.left_claimed, 1);

    // Left intact and claimed.
    assert!(marker_path(&job).exists());
    assert!(job.join("calc_E_vs_r_scan.in").exists());
    assert!(job.join("calc.log").exists());

    let log = tokio::fs::read_to_string(summary.log_path.unwrap())
        .await
        .unwrap();
    assert!(log.lines().last().unwrap().starts_with("Runner stopped:"));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let run = tempfile::tempdir().unwrap();
    let job = add_job(run.path(), "job-a").await;
    let bidder = FileBidder::new();

    assert!(bidder.try_claim(&job, "me").await.unwrap());
    bidder.release_claim(&job).await.unwrap();
    bidder.release_claim(&job).await.unwrap();
    assert!(!bidder.is_claimed(&job).await);
    assert!(bidder.try_claim(&job, "me").await.unwrap());
}
