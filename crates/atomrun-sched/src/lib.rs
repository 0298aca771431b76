//! atomrun scheduler
//!
//! Decentralized execution of large batches of atomistic calculations
//! (potential fitting scans, relaxations, property tests). Every job is a
//! directory in a shared run directory; any number of runners on any number
//! of hosts compete for jobs by atomically creating a claim marker, with no
//! central server.
//!
//! # Overview
//!
//! - [`FileBidder`] claims and releases job directories
//! - [`RunDirectoryScanner`] lists unclaimed jobs
//! - [`Runner`] loops over scan, bid, execute and report
//! - [`JobStore`] persists [`CalculationRecord`]s and archived job
//!   directories, with [`LocalStore`], [`SqliteStore`] and [`RestStore`]
//!   backends
//! - [`MultiRunnerSupervisor`] starts several runners at once
//! - [`cleanup`] resets errored jobs and recovers orphans
//!
//! # Job lifecycle
//!
//! | Step | Effect |
//! |------|--------|
//! | claim | `runner.bid` created with exclusive-create semantics |
//! | execute | calculation resolved from `calc_<style>.in` and run |
//! | report | record updated, directory archived as a blob |
//! | release | contents deleted, marker removed, directory removed |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use atomrun_sched::{CalculationRegistry, LocalStore, Runner, ScriptCalculation};
//!
//! #[tokio::main]
//! async fn main() -> atomrun_sched::SchedResult<()> {
//!     let store = Arc::new(LocalStore::new("/data/library").await?);
//!     let registry = CalculationRegistry::new()
//!         .with(ScriptCalculation::new("E_vs_r_scan", "python").with_args(["-m", "scan"]));
//!
//!     let runner = Runner::new(store, Arc::new(registry));
//!     let summary = runner.run("/scratch/run_main".as_ref(), None).await?;
//!     println!("{}: {} finished", summary.exit, summary.finished);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod bid;
pub mod calculation;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod persistence;
pub mod record;
pub mod runlog;
pub mod runner;
pub mod scanner;
pub mod supervisor;

pub use archive::JobArchive;
pub use bid::{BID_MARKER, BidClaim, Bidder, FileBidder};
pub use calculation::{CalcOutcome, Calculation, CalculationRegistry, ScriptCalculation};
pub use cleanup::{
    CleanPolicy, CleanReport, OrphanReason, OrphanReport, RepositionReport, clean_errored,
    find_orphans, reposition_orphans,
};
pub use config::{Context, Settings, StoreKind};
pub use error::{SchedError, SchedResult};
pub use persistence::{
    JobStore, LocalStore, RestStore, RetryPolicy, SqliteStore, save_record, store_router,
    store_router_with_auth,
};
pub use record::{CalculationRecord, RecordFilter, RecordStatus};
pub use runlog::{RunnerLogStatus, RunnerState, check_runners};
pub use runner::{RunExit, RunSummary, Runner, RunnerConfig};
pub use scanner::{RunDirectoryScanner, ScanOrder};
pub use supervisor::{
    MultiRunnerSupervisor, ProcessExit, SupervisorSummary, WorkerPool, parse_duration,
    sleep_until_done,
};
