//! Sleep command implementation.
//!
//! Blocks until a run directory is empty, e.g. at the end of a batch
//! script that started runners in the background.

use std::path::Path;

use anyhow::Result;
use console::style;

use atomrun_sched::{RunDirectoryScanner, parse_duration, sleep_until_done};

use super::common::{load_settings, spinner};

/// Execute the sleep command.
pub async fn execute(
    settings: Option<&Path>,
    run_directory: &str,
    initial: &str,
    delta: &str,
) -> Result<()> {
    let settings = load_settings(settings)?;
    let run_dir = settings.run_directory(run_directory)?;
    let initial = parse_duration(initial)?;
    let delta = parse_duration(delta)?;

    let scanner = RunDirectoryScanner::new(settings.runner.scan_order);
    let progress = spinner(format!("Waiting for {} to drain", run_dir.display()));
    let slept = sleep_until_done(&scanner, &run_dir, initial, delta).await;
    progress.finish_and_clear();

    let slept = slept?;
    println!(
        "{} {} is empty (waited {}s)",
        style("✓").green().bold(),
        run_dir.display(),
        slept.as_secs()
    );
    Ok(())
}
