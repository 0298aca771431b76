//! Check-runners command implementation.

use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use atomrun_sched::{RunnerState, check_runners};

use super::common::load_settings;

/// Execute the check-runners command.
pub async fn execute(settings: Option<&Path>, log_dir: Option<&Path>) -> Result<()> {
    let log_dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => load_settings(settings)?
            .runner
            .log_directory
            .ok_or_else(|| anyhow::anyhow!("No log directory configured; pass --log-dir"))?,
    };

    let statuses = check_runners(&log_dir)
        .await
        .with_context(|| format!("Failed to read runner logs in {}", log_dir.display()))?;

    if statuses.is_empty() {
        println!("No runner logs found.");
        return Ok(());
    }

    println!(
        "  {:<10}  {:<10}  {}",
        style("PID").bold(),
        style("STATE").bold(),
        style("LAST LINE").bold()
    );
    println!("  {}", "-".repeat(72));

    for status in &statuses {
        let state = status.state.to_string();
        let state = match status.state {
            RunnerState::Finished => style(state).green(),
            RunnerState::Crashed => style(state).red(),
            RunnerState::Active => style(state).cyan(),
        };
        println!(
            "  {:<10}  {:<10}  {}",
            status.pid,
            state,
            style(status.last_line.as_deref().unwrap_or("")).dim()
        );
    }

    let crashed = statuses
        .iter()
        .filter(|s| s.state == RunnerState::Crashed)
        .count();
    if crashed > 0 {
        println!(
            "\n{} {} crashed runner(s); run `atomrun clean` to release their jobs",
            style("!").yellow().bold(),
            crashed
        );
    }
    Ok(())
}
