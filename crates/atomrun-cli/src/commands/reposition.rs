//! Reposition command implementation.

use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use atomrun_sched::{parse_duration, reposition_orphans};

use super::common::load_settings;

/// Execute the reposition command.
pub async fn execute(
    settings: Option<&Path>,
    source: &str,
    target: &str,
    calc_style: &str,
    orphan_age: &str,
) -> Result<()> {
    let min_age = parse_duration(orphan_age)?;
    let settings = load_settings(settings)?;
    let source = settings.run_directory(source)?;
    let target = match settings.run_directories.get(target) {
        Some(path) => path.clone(),
        None => target.into(),
    };

    let report = reposition_orphans(&source, &target, calc_style, min_age)
        .await
        .with_context(|| format!("Failed to move jobs to {}", target.display()))?;

    println!(
        "{} Moved {} {} job(s) to {}",
        style("✓").green().bold(),
        report.moved.len(),
        calc_style,
        target.display()
    );
    if !report.skipped.is_empty() {
        println!(
            "  {} skipped: {}",
            style(report.skipped.len()).yellow(),
            report.skipped.join(", ")
        );
    }
    Ok(())
}
