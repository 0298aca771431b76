//! Clean command implementation.

use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use atomrun_sched::{CleanPolicy, clean_errored, parse_duration};

use super::common::{load_context, record_styles};

/// Execute the clean command.
pub async fn execute(
    settings: Option<&Path>,
    database: &str,
    run_directory: &str,
    message: &str,
    record_style: Option<&str>,
    filter: Option<&str>,
    orphan_age: &str,
) -> Result<()> {
    let ctx = load_context(settings, database).await?;
    let run_dir = ctx.run_directory(run_directory)?;

    let mut policy = CleanPolicy::default().with_orphan_min_age(parse_duration(orphan_age)?);
    policy.delete_attempts = ctx.settings.runner.delete_attempts;
    if let Some(filter) = filter {
        policy = policy.with_error_filter(filter);
    }

    let mut failures = 0;
    for record_style in record_styles(&ctx, record_style)? {
        let report = clean_errored(ctx.store.as_ref(), &run_dir, &record_style, message, &policy)
            .await
            .with_context(|| format!("Failed to clean {record_style}"))?;

        println!(
            "{} {}: {} reset, {} restored, {} kept in place, {} orphans released",
            style("→").cyan().bold(),
            style(&record_style).bold(),
            report.reset.len(),
            report.restored.len(),
            report.kept.len(),
            report.orphans.len()
        );
        for (name, reason) in &report.failed {
            println!("  {} {}: {}", style("✗").red().bold(), name, reason);
        }
        failures += report.failed.len();
    }

    if failures > 0 {
        anyhow::bail!("{failures} job(s) could not be cleaned");
    }
    Ok(())
}
