//! Shared helpers for CLI commands.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use console::{StyledObject, style};
use indicatif::{ProgressBar, ProgressStyle};

use atomrun_sched::{Context, RecordStatus, RunSummary, Settings};

/// Load the settings file, falling back to defaults when none exists.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    Settings::load(path).context("Failed to load settings")
}

/// Load the settings and resolve a database into a [`Context`].
pub async fn load_context(path: Option<&Path>, database: &str) -> Result<Context> {
    let settings = load_settings(path)?;
    Context::from_settings(settings, database)
        .await
        .with_context(|| format!("Failed to open database '{database}'"))
}

/// Record styles to work on: the given one, or every configured calculation.
pub fn record_styles(ctx: &Context, style: Option<&str>) -> Result<Vec<String>> {
    if let Some(style) = style {
        return Ok(vec![style.to_string()]);
    }
    let styles = ctx.record_styles();
    if styles.is_empty() {
        anyhow::bail!("No calculations configured; pass --style");
    }
    Ok(styles)
}

/// Spinner shown while a long-running command works.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
        spinner.set_style(template);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Colour a record status.
pub fn styled_status(status: RecordStatus) -> StyledObject<&'static str> {
    let name = status.name();
    match status {
        RecordStatus::Finished => style(name).green(),
        RecordStatus::Error => style(name).red(),
        RecordStatus::Running => style(name).cyan(),
        RecordStatus::NotCalculated => style(name).yellow(),
    }
}

/// Print what a runner did.
pub fn print_summary(summary: &RunSummary) {
    let marker = if summary.exit.is_clean() {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };
    println!("{} {} ({})", marker, summary.exit, style(&summary.owner).dim());
    println!(
        "  finished: {}  errored: {}  left claimed: {}  bids: {}",
        style(summary.finished).green(),
        style(summary.errored).red(),
        style(summary.left_claimed).yellow(),
        summary.claim_attempts
    );
    if let Some(path) = &summary.log_path {
        println!("  log: {}", style(path.display()).dim());
    }
}
