//! Runner command implementation.

use std::path::Path;

use anyhow::{Context as _, Result};

use super::common::{load_context, print_summary};

/// Execute the runner command.
pub async fn execute(
    settings: Option<&Path>,
    database: &str,
    run_directory: &str,
    job: Option<&str>,
    bidtries: Option<u32>,
) -> Result<()> {
    let ctx = load_context(settings, database).await?;
    let run_dir = ctx.run_directory(run_directory)?;

    let mut config = ctx.settings.runner_config();
    if let Some(bidtries) = bidtries {
        config.bidtries = bidtries;
    }

    let summary = ctx
        .runner(config)
        .run(&run_dir, job)
        .await
        .with_context(|| format!("Runner failed on {}", run_dir.display()))?;

    print_summary(&summary);
    if !summary.exit.is_clean() {
        anyhow::bail!("{}", summary.exit);
    }
    Ok(())
}
