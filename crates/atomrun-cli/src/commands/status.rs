//! Status command implementation.
//!
//! Count the records of each style per status.

use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use atomrun_sched::{RecordFilter, RecordStatus};

use super::common::{load_context, record_styles, styled_status};

/// Execute the status command.
pub async fn execute(settings: Option<&Path>, database: &str, record_style: Option<&str>) -> Result<()> {
    let ctx = load_context(settings, database).await?;

    for record_style in record_styles(&ctx, record_style)? {
        let records = ctx
            .store
            .get_records(&record_style, &RecordFilter::all())
            .await
            .with_context(|| format!("Failed to list {record_style}"))?;

        println!(
            "{} {} ({} records)",
            style("→").cyan().bold(),
            style(&record_style).bold(),
            records.len()
        );
        for status in RecordStatus::ALL {
            let count = records.iter().filter(|r| r.status == status).count();
            println!("  {:<16} {:>8}", styled_status(status), count);
        }
    }
    Ok(())
}
