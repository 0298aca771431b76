//! Multi-runner command implementation.
//!
//! Runners are either tasks in this process or separate `atomrun runner`
//! processes.

use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;

use atomrun_sched::MultiRunnerSupervisor;

use super::common::{load_context, print_summary, spinner};

/// Execute the multi command.
pub async fn execute(
    settings: Option<&Path>,
    database: &str,
    run_directory: &str,
    workers: usize,
    processes: bool,
    bidtries: Option<u32>,
    verbose: u8,
) -> Result<()> {
    if workers == 0 {
        anyhow::bail!("--workers must be at least 1");
    }

    if processes {
        return run_processes(settings, database, run_directory, workers, bidtries, verbose).await;
    }

    let ctx = load_context(settings, database).await?;
    let run_dir = ctx.run_directory(run_directory)?;
    let mut config = ctx.settings.runner_config();
    if let Some(bidtries) = bidtries {
        config.bidtries = bidtries;
    }

    let progress = spinner(format!("{workers} runners on {}", run_dir.display()));
    let summary = ctx
        .supervisor(config)
        .run_tasks(workers, &run_dir)
        .await
        .with_context(|| format!("Failed to start runners on {}", run_dir.display()))?;
    progress.finish_and_clear();

    for run in &summary.runs {
        print_summary(run);
    }
    for failure in &summary.failures {
        println!("{} {}", style("✗").red().bold(), failure);
    }
    println!(
        "\n{} {} finished, {} errored, {} left claimed",
        style("→").cyan().bold(),
        summary.finished(),
        summary.errored(),
        summary.left_claimed()
    );

    if !summary.all_clean() {
        anyhow::bail!("Not every runner stopped cleanly");
    }
    Ok(())
}

async fn run_processes(
    settings: Option<&Path>,
    database: &str,
    run_directory: &str,
    workers: usize,
    bidtries: Option<u32>,
    verbose: u8,
) -> Result<()> {
    let program = std::env::current_exe().context("Cannot locate the atomrun executable")?;

    let mut args = Vec::new();
    if verbose > 0 {
        args.push(format!("-{}", "v".repeat(verbose.into())));
    }
    if let Some(settings) = settings {
        args.push("--settings".to_string());
        args.push(settings.display().to_string());
    }
    args.extend(["runner", database, run_directory].map(String::from));
    if let Some(bidtries) = bidtries {
        args.push("--bidtries".to_string());
        args.push(bidtries.to_string());
    }

    let progress = spinner(format!("{workers} runner processes"));
    let exits = MultiRunnerSupervisor::spawn_processes(&program, &args, workers).await;
    progress.finish_and_clear();

    let mut failed = 0;
    for exit in &exits {
        let pid = exit.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        if exit.success() {
            println!("{} runner {} (pid {})", style("✓").green().bold(), exit.worker, pid);
        } else {
            failed += 1;
            let reason = exit
                .error
                .clone()
                .or_else(|| exit.code.map(|c| format!("exit code {c}")))
                .unwrap_or_else(|| "killed by signal".to_string());
            println!(
                "{} runner {} (pid {}): {}",
                style("✗").red().bold(),
                exit.worker,
                pid,
                reason
            );
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {workers} runner processes failed");
    }
    Ok(())
}
