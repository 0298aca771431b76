//! atomrun command-line interface
//!
//! ```text
//!   runner        claim and run jobs until none are left
//!   multi         start several runners at once
//!   clean         reset errored and orphaned jobs
//!   reposition    move jobs between run directories
//!   sleep         wait for a run directory to drain
//!   check-runners audit runner log files
//!   status        count records per status
//!   serve         expose a job store over HTTP
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{check_runners, clean, multi, reposition, runner, serve, sleep, status};

/// atomrun - decentralized runners for high-throughput atomistic calculations
#[derive(Parser, Debug)]
#[command(name = "atomrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file (default: ~/.atomrun/settings.yaml)
    #[arg(long, global = true, env = "ATOMRUN_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim and run jobs from a run directory until none are left
    Runner {
        /// Database name from the settings
        database: String,

        /// Run directory name from the settings, or a path
        run_directory: String,

        /// Process only this job and exit
        #[arg(long)]
        job: Option<String>,

        /// Consecutive failed bids before giving up
        #[arg(long)]
        bidtries: Option<u32>,
    },

    /// Start several runners on one run directory
    Multi {
        /// Database name from the settings
        database: String,

        /// Run directory name from the settings, or a path
        run_directory: String,

        /// Number of runners
        #[arg(short = 'n', long, default_value = "1")]
        workers: usize,

        /// Start separate runner processes instead of in-process tasks
        #[arg(long)]
        processes: bool,

        /// Consecutive failed bids before a runner gives up
        #[arg(long)]
        bidtries: Option<u32>,
    },

    /// Reset errored jobs and release orphaned ones
    Clean {
        /// Database name from the settings
        database: String,

        /// Run directory name from the settings, or a path
        run_directory: String,

        /// Note logged with every reset
        message: String,

        /// Record style to clean (default: every configured calculation)
        #[arg(long)]
        style: Option<String>,

        /// Only reset records whose error contains this text
        #[arg(long)]
        filter: Option<String>,

        /// Age after which claims from other hosts count as orphaned
        #[arg(long, default_value = "24h")]
        orphan_age: String,
    },

    /// Move jobs of one calculation style to another run directory
    Reposition {
        /// Source run directory
        source: String,

        /// Target run directory
        target: String,

        /// Calculation style to move
        calc_style: String,

        /// Age after which claims from other hosts count as orphaned
        #[arg(long, default_value = "24h")]
        orphan_age: String,
    },

    /// Wait until a run directory has no jobs left
    Sleep {
        /// Run directory name from the settings, or a path
        run_directory: String,

        /// First wait (seconds, or with s/m/h suffix)
        initial: String,

        /// Increase of the wait after every check
        delta: String,
    },

    /// Report which runners finished, crashed or are still active
    CheckRunners {
        /// Log directory (default: runner.log_directory from the settings)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Count records per status
    Status {
        /// Database name from the settings
        database: String,

        /// Record style (default: every configured calculation)
        #[arg(long)]
        style: Option<String>,
    },

    /// Serve a job store over HTTP for remote runners
    Serve {
        /// Database name from the settings
        database: String,

        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        address: String,

        /// Require this bearer token
        #[arg(long, env = "ATOMRUN_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter(cli.verbose)))
        .with_target(false)
        .init();

    let settings = cli.settings.as_deref();
    let result = match cli.command {
        Commands::Runner {
            database,
            run_directory,
            job,
            bidtries,
        } => runner::execute(settings, &database, &run_directory, job.as_deref(), bidtries).await,

        Commands::Multi {
            database,
            run_directory,
            workers,
            processes,
            bidtries,
        } => {
            multi::execute(
                settings,
                &database,
                &run_directory,
                workers,
                processes,
                bidtries,
                cli.verbose,
            )
            .await
        }

        Commands::Clean {
            database,
            run_directory,
            message,
            style,
            filter,
            orphan_age,
        } => {
            clean::execute(
                settings,
                &database,
                &run_directory,
                &message,
                style.as_deref(),
                filter.as_deref(),
                &orphan_age,
            )
            .await
        }

        Commands::Reposition {
            source,
            target,
            calc_style,
            orphan_age,
        } => reposition::execute(settings, &source, &target, &calc_style, &orphan_age).await,

        Commands::Sleep {
            run_directory,
            initial,
            delta,
        } => sleep::execute(settings, &run_directory, &initial, &delta).await,

        Commands::CheckRunners { log_dir } => {
            check_runners::execute(settings, log_dir.as_deref()).await
        }

        Commands::Status { database, style } => {
            status::execute(settings, &database, style.as_deref()).await
        }

        Commands::Serve {
            database,
            address,
            api_key,
        } => serve::execute(settings, &database, &address, api_key).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_runner() {
        let cli = Cli::try_parse_from([
            "atomrun", "-vv", "runner", "master", "main", "--job", "job-a", "--bidtries", "3",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Runner {
                database,
                run_directory,
                job,
                bidtries,
            } => {
                assert_eq!(database, "master");
                assert_eq!(run_directory, "main");
                assert_eq!(job.as_deref(), Some("job-a"));
                assert_eq!(bidtries, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_multi() {
        let cli = Cli::try_parse_from([
            "atomrun", "multi", "master", "main", "--workers", "8", "--processes",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Multi {
                workers: 8,
                processes: true,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_clean_defaults() {
        let cli = Cli::try_parse_from([
            "atomrun",
            "--settings",
            "/etc/atomrun.yaml",
            "clean",
            "master",
            "main",
            "new potential",
            "--filter",
            "converge",
        ])
        .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/atomrun.yaml")));
        match cli.command {
            Commands::Clean {
                message,
                style,
                filter,
                orphan_age,
                ..
            } => {
                assert_eq!(message, "new potential");
                assert_eq!(style, None);
                assert_eq!(filter.as_deref(), Some("converge"));
                assert_eq!(orphan_age, "24h");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_reposition() {
        let cli = Cli::try_parse_from([
            "atomrun",
            "reposition",
            "main",
            "overflow",
            "E_vs_r_scan",
            "--orphan-age",
            "2h",
        ])
        .unwrap();
        match cli.command {
            Commands::Reposition {
                calc_style,
                orphan_age,
                ..
            } => {
                assert_eq!(calc_style, "E_vs_r_scan");
                assert_eq!(orphan_age, "2h");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Cli::try_parse_from(["atomrun"]).is_err());
        assert!(Cli::try_parse_from(["atomrun", "runner", "master"]).is_err());
        assert!(Cli::try_parse_from(["atomrun", "multi", "m", "r", "--workers", "many"]).is_err());
        assert!(Cli::try_parse_from(["atomrun", "sleep", "main", "10s"]).is_err());
    }

    #[test]
    fn test_parse_check_runners_and_serve() {
        let cli =
            Cli::try_parse_from(["atomrun", "check-runners", "--log-dir", "/scratch/logs"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckRunners { log_dir: Some(_) }));

        let cli = Cli::try_parse_from(["atomrun", "serve", "master"]).unwrap();
        match cli.command {
            Commands::Serve { address, .. } => assert_eq!(address, "127.0.0.1:8080"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter(0), "warn");
        assert_eq!(log_filter(1), "info");
        assert_eq!(log_filter(2), "debug");
        assert_eq!(log_filter(9), "trace");
    }
}
