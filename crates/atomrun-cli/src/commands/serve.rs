//! Serve command implementation.
//!
//! Exposes a configured job store over HTTP so runners on other hosts can
//! use it as a `remote` database.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context as _, Result};
use console::style;
use tracing::{info, warn};

use atomrun_sched::store_router_with_auth;

use super::common::load_context;

/// Execute the serve command.
pub async fn execute(
    settings: Option<&Path>,
    database: &str,
    address: &str,
    api_key: Option<String>,
) -> Result<()> {
    let ctx = load_context(settings, database).await?;
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("Invalid listen address: {address}"))?;

    if api_key.is_none() {
        warn!("Serving {} without authentication", database);
    }
    let app = store_router_with_auth(ctx.store.clone(), api_key);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    println!(
        "{} Serving database {} on http://{}",
        style("→").cyan().bold(),
        style(database).bold(),
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Job store service failed")?;

    info!("Job store service shut down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
