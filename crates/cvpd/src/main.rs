//! cvpd: content inspection daemon.
//!
//! Peers connect over TCP, upload content, and get a verdict followed by
//! the content itself streamed back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use cvp_core::config::CvpConfig;
use cvp_core::{FilenamePrefixPolicy, VerdictPolicy};
use cvp_services::{serve, Coordinator, CoordinatorHandle, ScratchStore, TransportSettings};

/// Upper bound on how long the coordinator may take to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn print_usage() {
    println!("Usage: cvpd [-v]");
    println!();
    println!("Options:");
    println!("  -v, --verbose   Log every command exchanged with workers");
    println!();
    println!("Configuration is read from $CVPD_CONFIG or ~/.config/cvpd/config.toml");
    println!("and may be overridden with CVPD_* environment variables.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load config
    if let Err(e) = CvpConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CvpConfig::load().context("invalid configuration")?;
    tracing::info!(
        listen = %config.server.listen,
        chunk_size = config.inspection.chunk_size,
        "cvpd starting"
    );

    // Scratch storage
    let store = ScratchStore::new(&config.inspection.scratch_dir)?;
    let stale = store.purge();
    if stale > 0 {
        tracing::info!(removed = stale, "removed stale scratch files");
    }
    tracing::info!(root = %store.root().display(), "scratch storage ready");

    let prefix_policy = FilenamePrefixPolicy::new(&config.inspection.infected_prefix);
    tracing::info!(infected_prefix = prefix_policy.prefix(), "verdict policy ready");
    let policy: Arc<dyn VerdictPolicy> = Arc::new(prefix_policy);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let settings = TransportSettings {
        max_chunk_size: config.server.max_chunk_size,
        outbound_depth: config.server.outbound_queue_depth,
    };

    // Shutdown broadcast
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let (coordinator, reports) = Coordinator::new(config.inspection.chunk_size, store, policy);
    let (handle, events) = CoordinatorHandle::new();

    let mut coordinator_task =
        tokio::spawn(coordinator.run(reports, events, shutdown_tx.subscribe()));
    let serve_task = tokio::spawn(serve(listener, handle, settings, shutdown_tx.subscribe()));

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv()      => tracing::info!("shutting down"),
        r = serve_task              => tracing::error!("listener exited: {:?}", r),
        r = &mut coordinator_task   => {
            let _ = shutdown_tx.send(());
            return Err(premature_exit(r));
        }
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, coordinator_task).await {
        Ok(Ok(Ok(()))) => tracing::info!("coordinator stopped"),
        Ok(Ok(Err(e))) => return Err(e.context("coordinator failed during shutdown")),
        Ok(Err(e)) => anyhow::bail!("coordinator task panicked: {e}"),
        Err(_) => tracing::warn!("coordinator did not stop in time"),
    }
    Ok(())
}

/// The coordinator only returns on shutdown, so any earlier exit is fatal.
fn premature_exit(result: Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("coordinator exited unexpectedly"),
        Ok(Err(e)) => e.context("coordinator failed"),
        Err(e) => anyhow::anyhow!("coordinator task panicked: {e}"),
    }
}
