//! VM hatchery binary.
//!
//! Runs the intake, spawn, reaper and provisioning loops against the
//! configured job backend and serves `/healthz`, `/livez` and `/status`.
//!
//! No hypervisor adapter is wired in yet: instances live in an in-memory
//! provider, so the binary books jobs and tracks a fleet but starts no real
//! machines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hatchery::backend::{HttpBackend, HttpEventSource};
use hatchery::config::Config;
use hatchery::metrics::AtomicMetrics;
use hatchery::provider::InMemoryProvider;
use hatchery::{api, Hatchery};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level can come from it
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        hatchery = %config.name,
        api_url = %config.api_url,
        max_concurrent = config.max_concurrent_provisioning,
        pools = config.provisioning.len(),
        "Starting hatchery"
    );

    let backend = Arc::new(HttpBackend::new(&config.api_url, config.api_token.clone())?);
    let events = Arc::new(HttpEventSource::new(&config.api_url, config.api_token.clone())?);

    // No hypervisor adapter ships with this binary yet
    warn!("No provider adapter configured, using the in-memory provider");
    let provider = Arc::new(InMemoryProvider::new());

    let metrics = Arc::new(AtomicMetrics::new());
    let hatchery = Arc::new(Hatchery::new(&config, backend, events, provider, metrics)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut running = hatchery.start(shutdown_rx.clone());

    let app = api::create_router(hatchery.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(e) = running.errors.recv() => {
                if e.is_fatal() {
                    error!(error = %e, "Fatal hatchery error, shutting down");
                    break;
                }
                warn!(error = %e, "Hatchery error");
            }
        }
    }

    // Signal shutdown to all loops
    let _ = shutdown_tx.send(true);

    info!("Waiting for loops to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in running.tasks {
        match tokio::time::timeout(shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task panicked"),
            Err(_) => warn!(task = name, "Task did not shut down in time"),
        }
    }
    match tokio::time::timeout(shutdown_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Server error"),
        Ok(Err(e)) => error!(error = %e, "Server task panicked"),
        Err(_) => warn!("Server did not shut down in time"),
    }

    info!("Hatchery shutdown complete");
    Ok(())
}
