//! # herald
//!
//! Herald delivery server binary: loads settings, starts the delivery
//! runtime and serves `/events`, `/health` and `/metrics` until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use herald_core::logging::init_subscriber;
use herald_server::{DeliveryRuntime, HeraldServer, ShutdownCoordinator};
use herald_settings::{HeraldSettings, load_settings_from_path, settings_path};
use tokio::net::TcpListener;

/// Herald real-time event delivery server.
#[derive(Parser, Debug)]
#[command(name = "herald", about = "Herald real-time event delivery server")]
struct Cli {
    /// Settings file (defaults to `~/.herald/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent event streams (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Cli {
    fn apply(&self, settings: &mut HeraldSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);
    settings
        .validate()
        .context("Invalid settings after command-line overrides")?;

    init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = herald_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let coordinator = ShutdownCoordinator::new();
    let runtime = DeliveryRuntime::from_settings(&settings)
        .await
        .context("Failed to connect fan-out transport")?;
    let (service, tasks) = runtime.start(coordinator.token()).await;
    coordinator.track_all(tasks);

    let listener = TcpListener::bind((settings.server.host.as_str(), settings.server.port))
        .await
        .context("Failed to bind server")?;
    let server = HeraldServer::new(settings.server.clone(), service, coordinator.token())
        .with_metrics(metrics);
    coordinator.track(tokio::spawn(async move {
        if let Err(error) = server.serve(listener).await {
            tracing::error!(%error, "http server failed");
        }
    }));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !coordinator.graceful_shutdown(None).await {
        tracing::warn!("some tasks did not stop in time");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
