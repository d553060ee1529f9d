//! aqua-ble - BLE service daemon for aquarium peripherals.
//!
//! Manages a fleet of Bluetooth LE dosing pumps and lights: discovers and
//! connects devices, decodes their status notifications, executes client
//! commands, and persists per-device configurations with revision history.
//! A JSON HTTP API exposes the whole surface to the web client.

mod api;
mod atomic_config;
mod cli;
mod config;
mod device;
mod doser_status;
mod doser_storage;
mod error;
mod executor;
mod light_status;
mod light_storage;
mod protocol;
mod service;
mod storage_util;
mod timezone;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use config::Settings;
use executor::CommandExecutor;
use service::BleService;
use transport::{BleTransport, BtleplugTransport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        Settings::log_level()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let mut settings = Settings::from_env();
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let transport = Arc::new(
        BtleplugTransport::new()
            .await
            .context("failed to initialize bluetooth adapter")?,
    ) as Arc<dyn BleTransport>;

    let service = Arc::new(BleService::new(transport, settings.clone())?);
    service.start().await;

    let executor = Arc::new(CommandExecutor::new(Arc::clone(&service)));
    let app = api::router(api::AppState {
        service: Arc::clone(&service),
        executor,
    })
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", settings.host, settings.port))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down; persisting state and disconnecting devices");
    service.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
}
