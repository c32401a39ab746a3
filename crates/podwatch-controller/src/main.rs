//! podwatch - run-pod reconciliation and liveness controller

use std::sync::Arc;

use clap::Parser;
use podwatch_common::telemetry::{init_telemetry, TelemetryConfig};
use podwatch_controller::{Context, Controller, KubePodClient, Settings};
use podwatch_registry::{MemoryArchive, MemoryStatusStore};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    init_telemetry(&TelemetryConfig {
        json: settings.log_json,
        ..TelemetryConfig::default()
    })?;

    let client = kube::Client::try_default().await?;
    tracing::warn!("No external status store or archive configured, using in-memory ones");
    let context = Context::new(
        Arc::new(KubePodClient::new(client)),
        Arc::new(MemoryStatusStore::new()),
        Arc::new(MemoryArchive::new()),
    );
    let controller = Controller::new(settings, context)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    controller.run(cancel).await?;
    Ok(())
}
