use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::rest::{self, AppState};
use crate::config::ExporterConfig;
use crate::domain::reconciler::{ReconcileSettings, Reconciler};
use crate::inventory::PuppetDbClient;
use crate::metrics::{FamilyRegistry, PrometheusSink};

pub async fn run(config: ExporterConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "PuppetDB exporter starting");

    // Gauge families are fixed for the lifetime of the process
    let registry = FamilyRegistry::new(&config.category_set());
    let sink = Arc::new(PrometheusSink::new().context("creating metrics registry")?);
    registry
        .register_all(sink.as_ref())
        .context("registering gauge families")?;
    info!(
        families = ?registry.families().iter().map(|f| f.exposed_name()).collect::<Vec<_>>(),
        "gauge families registered"
    );

    let client = PuppetDbClient::from_config(&config)?;
    info!(url = %client.base_url(), "PuppetDB client ready");

    let reconciler = Reconciler::new(client, registry, ReconcileSettings::from(&config));

    let app = rest::router(
        AppState {
            sink: sink.clone(),
            started_at: Instant::now(),
        },
        &config.metrics_path,
    )
    .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let listen_address = &config.listen_address;
    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("binding to {}", listen_address))?;

    info!(
        addr = %listen_address,
        metrics_path = %config.metrics_path,
        "HTTP server listening"
    );

    // Poll loop runs until the process exits
    tokio::spawn(reconciler.run(sink));

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("PuppetDB exporter stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
