//! DNSaaS Availability API server

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dnsaas_api::{build_router, ApiState};
use dnsaas_availability::ports::{HttpMetricsProvider, HttpProvisioner, LogNotifier, NetworkProber};
use dnsaas_availability::{AvailabilityConfig, AvailabilityCore, Ports};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("DNSAAS_CONFIG") {
        Ok(path) => AvailabilityConfig::load(&path).with_context(|| format!("loading config from {}", path))?,
        Err(_) => {
            tracing::warn!("DNSAAS_CONFIG not set, using default configuration");
            AvailabilityConfig::default()
        }
    };

    let listen: SocketAddr = std::env::var("DNSAAS_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()
        .context("invalid DNSAAS_LISTEN address")?;
    let provisioner_url =
        std::env::var("DNSAAS_PROVISIONER_URL").unwrap_or_else(|_| "http://127.0.0.1:9100".into());
    let metrics_url = std::env::var("DNSAAS_METRICS_URL").unwrap_or_else(|_| "http://127.0.0.1:9200".into());

    let ports = Ports::new(
        Arc::new(NetworkProber::new(config.health.probe_timeout())?),
        Arc::new(HttpProvisioner::new(provisioner_url)),
        Arc::new(HttpMetricsProvider::new(metrics_url)),
        Arc::new(LogNotifier),
    );
    let core = Arc::new(AvailabilityCore::new(config, ports));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = {
        let core = core.clone();
        tokio::spawn(async move { core.run(shutdown_rx).await })
    };

    let app = build_router(ApiState::new(core));
    tracing::info!("DNSaaS availability API listening on {}", listen);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    background.await?;
    Ok(())
}
