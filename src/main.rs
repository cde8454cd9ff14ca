use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use kube::Client;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use capi_provider::apis::NodeClassStore;
use capi_provider::catalog::file::FileSource;
use capi_provider::catalog::{Catalog, CatalogSource};
use capi_provider::cloudprovider::CloudProvider;
use capi_provider::config::{Config, InfrastructureKind};
use capi_provider::controller::{self, ControllerContext};
use capi_provider::health;
use capi_provider::infrastructure::Infrastructure;
use capi_provider::infrastructure::capi::CapiInfrastructure;
use capi_provider::infrastructure::kwok::KwokInfrastructure;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let catalog = Arc::new(Catalog::new(CatalogSource::File(FileSource::new(
        &config.catalog_path,
    ))));
    match catalog.refresh().await {
        Ok(count) => info!(instance_types = count, path = %config.catalog_path, "catalog loaded"),
        Err(error) => warn!(%error, "initial catalog load failed, retrying in background"),
    }

    let infrastructure = match config.infrastructure {
        InfrastructureKind::Capi => Infrastructure::Capi(CapiInfrastructure::new(client.clone())),
        InfrastructureKind::Kwok => Infrastructure::Kwok(KwokInfrastructure::new(client.clone())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cloud_provider = CloudProvider::new(
        catalog.clone(),
        NodeClassStore::Kube(client.clone()),
        infrastructure,
    )
    .with_shutdown(shutdown_rx.clone());
    info!(
        infrastructure = cloud_provider.name(),
        health_addr = %config.health_addr,
        "starting capi-provider"
    );

    let refresher = {
        let catalog = catalog.clone();
        let shutdown = shutdown_rx.clone();
        let interval = config.catalog_refresh_interval();
        tokio::spawn(async move { catalog.run(interval, shutdown).await })
    };
    let health_server = tokio::spawn(health::serve(
        config.health_addr,
        catalog.clone(),
        shutdown_rx,
    ));

    tokio::select! {
        _ = controller::run(ControllerContext { client, cloud_provider }) => {
            warn!("controller stream ended");
        }
        _ = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);
    refresher.await.context("catalog refresher panicked")?;
    health_server
        .await
        .context("health server panicked")?
        .context("health server failed")?;
    info!("shutdown complete");
    Ok(())
}
