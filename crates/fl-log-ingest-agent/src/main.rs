// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fl_log_ingest::{
    cluster::Cluster,
    config::{IngestConfig, StoreBackend},
    errors::ServicesError,
    kube_cluster::KubeCluster,
    services::IngestServices,
    store::{MemoryStore, PgStore, Store},
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,tower=off,sqlx=warn,kube_client=warn,{}",
        config.log_level
    );
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let store = build_store(&config).await?;
    let cluster: Arc<dyn Cluster> = Arc::new(
        KubeCluster::try_new(config.kubeconfig.as_deref())
            .await
            .map_err(ServicesError::ClusterInit)?,
    );

    let services = IngestServices::new(config, store, cluster);
    let handle = services.start().await?;

    shutdown_signal().await;
    handle.stop().await?;
    let report = handle.wait().await?;
    info!(
        applied = report.ingest.applied,
        skipped = report.ingest.skipped,
        ignored = report.ingest.ignored,
        failed = report.ingest.failed,
        tracked_pods = report.tracked_pods,
        "fl-log-ingest-agent exiting"
    );
    Ok(())
}

async fn build_store(config: &IngestConfig) -> Result<Arc<dyn Store>, ServicesError> {
    match config.store {
        StoreBackend::Memory => {
            warn!("using in-memory store, nothing will be persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            if config.max_idle_conns != config.max_open_conns {
                debug!(
                    max_idle_conns = config.max_idle_conns,
                    "DB_MAX_IDLE_CONNS has no effect, idle connections are bounded by DB_MAX_OPEN_CONNS"
                );
            }
            let store = PgStore::connect(config)
                .await
                .map_err(ServicesError::StoreInit)?;
            if config.run_migrations {
                store
                    .run_migrations()
                    .await
                    .map_err(ServicesError::StoreInit)?;
                info!("database migrations applied");
            }
            Ok(Arc::new(store))
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "unable to listen for SIGTERM, only Ctrl-C will stop the agent");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl-C, shutting down");
}
