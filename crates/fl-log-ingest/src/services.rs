// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::cluster::Cluster;
use crate::config::IngestConfig;
use crate::discovery::Discovery;
use crate::errors::ServicesError;
use crate::ingest_service::{IngestService, IngestStats};
use crate::persistence::Ingestor;
use crate::store::Store;
use crate::tailer::PodTailer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Status of the ingestion services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Services are starting up.
    Starting,
    /// Discovery and ingestion are running.
    Running,
    /// Shutdown was requested and the queue is draining.
    Stopping,
    /// Services have stopped.
    Stopped,
}

/// What the services did over their lifetime, available once they have stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServicesReport {
    pub ingest: IngestStats,
    /// Pods with a confirmed cursor when discovery stopped.
    pub tracked_pods: usize,
}

type ReportSlot = Option<Result<ServicesReport, String>>;

/// Handle to the running ingestion services.
///
/// This handle allows checking the status, stopping the services and waiting for them to finish.
#[derive(Debug, Clone)]
pub struct ServicesHandle {
    status: Arc<RwLock<ServiceStatus>>,
    status_tx: broadcast::Sender<ServiceStatus>,
    cancel_token: CancellationToken,
    report_rx: watch::Receiver<ReportSlot>,
}

impl ServicesHandle {
    /// Check if the services are currently running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Get a receiver for status updates.
    pub fn status_receiver(&self) -> broadcast::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    /// Stop the services. Calling this more than once is harmless.
    pub async fn stop(&self) -> Result<(), ServicesError> {
        let mut status = self.status.write().await;
        if matches!(*status, ServiceStatus::Stopping | ServiceStatus::Stopped) {
            return Ok(());
        }

        *status = ServiceStatus::Stopping;
        drop(status);
        let _ = self.status_tx.send(ServiceStatus::Stopping);

        info!("stopping ingestion services");
        self.cancel_token.cancel();
        Ok(())
    }

    /// Waits until both discovery and ingestion have finished.
    pub async fn wait(&self) -> Result<ServicesReport, ServicesError> {
        let mut report_rx = self.report_rx.clone();
        let slot = report_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ServicesError::Runtime("services supervisor went away".to_string()))?;
        match slot.as_ref() {
            Some(Ok(report)) => Ok(*report),
            Some(Err(e)) => Err(ServicesError::Runtime(e.clone())),
            None => Err(ServicesError::Runtime("services report missing".to_string())),
        }
    }
}

/// Ingestion services coordinator.
///
/// Wires one [`Discovery`] loop and one [`IngestService`] consumer together over a bounded queue,
/// sharing a single cancellation token.
pub struct IngestServices {
    config: IngestConfig,
    store: Arc<dyn Store>,
    cluster: Arc<dyn Cluster>,
    started: AtomicBool,
}

impl IngestServices {
    pub fn new(config: IngestConfig, store: Arc<dyn Store>, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            config,
            store,
            cluster,
            started: AtomicBool::new(false),
        }
    }

    /// Start discovery and ingestion. Returns a handle that can be used to monitor and stop them.
    pub async fn start(&self) -> Result<ServicesHandle, ServicesError> {
        self.config.validate()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServicesError::AlreadyStarted);
        }

        let status = Arc::new(RwLock::new(ServiceStatus::Starting));
        let (status_tx, _status_rx) = broadcast::channel(16);
        let (report_tx, report_rx) = watch::channel(None);
        let cancel_token = CancellationToken::new();

        let (service, tx) = IngestService::new(
            Ingestor::new(Arc::clone(&self.store)),
            self.config.queue_capacity,
            cancel_token.clone(),
        );
        let tailer = Arc::new(PodTailer::new(
            Arc::clone(&self.cluster),
            self.config.namespace.clone(),
            tx,
            cancel_token.clone(),
        ));
        let discovery = Discovery::new(
            Arc::clone(&self.cluster),
            tailer,
            self.config.namespace.clone(),
            self.config.label_selector.clone(),
            self.config.tick_interval,
            cancel_token.clone(),
        );

        debug!(
            queue_capacity = self.config.queue_capacity,
            "starting ingest service"
        );
        let ingest_task = tokio::spawn(service.spin());
        let discovery_task = tokio::spawn(discovery.spin());

        let status_clone = Arc::clone(&status);
        let status_tx_clone = status_tx.clone();
        tokio::spawn(async move {
            let (cursors, stats) = tokio::join!(discovery_task, ingest_task);
            let report = match (cursors, stats) {
                (Ok(cursors), Ok(ingest)) => {
                    info!(
                        applied = ingest.applied,
                        skipped = ingest.skipped,
                        ignored = ingest.ignored,
                        failed = ingest.failed,
                        tracked_pods = cursors.len(),
                        "ingestion services stopped"
                    );
                    Ok(ServicesReport {
                        ingest,
                        tracked_pods: cursors.len(),
                    })
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!("Services error: {}", e);
                    Err(e.to_string())
                }
            };
            // Ensure we mark as stopped on any exit path
            *status_clone.write().await = ServiceStatus::Stopped;
            let _ = status_tx_clone.send(ServiceStatus::Stopped);
            report_tx.send_replace(Some(report));
        });

        {
            let mut current = status.write().await;
            if *current == ServiceStatus::Starting {
                *current = ServiceStatus::Running;
                let _ = status_tx.send(ServiceStatus::Running);
            }
        }
        info!(
            namespace = %self.config.namespace,
            label_selector = %self.config.label_selector,
            "ingestion services running"
        );

        Ok(ServicesHandle {
            status,
            status_tx,
            cancel_token,
            report_rx,
        })
    }
}
