// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single consumer of the bounded envelope queue.
//!
//! All pod tails feed one queue and this service applies envelopes one at a time, so writes for
//! the same entity never race each other. On cancellation the queue is drained before stopping.

use crate::envelope::Envelope;
use crate::persistence::{Ingestor, Outcome};
use tokio::sync::mpsc::{self, error::TryRecvError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Counters of what the service did with the envelopes it consumed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub failed: u64,
}

impl IngestStats {
    pub fn total(&self) -> u64 {
        self.applied + self.skipped + self.ignored + self.failed
    }
}

pub struct IngestService {
    rx: mpsc::Receiver<Envelope>,
    ingestor: Ingestor,
    cancel_token: CancellationToken,
    stats: IngestStats,
}

impl IngestService {
    /// Returns the service and the sending side of its queue, which holds `capacity` envelopes.
    #[must_use]
    pub fn new(
        ingestor: Ingestor,
        capacity: usize,
        cancel_token: CancellationToken,
    ) -> (Self, Sender<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let service = Self {
            rx,
            ingestor,
            cancel_token,
            stats: IngestStats::default(),
        };
        (service, tx)
    }

    /// Consumes envelopes until cancelled or until every sender is gone.
    pub async fn spin(mut self) -> IngestStats {
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(envelope) => self.handle(envelope).await,
                    None => {
                        debug!("envelope queue closed");
                        break;
                    }
                },
                () = self.cancel_token.cancelled() => {
                    debug!("received shutdown signal, draining remaining envelopes");
                    self.drain().await;
                    break;
                }
            }
        }
        self.stats
    }

    async fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => self.handle(envelope).await,
                Err(TryRecvError::Empty) => {
                    debug!("no more queued envelopes");
                    break;
                }
                Err(TryRecvError::Disconnected) => {
                    debug!("envelope queue disconnected, finished draining");
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match self.ingestor.ingest(&envelope).await {
            Ok(Outcome::Applied) => self.stats.applied += 1,
            Ok(Outcome::Skipped) => self.stats.skipped += 1,
            Ok(Outcome::Ignored) => self.stats.ignored += 1,
            Err(e) => {
                error!(
                    event = %envelope.event,
                    pod = %envelope.pod_name,
                    ts = %envelope.timestamp,
                    error = %e,
                    "failed to apply event"
                );
                self.stats.failed += 1;
            }
        }
    }
}
