// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic pod discovery and per-pod tail scheduling.
//!
//! Each tick lists the matching pods and tails all of them concurrently, one task per pod. The
//! per-pod cursor table is owned by the loop and only ever ratchets forward.

use crate::cluster::Cluster;
use crate::tailer::{Cursor, PodTailer};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Last confirmed cursor per pod name. A missing entry means full history.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CursorTable {
    cursors: HashMap<String, DateTime<Utc>>,
}

impl CursorTable {
    pub fn get(&self, pod: &str) -> Cursor {
        self.cursors.get(pod).copied()
    }

    /// Moves the pod's cursor to `max(existing, cursor)` and returns the result.
    pub fn advance(&mut self, pod: &str, cursor: Cursor) -> Cursor {
        let current = self.get(pod);
        let next = current.max(cursor);
        if let Some(ts) = next {
            if next != current {
                self.cursors.insert(pod.to_string(), ts);
            }
        }
        next
    }

    /// Drops the cursor of every pod not in `listed`. Returns how many were dropped.
    pub fn retain_listed<'a>(&mut self, listed: impl IntoIterator<Item = &'a str>) -> usize {
        let listed: HashSet<&str> = listed.into_iter().collect();
        let before = self.cursors.len();
        self.cursors.retain(|pod, _| listed.contains(pod.as_str()));
        before - self.cursors.len()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Result of one discovery tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub pods: usize,
    pub failed: usize,
    /// Set when listing pods failed and the tick was skipped.
    pub list_failed: bool,
}

pub struct Discovery {
    cluster: Arc<dyn Cluster>,
    tailer: Arc<PodTailer>,
    namespace: String,
    label_selector: String,
    tick_interval: Duration,
    cursors: CursorTable,
    cancel_token: CancellationToken,
}

impl Discovery {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        tailer: Arc<PodTailer>,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        tick_interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            tailer,
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            tick_interval,
            cursors: CursorTable::default(),
            cancel_token,
        }
    }

    pub fn cursors(&self) -> &CursorTable {
        &self.cursors
    }

    /// Runs ticks on the configured interval until cancelled. Returns the final cursor table.
    pub async fn spin(mut self) -> CursorTable {
        info!(
            namespace = %self.namespace,
            label_selector = %self.label_selector,
            interval = ?self.tick_interval,
            "starting pod discovery"
        );
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.tick().await;
                    debug!(
                        pods = summary.pods,
                        failed = summary.failed,
                        tracked = self.cursors.len(),
                        "discovery tick done"
                    );
                }
            }
        }

        info!("pod discovery stopped");
        self.cursors
    }

    /// Lists pods once and tails each of them from its cursor.
    pub async fn tick(&mut self) -> TickSummary {
        let pods = match self
            .cluster
            .list_pods(&self.namespace, &self.label_selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                error!(
                    namespace = %self.namespace,
                    label_selector = %self.label_selector,
                    error = %e,
                    "failed to list pods, skipping tick"
                );
                return TickSummary {
                    list_failed: true,
                    ..Default::default()
                };
            }
        };

        let dropped = self
            .cursors
            .retain_listed(pods.iter().map(|pod| pod.name.as_str()));
        if dropped > 0 {
            debug!(dropped, "forgot cursors of pods no longer listed");
        }

        let mut summary = TickSummary {
            pods: pods.len(),
            ..Default::default()
        };
        let mut tails = JoinSet::new();
        for pod in pods {
            let cursor = self.cursors.get(&pod.name);
            let tailer = Arc::clone(&self.tailer);
            tails.spawn(async move {
                let result = tailer.tail(&pod, cursor).await;
                (pod.name, result)
            });
        }

        while let Some(joined) = tails.join_next().await {
            let (pod, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "pod tail task failed");
                    summary.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(cursor) => {
                    self.cursors.advance(&pod, cursor);
                }
                Err(partial) => {
                    warn!(pod = %pod, cursor = ?partial.cursor, error = %partial.source, "pod tail failed");
                    self.cursors.advance(&pod, partial.cursor);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
