// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use super::mocks::ScriptedCluster;
use chrono::{DateTime, TimeZone, Utc};
use fl_log_ingest::cluster::PodInfo;
use fl_log_ingest::discovery::{Discovery, TickSummary};
use fl_log_ingest::envelope::Envelope;
use fl_log_ingest::errors::IngestError;
use fl_log_ingest::persistence::{Ingestor, Outcome};
use fl_log_ingest::store::Store;
use fl_log_ingest::tailer::PodTailer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "flwr";
pub const SELECTOR: &str = "name=superexec";

/// 2024-01-01T00:00:00Z plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
}

/// A raw log line as the API server returns it with timestamps enabled.
pub fn log_line(secs: i64, message: &str) -> String {
    format!("{} {message}", at(secs).to_rfc3339())
}

pub fn client_pod(name: &str) -> PodInfo {
    PodInfo::new(name, "node-a").with_label("component", "clientapp")
}

pub fn server_pod(name: &str) -> PodInfo {
    PodInfo::new(name, "node-b").with_label("component", "serverapp")
}

pub fn readline(training: &str, partition: i32, text: &str) -> String {
    serde_json::json!({
        "event": "READLINE",
        "payload": {"fl_training_id": training, "partition_id": partition, "text": text}
    })
    .to_string()
}

pub fn set_state(training: &str, partition: i32, state: &str) -> String {
    serde_json::json!({
        "event": "SETSTATE",
        "payload": {"fl_training_id": training, "partition_id": partition, "state": state}
    })
    .to_string()
}

pub fn set_current_server_round(training: &str, partition: i32, round: i32) -> String {
    serde_json::json!({
        "event": "SET_CURRENT_SERVER_ROUND",
        "payload": {"fl_training_id": training, "partition_id": partition, "server_round": round}
    })
    .to_string()
}

pub fn create_fl_training(training: &str, num_rounds: i32) -> String {
    serde_json::json!({
        "event": "CREATE_FL_TRAINING",
        "payload": {"fl_training_id": training, "num_rounds": num_rounds}
    })
    .to_string()
}

/// Discovery and tailing wired to a plain queue, with the consumer driven by the test so every
/// tick's outcomes can be inspected before the next one.
pub struct Pipeline {
    pub discovery: Discovery,
    rx: mpsc::Receiver<Envelope>,
    ingestor: Ingestor,
}

impl Pipeline {
    pub fn new(cluster: Arc<ScriptedCluster>, store: Arc<dyn Store>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let cancel_token = CancellationToken::new();
        let tailer = Arc::new(PodTailer::new(
            cluster.clone(),
            NAMESPACE,
            tx,
            cancel_token.clone(),
        ));
        let discovery = Discovery::new(
            cluster,
            tailer,
            NAMESPACE,
            SELECTOR,
            Duration::from_secs(5),
            cancel_token,
        );
        Self {
            discovery,
            rx,
            ingestor: Ingestor::new(store),
        }
    }

    /// Runs one discovery tick, then applies everything it queued.
    pub async fn tick(&mut self) -> (TickSummary, Vec<Result<Outcome, IngestError>>) {
        let summary = self.discovery.tick().await;
        let mut outcomes = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            outcomes.push(self.ingestor.ingest(&envelope).await);
        }
        (summary, outcomes)
    }
}
