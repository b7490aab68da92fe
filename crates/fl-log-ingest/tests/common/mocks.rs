// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of the cluster and store collaborators for testing

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fl_log_ingest::cluster::{Cluster, LogStream, PodInfo};
use fl_log_ingest::errors::{ClusterError, StoreError};
use fl_log_ingest::store::{
    ClientKey, ClientLog, ClientSeed, GraphConfig, MemoryStore, ModelWeights, NewTestingPoint,
    NewTrainingPoint, Store, TestingGraph, TestingGraphPoint, Training, TrainingClient,
    TrainingGraph, TrainingGraphPoint, TrainingServer,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct PodLog {
    info: Option<PodInfo>,
    lines: Vec<String>,
    /// One-shot: the next stream breaks after this many lines.
    break_after: Option<usize>,
    since_calls: Vec<Option<DateTime<Utc>>>,
}

/// Cluster whose pods serve their whole log on every open, ignoring the since-time, the way an
/// API server that only honors second granularity might.
#[derive(Default)]
pub struct ScriptedCluster {
    pods: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, PodLog>>,
    fail_listing: AtomicBool,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: PodInfo) {
        let name = pod.name.clone();
        self.logs.lock().unwrap().entry(name.clone()).or_default().info = Some(pod);
        self.pods.lock().unwrap().push(name);
    }

    /// Stops listing `pod`. Its log is kept so it can be listed again.
    pub fn remove_pod(&self, pod: &str) {
        self.pods.lock().unwrap().retain(|name| name != pod);
    }

    pub fn push_line(&self, pod: &str, line: String) {
        self.logs
            .lock()
            .unwrap()
            .entry(pod.to_string())
            .or_default()
            .lines
            .push(line);
    }

    pub fn break_stream_after(&self, pod: &str, lines: usize) {
        self.logs
            .lock()
            .unwrap()
            .entry(pod.to_string())
            .or_default()
            .break_after = Some(lines);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// The since-time passed to every stream opened for `pod`, in order.
    pub fn since_calls(&self, pod: &str) -> Vec<Option<DateTime<Utc>>> {
        self.logs
            .lock()
            .unwrap()
            .get(pod)
            .map(|log| log.since_calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Cluster for ScriptedCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ClusterError::Config(format!(
                "namespace {namespace} unavailable"
            )));
        }
        let names = self.pods.lock().unwrap().clone();
        let logs = self.logs.lock().unwrap();
        Ok(names
            .iter()
            .filter_map(|name| logs.get(name).and_then(|log| log.info.clone()))
            .collect())
    }

    async fn open_log_stream(
        &self,
        _namespace: &str,
        pod: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError> {
        let mut logs = self.logs.lock().unwrap();
        let log = logs
            .get_mut(pod)
            .ok_or_else(|| ClusterError::StreamAborted {
                pod: pod.to_string(),
            })?;
        log.since_calls.push(since);

        let mut lines: Vec<io::Result<String>> = log.lines.iter().cloned().map(Ok).collect();
        if let Some(n) = log.break_after.take() {
            lines.truncate(n);
            lines.push(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(LogStream::from_lines(lines))
    }
}

/// [`MemoryStore`] whose client-log appends time out while `fail_appends` is set.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_appends: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn ensure_training(&self, fl_training_id: &str) -> Result<Training, StoreError> {
        self.inner.ensure_training(fl_training_id).await
    }

    async fn ensure_client(
        &self,
        key: &ClientKey,
        seed: ClientSeed<'_>,
    ) -> Result<TrainingClient, StoreError> {
        self.inner.ensure_client(key, seed).await
    }

    async fn ensure_server(
        &self,
        fl_training_id: &str,
        node_name: &str,
        pod_name: &str,
    ) -> Result<TrainingServer, StoreError> {
        self.inner
            .ensure_server(fl_training_id, node_name, pod_name)
            .await
    }

    async fn merge_current_server_round(
        &self,
        fl_training_id: &str,
        round: i32,
    ) -> Result<(), StoreError> {
        self.inner
            .merge_current_server_round(fl_training_id, round)
            .await
    }

    async fn set_total_server_round(
        &self,
        fl_training_id: &str,
        total: i32,
    ) -> Result<(), StoreError> {
        self.inner.set_total_server_round(fl_training_id, total).await
    }

    async fn update_client_state(&self, key: &ClientKey, state: &str) -> Result<(), StoreError> {
        self.inner.update_client_state(key, state).await
    }

    async fn advance_client_watermark(
        &self,
        key: &ClientKey,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.advance_client_watermark(key, ts).await
    }

    async fn advance_server_watermark(
        &self,
        fl_training_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.advance_server_watermark(fl_training_id, ts).await
    }

    async fn append_client_log(
        &self,
        client_id: Uuid,
        text: &str,
        client_output_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(Duration::from_secs(5)));
        }
        self.inner
            .append_client_log(client_id, text, client_output_at)
            .await
    }

    async fn upsert_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
        config: &GraphConfig,
    ) -> Result<TrainingGraph, StoreError> {
        self.inner
            .upsert_training_graph(client_id, server_round, config)
            .await
    }

    async fn ensure_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
    ) -> Result<TrainingGraph, StoreError> {
        self.inner.ensure_training_graph(client_id, server_round).await
    }

    async fn append_training_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTrainingPoint,
    ) -> Result<bool, StoreError> {
        self.inner.append_training_graph_point(graph_id, point).await
    }

    async fn ensure_testing_graph(&self, client_id: Uuid) -> Result<TestingGraph, StoreError> {
        self.inner.ensure_testing_graph(client_id).await
    }

    async fn append_testing_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTestingPoint,
    ) -> Result<bool, StoreError> {
        self.inner.append_testing_graph_point(graph_id, point).await
    }

    async fn upsert_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner
            .upsert_model_weights(fl_training_id, server_round, payload)
            .await
    }

    async fn get_training(&self, fl_training_id: &str) -> Result<Option<Training>, StoreError> {
        self.inner.get_training(fl_training_id).await
    }

    async fn list_trainings(&self) -> Result<Vec<Training>, StoreError> {
        self.inner.list_trainings().await
    }

    async fn get_client(&self, key: &ClientKey) -> Result<Option<TrainingClient>, StoreError> {
        self.inner.get_client(key).await
    }

    async fn list_clients(&self, fl_training_id: &str) -> Result<Vec<TrainingClient>, StoreError> {
        self.inner.list_clients(fl_training_id).await
    }

    async fn get_server(
        &self,
        fl_training_id: &str,
    ) -> Result<Option<TrainingServer>, StoreError> {
        self.inner.get_server(fl_training_id).await
    }

    async fn client_logs(&self, client_id: Uuid) -> Result<Vec<ClientLog>, StoreError> {
        self.inner.client_logs(client_id).await
    }

    async fn training_graphs(&self, client_id: Uuid) -> Result<Vec<TrainingGraph>, StoreError> {
        self.inner.training_graphs(client_id).await
    }

    async fn training_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TrainingGraphPoint>, StoreError> {
        self.inner.training_graph_points(graph_id).await
    }

    async fn testing_graphs(&self, client_id: Uuid) -> Result<Vec<TestingGraph>, StoreError> {
        self.inner.testing_graphs(client_id).await
    }

    async fn testing_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TestingGraphPoint>, StoreError> {
        self.inner.testing_graph_points(graph_id).await
    }

    async fn get_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
    ) -> Result<Option<ModelWeights>, StoreError> {
        self.inner
            .get_model_weights(fl_training_id, server_round)
            .await
    }
}
