// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The storage collaborator used by the persistence adapter.
//!
//! Every write is atomic at row granularity and safe to repeat:
//! - `ensure_*` calls are insert-if-absent followed by a read-back, so concurrent callers
//!   converge on one row.
//! - `append_*` calls deduplicate on the fact's natural key and report whether a row was added.
//! - Counters and watermarks only move forward, compared against the stored value at write time.

pub mod memory;
pub mod models;
pub mod postgres;

use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::{
    ClientKey, ClientLog, ClientSeed, GraphConfig, ModelWeights, NewTestingPoint,
    NewTrainingPoint, TestingGraph, TestingGraphPoint, Training, TrainingClient, TrainingGraph,
    TrainingGraphPoint, TrainingServer,
};
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the training, creating it with zeroed counters if absent.
    async fn ensure_training(&self, fl_training_id: &str) -> Result<Training, StoreError>;

    /// Returns the client, creating it from `seed` if absent. The training must exist.
    async fn ensure_client(
        &self,
        key: &ClientKey,
        seed: ClientSeed<'_>,
    ) -> Result<TrainingClient, StoreError>;

    /// Returns the training's server record, creating it if absent. The training must exist.
    async fn ensure_server(
        &self,
        fl_training_id: &str,
        node_name: &str,
        pod_name: &str,
    ) -> Result<TrainingServer, StoreError>;

    /// Sets `current_server_round` to `max(current, round)`.
    async fn merge_current_server_round(
        &self,
        fl_training_id: &str,
        round: i32,
    ) -> Result<(), StoreError>;

    /// Overwrites `total_server_round`.
    async fn set_total_server_round(
        &self,
        fl_training_id: &str,
        total: i32,
    ) -> Result<(), StoreError>;

    async fn update_client_state(&self, key: &ClientKey, state: &str) -> Result<(), StoreError>;

    /// Moves the client's `last_log_read` to `ts` if `ts` is later. Returns whether it moved.
    async fn advance_client_watermark(
        &self,
        key: &ClientKey,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Moves the server's `last_log_read` to `ts` if `ts` is later. Returns whether it moved.
    async fn advance_server_watermark(
        &self,
        fl_training_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Appends a log line, keyed by (client, timestamp, text).
    async fn append_client_log(
        &self,
        client_id: Uuid,
        text: &str,
        client_output_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Creates the (client, round) training graph or replaces its hyperparameters.
    async fn upsert_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
        config: &GraphConfig,
    ) -> Result<TrainingGraph, StoreError>;

    /// Returns the (client, round) training graph, creating an unconfigured one if absent.
    async fn ensure_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
    ) -> Result<TrainingGraph, StoreError>;

    /// Appends an epoch point, keyed by (graph, source timestamp, epoch).
    async fn append_training_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTrainingPoint,
    ) -> Result<bool, StoreError>;

    /// Returns the client's single testing graph, creating it if absent.
    async fn ensure_testing_graph(&self, client_id: Uuid) -> Result<TestingGraph, StoreError>;

    /// Appends a testing point, keyed by (graph, source timestamp, round, criterion).
    async fn append_testing_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTestingPoint,
    ) -> Result<bool, StoreError>;

    /// Stores the weights document for (training, round). Last write wins.
    async fn upsert_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_training(&self, fl_training_id: &str) -> Result<Option<Training>, StoreError>;

    async fn list_trainings(&self) -> Result<Vec<Training>, StoreError>;

    async fn get_client(&self, key: &ClientKey) -> Result<Option<TrainingClient>, StoreError>;

    async fn list_clients(&self, fl_training_id: &str) -> Result<Vec<TrainingClient>, StoreError>;

    async fn get_server(&self, fl_training_id: &str)
        -> Result<Option<TrainingServer>, StoreError>;

    /// Log lines of a client, oldest client timestamp first.
    async fn client_logs(&self, client_id: Uuid) -> Result<Vec<ClientLog>, StoreError>;

    /// Training graphs of a client, by round.
    async fn training_graphs(&self, client_id: Uuid) -> Result<Vec<TrainingGraph>, StoreError>;

    /// Points of a training graph, by epoch then insertion.
    async fn training_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TrainingGraphPoint>, StoreError>;

    async fn testing_graphs(&self, client_id: Uuid) -> Result<Vec<TestingGraph>, StoreError>;

    /// Points of a testing graph, by round then insertion.
    async fn testing_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TestingGraphPoint>, StoreError>;

    async fn get_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
    ) -> Result<Option<ModelWeights>, StoreError>;
}
