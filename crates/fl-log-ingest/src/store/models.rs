// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Training {
    pub id: Uuid,
    pub fl_training_id: String,
    pub current_server_round: i32,
    pub total_server_round: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TrainingClient {
    pub id: Uuid,
    pub fl_training_id: String,
    pub partition_id: i32,
    pub node_name: String,
    pub pod_name: String,
    pub state: String,
    /// `None` until the first event for this client has been applied.
    pub last_log_read: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TrainingServer {
    pub id: Uuid,
    pub fl_training_id: String,
    pub node_name: String,
    pub pod_name: String,
    pub last_log_read: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ClientLog {
    pub id: Uuid,
    pub client_id: Uuid,
    pub text: String,
    pub client_output_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TrainingGraph {
    pub id: Uuid,
    pub client_id: Uuid,
    pub server_round: i32,
    pub optimizer: String,
    pub learning_rate: f64,
    pub num_epochs: i32,
    pub batch_size: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TrainingGraphPoint {
    pub id: Uuid,
    pub graph_id: Uuid,
    pub current_epoch: i32,
    pub trained_batch: i32,
    pub train_loss: f64,
    pub val_loss: f64,
    pub accuracy: f64,
    pub epoch_elapsed_time: f64,
    /// Timestamp of the log line the point came from. Part of the point's natural key.
    pub logged_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TestingGraph {
    pub id: Uuid,
    pub client_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TestingGraphPoint {
    pub id: Uuid,
    pub graph_id: Uuid,
    pub server_round: i32,
    pub criterion: String,
    pub batch_size: i32,
    pub test_loss: f64,
    pub accuracy: f64,
    pub logged_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ModelWeights {
    pub fl_training_id: String,
    pub server_round: i32,
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Identity of a training client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    pub fl_training_id: String,
    pub partition_id: i32,
}

impl ClientKey {
    pub fn new(fl_training_id: impl Into<String>, partition_id: i32) -> Self {
        Self {
            fl_training_id: fl_training_id.into(),
            partition_id,
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.fl_training_id, self.partition_id)
    }
}

/// Values used only when a client row is created.
#[derive(Debug, Clone, Copy)]
pub struct ClientSeed<'a> {
    pub node_name: &'a str,
    pub pod_name: &'a str,
    pub state: &'a str,
}

/// Hyperparameters of a training graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphConfig {
    pub optimizer: String,
    pub learning_rate: f64,
    pub num_epochs: i32,
    pub batch_size: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTrainingPoint {
    pub current_epoch: i32,
    pub trained_batch: i32,
    pub train_loss: f64,
    pub val_loss: f64,
    pub accuracy: f64,
    pub epoch_elapsed_time: f64,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTestingPoint {
    pub server_round: i32,
    pub criterion: String,
    pub batch_size: i32,
    pub test_loss: f64,
    pub accuracy: f64,
    pub logged_at: DateTime<Utc>,
}
