// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process [`Store`] with the same keys, merges and dedup rules as the SQL schema.

use super::models::*;
use super::Store;
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Every table of the store. Cloned out by [`MemoryStore::snapshot`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tables {
    pub trainings: BTreeMap<String, Training>,
    pub clients: BTreeMap<ClientKey, TrainingClient>,
    pub servers: BTreeMap<String, TrainingServer>,
    pub client_logs: Vec<ClientLog>,
    pub training_graphs: Vec<TrainingGraph>,
    pub training_graph_points: Vec<TrainingGraphPoint>,
    pub testing_graphs: Vec<TestingGraph>,
    pub testing_graph_points: Vec<TestingGraphPoint>,
    pub model_weights: BTreeMap<(String, i32), ModelWeights>,
}

impl Tables {
    fn client_exists(&self, client_id: Uuid) -> bool {
        self.clients.values().any(|c| c.id == client_id)
    }

    fn training_mut(&mut self, fl_training_id: &str) -> Result<&mut Training, StoreError> {
        self.trainings
            .get_mut(fl_training_id)
            .ok_or_else(|| StoreError::NotFound(format!("training {fl_training_id}")))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }
}

fn advance(watermark: &mut Option<DateTime<Utc>>, ts: DateTime<Utc>) -> bool {
    match watermark {
        Some(current) if *current >= ts => false,
        _ => {
            *watermark = Some(ts);
            true
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_training(&self, fl_training_id: &str) -> Result<Training, StoreError> {
        let mut tables = self.tables.lock().await;
        let training = tables
            .trainings
            .entry(fl_training_id.to_string())
            .or_insert_with(|| Training {
                id: Uuid::new_v4(),
                fl_training_id: fl_training_id.to_string(),
                current_server_round: 0,
                total_server_round: 0,
                created_at: Utc::now(),
            });
        Ok(training.clone())
    }

    async fn ensure_client(
        &self,
        key: &ClientKey,
        seed: ClientSeed<'_>,
    ) -> Result<TrainingClient, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.trainings.contains_key(&key.fl_training_id) {
            return Err(StoreError::NotFound(format!(
                "training {}",
                key.fl_training_id
            )));
        }
        let client = tables
            .clients
            .entry(key.clone())
            .or_insert_with(|| TrainingClient {
                id: Uuid::new_v4(),
                fl_training_id: key.fl_training_id.clone(),
                partition_id: key.partition_id,
                node_name: seed.node_name.to_string(),
                pod_name: seed.pod_name.to_string(),
                state: seed.state.to_string(),
                last_log_read: None,
                created_at: Utc::now(),
            });
        Ok(client.clone())
    }

    async fn ensure_server(
        &self,
        fl_training_id: &str,
        node_name: &str,
        pod_name: &str,
    ) -> Result<TrainingServer, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.trainings.contains_key(fl_training_id) {
            return Err(StoreError::NotFound(format!("training {fl_training_id}")));
        }
        let server = tables
            .servers
            .entry(fl_training_id.to_string())
            .or_insert_with(|| TrainingServer {
                id: Uuid::new_v4(),
                fl_training_id: fl_training_id.to_string(),
                node_name: node_name.to_string(),
                pod_name: pod_name.to_string(),
                last_log_read: None,
                created_at: Utc::now(),
            });
        Ok(server.clone())
    }

    async fn merge_current_server_round(
        &self,
        fl_training_id: &str,
        round: i32,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let training = tables.training_mut(fl_training_id)?;
        training.current_server_round = training.current_server_round.max(round);
        Ok(())
    }

    async fn set_total_server_round(
        &self,
        fl_training_id: &str,
        total: i32,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.training_mut(fl_training_id)?.total_server_round = total;
        Ok(())
    }

    async fn update_client_state(&self, key: &ClientKey, state: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let client = tables
            .clients
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("client {key}")))?;
        client.state = state.to_string();
        Ok(())
    }

    async fn advance_client_watermark(
        &self,
        key: &ClientKey,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let client = tables
            .clients
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("client {key}")))?;
        Ok(advance(&mut client.last_log_read, ts))
    }

    async fn advance_server_watermark(
        &self,
        fl_training_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let server = tables
            .servers
            .get_mut(fl_training_id)
            .ok_or_else(|| StoreError::NotFound(format!("server {fl_training_id}")))?;
        Ok(advance(&mut server.last_log_read, ts))
    }

    async fn append_client_log(
        &self,
        client_id: Uuid,
        text: &str,
        client_output_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.client_exists(client_id) {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }
        let duplicate = tables.client_logs.iter().any(|log| {
            log.client_id == client_id
                && log.client_output_at == client_output_at
                && log.text == text
        });
        if duplicate {
            return Ok(false);
        }
        tables.client_logs.push(ClientLog {
            id: Uuid::new_v4(),
            client_id,
            text: text.to_string(),
            client_output_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn upsert_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
        config: &GraphConfig,
    ) -> Result<TrainingGraph, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.client_exists(client_id) {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }
        if let Some(graph) = tables
            .training_graphs
            .iter_mut()
            .find(|g| g.client_id == client_id && g.server_round == server_round)
        {
            graph.optimizer = config.optimizer.clone();
            graph.learning_rate = config.learning_rate;
            graph.num_epochs = config.num_epochs;
            graph.batch_size = config.batch_size;
            return Ok(graph.clone());
        }
        let graph = TrainingGraph {
            id: Uuid::new_v4(),
            client_id,
            server_round,
            optimizer: config.optimizer.clone(),
            learning_rate: config.learning_rate,
            num_epochs: config.num_epochs,
            batch_size: config.batch_size,
            created_at: Utc::now(),
        };
        tables.training_graphs.push(graph.clone());
        Ok(graph)
    }

    async fn ensure_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
    ) -> Result<TrainingGraph, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.client_exists(client_id) {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }
        if let Some(graph) = tables
            .training_graphs
            .iter()
            .find(|g| g.client_id == client_id && g.server_round == server_round)
        {
            return Ok(graph.clone());
        }
        let graph = TrainingGraph {
            id: Uuid::new_v4(),
            client_id,
            server_round,
            optimizer: String::new(),
            learning_rate: 0.0,
            num_epochs: 0,
            batch_size: 0,
            created_at: Utc::now(),
        };
        tables.training_graphs.push(graph.clone());
        Ok(graph)
    }

    async fn append_training_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTrainingPoint,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.training_graphs.iter().any(|g| g.id == graph_id) {
            return Err(StoreError::NotFound(format!("training graph {graph_id}")));
        }
        let duplicate = tables.training_graph_points.iter().any(|p| {
            p.graph_id == graph_id
                && p.logged_at == point.logged_at
                && p.current_epoch == point.current_epoch
        });
        if duplicate {
            return Ok(false);
        }
        tables.training_graph_points.push(TrainingGraphPoint {
            id: Uuid::new_v4(),
            graph_id,
            current_epoch: point.current_epoch,
            trained_batch: point.trained_batch,
            train_loss: point.train_loss,
            val_loss: point.val_loss,
            accuracy: point.accuracy,
            epoch_elapsed_time: point.epoch_elapsed_time,
            logged_at: point.logged_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn ensure_testing_graph(&self, client_id: Uuid) -> Result<TestingGraph, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.client_exists(client_id) {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        }
        if let Some(graph) = tables
            .testing_graphs
            .iter()
            .find(|g| g.client_id == client_id)
        {
            return Ok(graph.clone());
        }
        let graph = TestingGraph {
            id: Uuid::new_v4(),
            client_id,
            created_at: Utc::now(),
        };
        tables.testing_graphs.push(graph.clone());
        Ok(graph)
    }

    async fn append_testing_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTestingPoint,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.testing_graphs.iter().any(|g| g.id == graph_id) {
            return Err(StoreError::NotFound(format!("testing graph {graph_id}")));
        }
        let duplicate = tables.testing_graph_points.iter().any(|p| {
            p.graph_id == graph_id
                && p.logged_at == point.logged_at
                && p.server_round == point.server_round
                && p.criterion == point.criterion
        });
        if duplicate {
            return Ok(false);
        }
        tables.testing_graph_points.push(TestingGraphPoint {
            id: Uuid::new_v4(),
            graph_id,
            server_round: point.server_round,
            criterion: point.criterion.clone(),
            batch_size: point.batch_size,
            test_loss: point.test_loss,
            accuracy: point.accuracy,
            logged_at: point.logged_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn upsert_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.trainings.contains_key(fl_training_id) {
            return Err(StoreError::NotFound(format!("training {fl_training_id}")));
        }
        tables.model_weights.insert(
            (fl_training_id.to_string(), server_round),
            ModelWeights {
                fl_training_id: fl_training_id.to_string(),
                server_round,
                payload: sqlx::types::Json(payload.clone()),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_training(&self, fl_training_id: &str) -> Result<Option<Training>, StoreError> {
        Ok(self.tables.lock().await.trainings.get(fl_training_id).cloned())
    }

    async fn list_trainings(&self) -> Result<Vec<Training>, StoreError> {
        Ok(self.tables.lock().await.trainings.values().cloned().collect())
    }

    async fn get_client(&self, key: &ClientKey) -> Result<Option<TrainingClient>, StoreError> {
        Ok(self.tables.lock().await.clients.get(key).cloned())
    }

    async fn list_clients(&self, fl_training_id: &str) -> Result<Vec<TrainingClient>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clients
            .values()
            .filter(|c| c.fl_training_id == fl_training_id)
            .cloned()
            .collect())
    }

    async fn get_server(
        &self,
        fl_training_id: &str,
    ) -> Result<Option<TrainingServer>, StoreError> {
        Ok(self.tables.lock().await.servers.get(fl_training_id).cloned())
    }

    async fn client_logs(&self, client_id: Uuid) -> Result<Vec<ClientLog>, StoreError> {
        let tables = self.tables.lock().await;
        let mut logs: Vec<_> = tables
            .client_logs
            .iter()
            .filter(|log| log.client_id == client_id)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.client_output_at);
        Ok(logs)
    }

    async fn training_graphs(&self, client_id: Uuid) -> Result<Vec<TrainingGraph>, StoreError> {
        let tables = self.tables.lock().await;
        let mut graphs: Vec<_> = tables
            .training_graphs
            .iter()
            .filter(|g| g.client_id == client_id)
            .cloned()
            .collect();
        graphs.sort_by_key(|g| g.server_round);
        Ok(graphs)
    }

    async fn training_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TrainingGraphPoint>, StoreError> {
        let tables = self.tables.lock().await;
        let mut points: Vec<_> = tables
            .training_graph_points
            .iter()
            .filter(|p| p.graph_id == graph_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order within an epoch.
        points.sort_by_key(|p| p.current_epoch);
        Ok(points)
    }

    async fn testing_graphs(&self, client_id: Uuid) -> Result<Vec<TestingGraph>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .testing_graphs
            .iter()
            .filter(|g| g.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn testing_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TestingGraphPoint>, StoreError> {
        let tables = self.tables.lock().await;
        let mut points: Vec<_> = tables
            .testing_graph_points
            .iter()
            .filter(|p| p.graph_id == graph_id)
            .cloned()
            .collect();
        points.sort_by_key(|p| p.server_round);
        Ok(points)
    }

    async fn get_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
    ) -> Result<Option<ModelWeights>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .model_weights
            .get(&(fl_training_id.to_string(), server_round))
            .cloned())
    }
}
