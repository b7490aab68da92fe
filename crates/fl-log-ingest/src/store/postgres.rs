// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL [`Store`] backed by a `sqlx` pool.
//!
//! `TIMESTAMPTZ` keeps microseconds. Line timestamps are truncated to that precision when parsed,
//! so values read back compare equal to the ones written.

use super::models::*;
use super::Store;
use crate::config::IngestConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const TRAINING_COLUMNS: &str =
    "id, fl_training_id, current_server_round, total_server_round, created_at";
const CLIENT_COLUMNS: &str =
    "id, fl_training_id, partition_id, node_name, pod_name, state, last_log_read, created_at";
const SERVER_COLUMNS: &str = "id, fl_training_id, node_name, pod_name, last_log_read, created_at";
const TRAINING_GRAPH_COLUMNS: &str =
    "id, client_id, server_round, optimizer, learning_rate, num_epochs, batch_size, created_at";
const TRAINING_POINT_COLUMNS: &str = "id, graph_id, current_epoch, trained_batch, train_loss, \
     val_loss, accuracy, epoch_elapsed_time, logged_at, created_at";
const TESTING_POINT_COLUMNS: &str = "id, graph_id, server_round, criterion, batch_size, \
     test_loss, accuracy, logged_at, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgStore {
    /// Connects a pool sized from `config`. Fails if the database cannot be reached.
    pub async fn connect(config: &IngestConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .idle_timeout(config.max_idle_time)
            .acquire_timeout(config.query_timeout)
            .connect(&config.database_url)
            .await?;
        debug!(
            max_connections = config.max_open_conns,
            idle_timeout = ?config.max_idle_time,
            "connected to postgres"
        );
        Ok(Self::from_pool(pool, config.query_timeout))
    }

    pub fn from_pool(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn bounded<T, F>(&self, query: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(StoreError::Timeout(self.query_timeout)),
        }
    }
}

/// Maps constraint violations to their store meaning.
fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_foreign_key_violation() {
            return StoreError::NotFound(db.message().to_string());
        }
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_training(&self, fl_training_id: &str) -> Result<Training, StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO fl_trainings (fl_training_id) VALUES ($1) \
                 ON CONFLICT (fl_training_id) DO NOTHING",
            )
            .bind(fl_training_id)
            .execute(&self.pool),
        )
        .await?;

        self.get_training(fl_training_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("training {fl_training_id}")))
    }

    async fn ensure_client(
        &self,
        key: &ClientKey,
        seed: ClientSeed<'_>,
    ) -> Result<TrainingClient, StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO training_clients \
                 (fl_training_id, partition_id, node_name, pod_name, state) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (fl_training_id, partition_id) DO NOTHING",
            )
            .bind(&key.fl_training_id)
            .bind(key.partition_id)
            .bind(seed.node_name)
            .bind(seed.pod_name)
            .bind(seed.state)
            .execute(&self.pool),
        )
        .await?;

        self.get_client(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("client {key}")))
    }

    async fn ensure_server(
        &self,
        fl_training_id: &str,
        node_name: &str,
        pod_name: &str,
    ) -> Result<TrainingServer, StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO training_servers (fl_training_id, node_name, pod_name) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (fl_training_id) DO NOTHING",
            )
            .bind(fl_training_id)
            .bind(node_name)
            .bind(pod_name)
            .execute(&self.pool),
        )
        .await?;

        self.get_server(fl_training_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("server {fl_training_id}")))
    }

    async fn merge_current_server_round(
        &self,
        fl_training_id: &str,
        round: i32,
    ) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query(
                "UPDATE fl_trainings \
                 SET current_server_round = GREATEST(current_server_round, $2) \
                 WHERE fl_training_id = $1",
            )
            .bind(fl_training_id)
            .bind(round)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn set_total_server_round(
        &self,
        fl_training_id: &str,
        total: i32,
    ) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query("UPDATE fl_trainings SET total_server_round = $2 WHERE fl_training_id = $1")
                .bind(fl_training_id)
                .bind(total)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update_client_state(&self, key: &ClientKey, state: &str) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query(
                "UPDATE training_clients SET state = $3 \
                 WHERE fl_training_id = $1 AND partition_id = $2",
            )
            .bind(&key.fl_training_id)
            .bind(key.partition_id)
            .bind(state)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn advance_client_watermark(
        &self,
        key: &ClientKey,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    "UPDATE training_clients SET last_log_read = $3 \
                     WHERE fl_training_id = $1 AND partition_id = $2 \
                     AND (last_log_read IS NULL OR last_log_read < $3)",
                )
                .bind(&key.fl_training_id)
                .bind(key.partition_id)
                .bind(ts)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_server_watermark(
        &self,
        fl_training_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    "UPDATE training_servers SET last_log_read = $2 \
                     WHERE fl_training_id = $1 \
                     AND (last_log_read IS NULL OR last_log_read < $2)",
                )
                .bind(fl_training_id)
                .bind(ts)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_client_log(
        &self,
        client_id: Uuid,
        text: &str,
        client_output_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    "INSERT INTO client_logs (client_id, text, client_output_at) \
                     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                )
                .bind(client_id)
                .bind(text)
                .bind(client_output_at)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
        config: &GraphConfig,
    ) -> Result<TrainingGraph, StoreError> {
        let sql = format!(
            "INSERT INTO training_graphs \
             (client_id, server_round, optimizer, learning_rate, num_epochs, batch_size) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (client_id, server_round) DO UPDATE SET \
             optimizer = EXCLUDED.optimizer, learning_rate = EXCLUDED.learning_rate, \
             num_epochs = EXCLUDED.num_epochs, batch_size = EXCLUDED.batch_size \
             RETURNING {TRAINING_GRAPH_COLUMNS}"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingGraph>(&sql)
                .bind(client_id)
                .bind(server_round)
                .bind(&config.optimizer)
                .bind(config.learning_rate)
                .bind(config.num_epochs)
                .bind(config.batch_size)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn ensure_training_graph(
        &self,
        client_id: Uuid,
        server_round: i32,
    ) -> Result<TrainingGraph, StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO training_graphs (client_id, server_round) VALUES ($1, $2) \
                 ON CONFLICT (client_id, server_round) DO NOTHING",
            )
            .bind(client_id)
            .bind(server_round)
            .execute(&self.pool),
        )
        .await?;

        let sql = format!(
            "SELECT {TRAINING_GRAPH_COLUMNS} FROM training_graphs \
             WHERE client_id = $1 AND server_round = $2"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingGraph>(&sql)
                .bind(client_id)
                .bind(server_round)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn append_training_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTrainingPoint,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    "INSERT INTO training_graph_points \
                     (graph_id, current_epoch, trained_batch, train_loss, val_loss, accuracy, \
                      epoch_elapsed_time, logged_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (graph_id, logged_at, current_epoch) DO NOTHING",
                )
                .bind(graph_id)
                .bind(point.current_epoch)
                .bind(point.trained_batch)
                .bind(point.train_loss)
                .bind(point.val_loss)
                .bind(point.accuracy)
                .bind(point.epoch_elapsed_time)
                .bind(point.logged_at)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ensure_testing_graph(&self, client_id: Uuid) -> Result<TestingGraph, StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO testing_graphs (client_id) VALUES ($1) \
                 ON CONFLICT (client_id) DO NOTHING",
            )
            .bind(client_id)
            .execute(&self.pool),
        )
        .await?;

        self.bounded(
            sqlx::query_as::<_, TestingGraph>(
                "SELECT id, client_id, created_at FROM testing_graphs WHERE client_id = $1",
            )
            .bind(client_id)
            .fetch_one(&self.pool),
        )
        .await
    }

    async fn append_testing_graph_point(
        &self,
        graph_id: Uuid,
        point: &NewTestingPoint,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    "INSERT INTO testing_graph_points \
                     (graph_id, server_round, criterion, batch_size, test_loss, accuracy, logged_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (graph_id, logged_at, server_round, criterion) DO NOTHING",
                )
                .bind(graph_id)
                .bind(point.server_round)
                .bind(&point.criterion)
                .bind(point.batch_size)
                .bind(point.test_loss)
                .bind(point.accuracy)
                .bind(point.logged_at)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query(
                "INSERT INTO fl_model_weights (fl_training_id, server_round, payload) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (fl_training_id, server_round) \
                 DO UPDATE SET payload = EXCLUDED.payload, updated_at = NOW()",
            )
            .bind(fl_training_id)
            .bind(server_round)
            .bind(Json(payload))
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn get_training(&self, fl_training_id: &str) -> Result<Option<Training>, StoreError> {
        let sql = format!("SELECT {TRAINING_COLUMNS} FROM fl_trainings WHERE fl_training_id = $1");
        self.bounded(
            sqlx::query_as::<_, Training>(&sql)
                .bind(fl_training_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn list_trainings(&self) -> Result<Vec<Training>, StoreError> {
        let sql = format!("SELECT {TRAINING_COLUMNS} FROM fl_trainings ORDER BY created_at ASC");
        self.bounded(sqlx::query_as::<_, Training>(&sql).fetch_all(&self.pool))
            .await
    }

    async fn get_client(&self, key: &ClientKey) -> Result<Option<TrainingClient>, StoreError> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM training_clients \
             WHERE fl_training_id = $1 AND partition_id = $2"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingClient>(&sql)
                .bind(&key.fl_training_id)
                .bind(key.partition_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn list_clients(&self, fl_training_id: &str) -> Result<Vec<TrainingClient>, StoreError> {
        let sql = format!(
            "SELECT {CLIENT_COLUMNS} FROM training_clients \
             WHERE fl_training_id = $1 ORDER BY partition_id ASC"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingClient>(&sql)
                .bind(fl_training_id)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn get_server(
        &self,
        fl_training_id: &str,
    ) -> Result<Option<TrainingServer>, StoreError> {
        let sql =
            format!("SELECT {SERVER_COLUMNS} FROM training_servers WHERE fl_training_id = $1");
        self.bounded(
            sqlx::query_as::<_, TrainingServer>(&sql)
                .bind(fl_training_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn client_logs(&self, client_id: Uuid) -> Result<Vec<ClientLog>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, ClientLog>(
                "SELECT id, client_id, text, client_output_at, created_at FROM client_logs \
                 WHERE client_id = $1 ORDER BY client_output_at ASC",
            )
            .bind(client_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn training_graphs(&self, client_id: Uuid) -> Result<Vec<TrainingGraph>, StoreError> {
        let sql = format!(
            "SELECT {TRAINING_GRAPH_COLUMNS} FROM training_graphs \
             WHERE client_id = $1 ORDER BY server_round ASC"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingGraph>(&sql)
                .bind(client_id)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn training_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TrainingGraphPoint>, StoreError> {
        let sql = format!(
            "SELECT {TRAINING_POINT_COLUMNS} FROM training_graph_points \
             WHERE graph_id = $1 ORDER BY current_epoch ASC, created_at ASC"
        );
        self.bounded(
            sqlx::query_as::<_, TrainingGraphPoint>(&sql)
                .bind(graph_id)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn testing_graphs(&self, client_id: Uuid) -> Result<Vec<TestingGraph>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, TestingGraph>(
                "SELECT id, client_id, created_at FROM testing_graphs WHERE client_id = $1",
            )
            .bind(client_id)
            .fetch_all(&self.pool),
        )
        .await
    }

    async fn testing_graph_points(
        &self,
        graph_id: Uuid,
    ) -> Result<Vec<TestingGraphPoint>, StoreError> {
        let sql = format!(
            "SELECT {TESTING_POINT_COLUMNS} FROM testing_graph_points \
             WHERE graph_id = $1 ORDER BY server_round ASC, created_at ASC"
        );
        self.bounded(
            sqlx::query_as::<_, TestingGraphPoint>(&sql)
                .bind(graph_id)
                .fetch_all(&self.pool),
        )
        .await
    }

    async fn get_model_weights(
        &self,
        fl_training_id: &str,
        server_round: i32,
    ) -> Result<Option<ModelWeights>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, ModelWeights>(
                "SELECT fl_training_id, server_round, payload, updated_at FROM fl_model_weights \
                 WHERE fl_training_id = $1 AND server_round = $2",
            )
            .bind(fl_training_id)
            .bind(server_round)
            .fetch_optional(&self.pool),
        )
        .await
    }
}
