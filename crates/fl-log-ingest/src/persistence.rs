// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watermark-gated application of routed events to the store.
//!
//! Every handler follows the same steps:
//! 1. ensure the training exists
//! 2. ensure the client or server exists, seeding a creation-time default
//! 3. drop the event if its timestamp is not after the entity's `last_log_read`
//! 4. apply the event's effect
//! 5. advance `last_log_read` to the event's timestamp
//!
//! The store compares against the stored watermark when advancing, so a concurrent or repeated
//! advance never moves it backwards.

use crate::envelope::{
    AddOneEpochTrainingGraphPointPayload, AddOneServerRoundTestingGraphPointPayload,
    CreateFlTrainingPayload, CreateTestingGraphPayload, CreateTrainingGraphPayload, Envelope,
    ModelWeightsPayload, ReadlinePayload, SetCurrentServerRoundPayload, SetStatePayload,
};
use crate::errors::{DecodeError, IngestError};
use crate::router::{self, Event};
use crate::store::{
    ClientKey, ClientSeed, GraphConfig, NewTestingPoint, NewTrainingPoint, Store, TrainingClient,
    TrainingServer,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Initial client state when a client is first seen through a log line or a round update.
pub const STATE_INIT: &str = "init";
/// Initial client state when a client is first seen through a training-graph event.
pub const STATE_TRAIN: &str = "train";
/// Initial client state when a client is first seen through a testing-graph event.
pub const STATE_TEST: &str = "test";

/// What happened to one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The effect was applied and the watermark advanced.
    Applied,
    /// The event was at or behind the entity's watermark.
    Skipped,
    /// Unknown component or event tag.
    Ignored,
}

/// Returns true when `ts` is not after a set watermark. An unset watermark never gates.
pub fn is_stale(watermark: Option<DateTime<Utc>>, ts: DateTime<Utc>) -> bool {
    matches!(watermark, Some(last) if ts <= last)
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Routes and applies one envelope.
    pub async fn ingest(&self, env: &Envelope) -> Result<Outcome, IngestError> {
        match router::route(env)? {
            Some(event) => self.apply(env, event).await,
            None => Ok(Outcome::Ignored),
        }
    }

    pub async fn apply(&self, env: &Envelope, event: Event) -> Result<Outcome, IngestError> {
        match event {
            Event::Readline(p) => self.readline(env, p).await,
            Event::SetState(p) => self.set_state(env, p).await,
            Event::SetCurrentServerRound(p) => self.set_current_server_round(env, p).await,
            Event::CreateTrainingGraph(p) => self.create_training_graph(env, p).await,
            Event::AddOneEpochTrainingGraphPoint(p) => self.add_training_point(env, p).await,
            Event::CreateTestingGraph(p) => self.create_testing_graph(env, p).await,
            Event::AddOneServerRoundTestingGraphPoint(p) => self.add_testing_point(env, p).await,
            Event::CreateFlTraining(p) => self.create_fl_training(env, p).await,
            Event::ModelWeights(p) => self.model_weights(env, p).await,
        }
    }

    /// Ensures the training and the client, then applies the watermark gate.
    /// Returns `None` when the event must be dropped.
    async fn admit_client(
        &self,
        env: &Envelope,
        key: &ClientKey,
        seed_state: &str,
    ) -> Result<Option<TrainingClient>, IngestError> {
        self.store.ensure_training(&key.fl_training_id).await?;
        let client = self
            .store
            .ensure_client(
                key,
                ClientSeed {
                    node_name: &env.node_name,
                    pod_name: &env.pod_name,
                    state: seed_state,
                },
            )
            .await?;

        if is_stale(client.last_log_read, env.timestamp) {
            debug!(
                event = %env.event,
                client_id = %client.id,
                fl_training_id = %key.fl_training_id,
                partition_id = key.partition_id,
                ts = %env.timestamp,
                last_log_read = ?client.last_log_read,
                "skip client event older than last_log_read"
            );
            return Ok(None);
        }
        Ok(Some(client))
    }

    async fn commit_client(&self, env: &Envelope, key: &ClientKey) -> Result<Outcome, IngestError> {
        self.store
            .advance_client_watermark(key, env.timestamp)
            .await?;
        Ok(Outcome::Applied)
    }

    async fn admit_server(
        &self,
        env: &Envelope,
        fl_training_id: &str,
    ) -> Result<Option<TrainingServer>, IngestError> {
        self.store.ensure_training(fl_training_id).await?;
        let server = self
            .store
            .ensure_server(fl_training_id, &env.node_name, &env.pod_name)
            .await?;

        if is_stale(server.last_log_read, env.timestamp) {
            debug!(
                event = %env.event,
                fl_training_id,
                ts = %env.timestamp,
                last_log_read = ?server.last_log_read,
                "skip server event older than last_log_read"
            );
            return Ok(None);
        }
        Ok(Some(server))
    }

    async fn commit_server(
        &self,
        env: &Envelope,
        fl_training_id: &str,
    ) -> Result<Outcome, IngestError> {
        self.store
            .advance_server_watermark(fl_training_id, env.timestamp)
            .await?;
        Ok(Outcome::Applied)
    }

    async fn readline(&self, env: &Envelope, p: ReadlinePayload) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        let Some(client) = self.admit_client(env, &key, STATE_INIT).await? else {
            return Ok(Outcome::Skipped);
        };

        let inserted = self
            .store
            .append_client_log(client.id, &p.text, env.timestamp)
            .await?;
        if !inserted {
            debug!(client_id = %client.id, ts = %env.timestamp, "client log already stored");
        }

        self.commit_client(env, &key).await
    }

    async fn set_state(&self, env: &Envelope, p: SetStatePayload) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        if self.admit_client(env, &key, &p.state).await?.is_none() {
            return Ok(Outcome::Skipped);
        }

        self.store.update_client_state(&key, &p.state).await?;
        info!(
            fl_training_id = %key.fl_training_id,
            partition_id = key.partition_id,
            state = %p.state,
            "client state updated"
        );

        self.commit_client(env, &key).await
    }

    async fn set_current_server_round(
        &self,
        env: &Envelope,
        p: SetCurrentServerRoundPayload,
    ) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        if self.admit_client(env, &key, STATE_INIT).await?.is_none() {
            return Ok(Outcome::Skipped);
        }

        self.store
            .merge_current_server_round(&key.fl_training_id, p.server_round)
            .await?;
        info!(
            fl_training_id = %key.fl_training_id,
            server_round = p.server_round,
            "current server round updated"
        );

        self.commit_client(env, &key).await
    }

    async fn create_training_graph(
        &self,
        env: &Envelope,
        p: CreateTrainingGraphPayload,
    ) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        let Some(client) = self.admit_client(env, &key, STATE_TRAIN).await? else {
            return Ok(Outcome::Skipped);
        };

        let config = GraphConfig {
            optimizer: p.optimizer,
            learning_rate: p.learning_rate,
            num_epochs: p.num_epochs,
            batch_size: p.batch_size,
        };
        self.store
            .upsert_training_graph(client.id, p.server_round, &config)
            .await?;

        self.commit_client(env, &key).await
    }

    async fn add_training_point(
        &self,
        env: &Envelope,
        p: AddOneEpochTrainingGraphPointPayload,
    ) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        let Some(client) = self.admit_client(env, &key, STATE_TRAIN).await? else {
            return Ok(Outcome::Skipped);
        };

        let graph = self
            .store
            .ensure_training_graph(client.id, p.server_round)
            .await?;
        let point = NewTrainingPoint {
            current_epoch: p.current_epoch,
            trained_batch: p.trained_batch,
            train_loss: p.train_loss,
            val_loss: p.val_loss,
            accuracy: p.accuracy,
            epoch_elapsed_time: p.epoch_elapsed_time,
            logged_at: env.timestamp,
        };
        if !self
            .store
            .append_training_graph_point(graph.id, &point)
            .await?
        {
            debug!(graph_id = %graph.id, epoch = p.current_epoch, "training point already stored");
        }

        self.commit_client(env, &key).await
    }

    async fn create_testing_graph(
        &self,
        env: &Envelope,
        p: CreateTestingGraphPayload,
    ) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        let Some(client) = self.admit_client(env, &key, STATE_TEST).await? else {
            return Ok(Outcome::Skipped);
        };

        self.store.ensure_testing_graph(client.id).await?;

        self.commit_client(env, &key).await
    }

    async fn add_testing_point(
        &self,
        env: &Envelope,
        p: AddOneServerRoundTestingGraphPointPayload,
    ) -> Result<Outcome, IngestError> {
        let key = ClientKey::new(p.fl_training_id, p.partition_id);
        let Some(client) = self.admit_client(env, &key, STATE_TEST).await? else {
            return Ok(Outcome::Skipped);
        };

        let graph = self.store.ensure_testing_graph(client.id).await?;
        let point = NewTestingPoint {
            server_round: p.server_round,
            criterion: p.criterion,
            batch_size: p.batch_size,
            test_loss: p.test_loss,
            accuracy: p.accuracy,
            logged_at: env.timestamp,
        };
        if !self
            .store
            .append_testing_graph_point(graph.id, &point)
            .await?
        {
            debug!(graph_id = %graph.id, round = point.server_round, "testing point already stored");
        }

        self.commit_client(env, &key).await
    }

    async fn create_fl_training(
        &self,
        env: &Envelope,
        p: CreateFlTrainingPayload,
    ) -> Result<Outcome, IngestError> {
        if self.admit_server(env, &p.fl_training_id).await?.is_none() {
            return Ok(Outcome::Skipped);
        }

        info!(
            fl_training_id = %p.fl_training_id,
            num_rounds = p.num_rounds,
            "create or update FL training from server"
        );
        self.store
            .set_total_server_round(&p.fl_training_id, p.num_rounds)
            .await?;

        self.commit_server(env, &p.fl_training_id).await
    }

    async fn model_weights(
        &self,
        env: &Envelope,
        p: ModelWeightsPayload,
    ) -> Result<Outcome, IngestError> {
        // The whole payload document is stored, not just the layers.
        let document: serde_json::Value =
            serde_json::from_str(env.raw_payload()).map_err(|source| DecodeError::Payload {
                event: "MODEL_WEIGHTS",
                source,
            })?;

        if self.admit_server(env, &p.fl_training_id).await?.is_none() {
            return Ok(Outcome::Skipped);
        }

        self.store
            .upsert_model_weights(&p.fl_training_id, p.server_round, &document)
            .await?;
        info!(
            fl_training_id = %p.fl_training_id,
            server_round = p.server_round,
            "stored MODEL_WEIGHTS payload"
        );

        self.commit_server(env, &p.fl_training_id).await
    }
}
