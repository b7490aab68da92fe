// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope decoding and the typed payloads carried inside envelopes.
//!
//! A log message is `{"event": "<TAG>", "payload": {...}}`. The payload is kept as raw JSON until
//! the router has matched the tag, so only the handler that owns an event pays for decoding it.
//! Identity fields (`fl_training_id`, `partition_id`) are required; every other payload field
//! falls back to its zero value when absent.

use crate::cluster::PodInfo;
use crate::errors::DecodeError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::value::RawValue;

/// One structured event decoded from a pod log line, tagged with where and when it was seen.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: String,
    pub payload: Option<Box<RawValue>>,
    pub pod_name: String,
    pub node_name: String,
    /// The emitting pod's `component` label, empty when the pod has none.
    pub component: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

impl Envelope {
    /// Decodes `message` and attaches the pod metadata and the line timestamp.
    pub fn decode(
        message: &str,
        pod: &PodInfo,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, DecodeError> {
        let wire: WireEnvelope = serde_json::from_str(message).map_err(DecodeError::Envelope)?;
        Ok(Self {
            event: wire.event,
            payload: wire.payload,
            pod_name: pod.name.clone(),
            node_name: pod.node_name.clone(),
            component: pod.component().to_string(),
            timestamp,
        })
    }

    /// Raw payload text, `null` when the envelope had none.
    pub fn raw_payload(&self) -> &str {
        self.payload.as_deref().map(RawValue::get).unwrap_or("null")
    }

    /// Decodes the payload as `T`. `event` names the tag in error messages.
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        event: &'static str,
    ) -> Result<T, DecodeError> {
        let raw = self
            .payload
            .as_deref()
            .ok_or(DecodeError::MissingPayload { event })?;
        serde_json::from_str(raw.get()).map_err(|source| DecodeError::Payload { event, source })
    }
}

// Client-side payloads (component = clientapp)

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadlinePayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetStatePayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetCurrentServerRoundPayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub server_round: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTrainingGraphPayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub server_round: i32,
    #[serde(default)]
    pub optimizer: String,
    #[serde(default)]
    pub learning_rate: f64,
    #[serde(default)]
    pub num_epochs: i32,
    #[serde(default)]
    pub batch_size: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddOneEpochTrainingGraphPointPayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub server_round: i32,
    #[serde(default)]
    pub trained_batch: i32,
    #[serde(default)]
    pub current_epoch: i32,
    #[serde(default)]
    pub train_loss: f64,
    #[serde(default)]
    pub val_loss: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default, rename = "epoch_training_elapsed_time")]
    pub epoch_elapsed_time: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTestingGraphPayload {
    pub fl_training_id: String,
    pub partition_id: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddOneServerRoundTestingGraphPointPayload {
    pub fl_training_id: String,
    pub partition_id: i32,
    #[serde(default)]
    pub server_round: i32,
    #[serde(default)]
    pub criterion: String,
    #[serde(default)]
    pub batch_size: i32,
    #[serde(default)]
    pub test_loss: f64,
    #[serde(default)]
    pub accuracy: f64,
}

// Server-side payloads (component = serverapp)

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateFlTrainingPayload {
    pub fl_training_id: String,
    #[serde(default)]
    pub num_rounds: i32,
}

/// `layers` is opaque and is never inspected. The whole payload document is what gets stored.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelWeightsPayload {
    pub fl_training_id: String,
    #[serde(default)]
    pub server_round: i32,
    #[serde(default)]
    pub layers: Option<Box<RawValue>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pod() -> PodInfo {
        PodInfo::new("client-0", "n1").with_label("component", "clientapp")
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn decode_attaches_pod_metadata() {
        let env = Envelope::decode(
            r#"{"event":"READLINE","payload":{"fl_training_id":"t1","partition_id":0,"text":"hi"}}"#,
            &pod(),
            ts(),
        )
        .unwrap();

        assert_eq!(env.event, "READLINE");
        assert_eq!(env.pod_name, "client-0");
        assert_eq!(env.node_name, "n1");
        assert_eq!(env.component, "clientapp");
        assert_eq!(env.timestamp, ts());

        let payload: ReadlinePayload = env.decode_payload("READLINE").unwrap();
        assert_eq!(
            payload,
            ReadlinePayload {
                fl_training_id: "t1".to_string(),
                partition_id: 0,
                text: "hi".to_string(),
            }
        );
    }

    #[test]
    fn pod_without_component_label_leaves_it_empty() {
        let env = Envelope::decode(r#"{"event":"X"}"#, &PodInfo::new("p", "n"), ts()).unwrap();
        assert_eq!(env.component, "");
        assert!(env.payload.is_none());
        assert_eq!(env.raw_payload(), "null");
    }

    #[test]
    fn invalid_json_is_an_envelope_error() {
        let err = Envelope::decode("{not json", &pod(), ts()).unwrap_err();
        assert!(matches!(err, DecodeError::Envelope(_)));
    }

    #[test]
    fn missing_payload_is_reported_for_the_event() {
        let env = Envelope::decode(r#"{"event":"SETSTATE"}"#, &pod(), ts()).unwrap();
        let err = env.decode_payload::<SetStatePayload>("SETSTATE").unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload { event: "SETSTATE" }));
    }

    #[test]
    fn wrong_payload_type_is_a_payload_error() {
        let env = Envelope::decode(
            r#"{"event":"SETSTATE","payload":{"fl_training_id":"t1","partition_id":"zero"}}"#,
            &pod(),
            ts(),
        )
        .unwrap();
        let err = env.decode_payload::<SetStatePayload>("SETSTATE").unwrap_err();
        assert!(matches!(err, DecodeError::Payload { event: "SETSTATE", .. }));
    }

    #[test]
    fn optional_fields_default_to_zero() {
        let env = Envelope::decode(
            r#"{"event":"ADD_ONE_EPOCH_TRAINING_GRAPH_POINT","payload":{"fl_training_id":"t1","partition_id":2,"current_epoch":3,"epoch_training_elapsed_time":1.5}}"#,
            &pod(),
            ts(),
        )
        .unwrap();
        let p: AddOneEpochTrainingGraphPointPayload = env
            .decode_payload("ADD_ONE_EPOCH_TRAINING_GRAPH_POINT")
            .unwrap();
        assert_eq!(p.partition_id, 2);
        assert_eq!(p.current_epoch, 3);
        assert_eq!(p.server_round, 0);
        assert_eq!(p.train_loss, 0.0);
        assert_eq!(p.epoch_elapsed_time, 1.5);
    }

    #[test]
    fn model_weights_layers_stay_opaque() {
        let env = Envelope::decode(
            r#"{"event":"MODEL_WEIGHTS","payload":{"fl_training_id":"t1","server_round":4,"layers":[[0.1,0.2],{"k":1}]}}"#,
            &pod(),
            ts(),
        )
        .unwrap();
        let p: ModelWeightsPayload = env.decode_payload("MODEL_WEIGHTS").unwrap();
        assert_eq!(p.server_round, 4);
        assert_eq!(p.layers.unwrap().get(), r#"[[0.1,0.2],{"k":1}]"#);
    }
}
