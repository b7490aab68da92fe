// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two-level dispatch of envelopes: first by the emitting pod's component, then by event tag.
//!
//! Unknown components and unknown tags are logged and ignored so that producers can add events
//! before the ingester knows about them.

use crate::envelope::{
    AddOneEpochTrainingGraphPointPayload, AddOneServerRoundTestingGraphPointPayload,
    CreateFlTrainingPayload, CreateTestingGraphPayload, CreateTrainingGraphPayload, Envelope,
    ModelWeightsPayload, ReadlinePayload, SetCurrentServerRoundPayload, SetStatePayload,
};
use crate::errors::DecodeError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Client,
    Server,
}

impl Component {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "clientapp" => Some(Self::Client),
            "serverapp" => Some(Self::Server),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventKind {
    Readline,
    SetState,
    SetCurrentServerRound,
    CreateTrainingGraph,
    AddOneEpochTrainingGraphPoint,
    CreateTestingGraph,
    AddOneServerRoundTestingGraphPoint,
}

impl ClientEventKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "READLINE" => Self::Readline,
            "SETSTATE" => Self::SetState,
            "SET_CURRENT_SERVER_ROUND" => Self::SetCurrentServerRound,
            "CREATE_TRAINING_GRAPH" => Self::CreateTrainingGraph,
            "ADD_ONE_EPOCH_TRAINING_GRAPH_POINT" => Self::AddOneEpochTrainingGraphPoint,
            "CREATE_TESTING_GRAPH" => Self::CreateTestingGraph,
            "ADD_ONE_SERVER_ROUND_TESTING_GRAPH_POINT" => Self::AddOneServerRoundTestingGraphPoint,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Readline => "READLINE",
            Self::SetState => "SETSTATE",
            Self::SetCurrentServerRound => "SET_CURRENT_SERVER_ROUND",
            Self::CreateTrainingGraph => "CREATE_TRAINING_GRAPH",
            Self::AddOneEpochTrainingGraphPoint => "ADD_ONE_EPOCH_TRAINING_GRAPH_POINT",
            Self::CreateTestingGraph => "CREATE_TESTING_GRAPH",
            Self::AddOneServerRoundTestingGraphPoint => "ADD_ONE_SERVER_ROUND_TESTING_GRAPH_POINT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEventKind {
    CreateFlTraining,
    ModelWeights,
}

impl ServerEventKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CREATE_FL_TRAINING" => Some(Self::CreateFlTraining),
            "MODEL_WEIGHTS" => Some(Self::ModelWeights),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::CreateFlTraining => "CREATE_FL_TRAINING",
            Self::ModelWeights => "MODEL_WEIGHTS",
        }
    }
}

/// A routed event with its decoded payload.
#[derive(Debug, Clone)]
pub enum Event {
    Readline(ReadlinePayload),
    SetState(SetStatePayload),
    SetCurrentServerRound(SetCurrentServerRoundPayload),
    CreateTrainingGraph(CreateTrainingGraphPayload),
    AddOneEpochTrainingGraphPoint(AddOneEpochTrainingGraphPointPayload),
    CreateTestingGraph(CreateTestingGraphPayload),
    AddOneServerRoundTestingGraphPoint(AddOneServerRoundTestingGraphPointPayload),
    CreateFlTraining(CreateFlTrainingPayload),
    ModelWeights(ModelWeightsPayload),
}

impl Event {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Readline(_) => ClientEventKind::Readline.tag(),
            Self::SetState(_) => ClientEventKind::SetState.tag(),
            Self::SetCurrentServerRound(_) => ClientEventKind::SetCurrentServerRound.tag(),
            Self::CreateTrainingGraph(_) => ClientEventKind::CreateTrainingGraph.tag(),
            Self::AddOneEpochTrainingGraphPoint(_) => {
                ClientEventKind::AddOneEpochTrainingGraphPoint.tag()
            }
            Self::CreateTestingGraph(_) => ClientEventKind::CreateTestingGraph.tag(),
            Self::AddOneServerRoundTestingGraphPoint(_) => {
                ClientEventKind::AddOneServerRoundTestingGraphPoint.tag()
            }
            Self::CreateFlTraining(_) => ServerEventKind::CreateFlTraining.tag(),
            Self::ModelWeights(_) => ServerEventKind::ModelWeights.tag(),
        }
    }

    /// The training this event refers to.
    pub fn fl_training_id(&self) -> &str {
        match self {
            Self::Readline(p) => &p.fl_training_id,
            Self::SetState(p) => &p.fl_training_id,
            Self::SetCurrentServerRound(p) => &p.fl_training_id,
            Self::CreateTrainingGraph(p) => &p.fl_training_id,
            Self::AddOneEpochTrainingGraphPoint(p) => &p.fl_training_id,
            Self::CreateTestingGraph(p) => &p.fl_training_id,
            Self::AddOneServerRoundTestingGraphPoint(p) => &p.fl_training_id,
            Self::CreateFlTraining(p) => &p.fl_training_id,
            Self::ModelWeights(p) => &p.fl_training_id,
        }
    }
}

/// Routes an envelope to its typed event.
///
/// Returns `Ok(None)` for envelopes that are deliberately ignored (unknown component or tag) and
/// an error only when a known event's payload fails to decode.
pub fn route(env: &Envelope) -> Result<Option<Event>, DecodeError> {
    let Some(component) = Component::from_label(&env.component) else {
        debug!(
            component = %env.component,
            event = %env.event,
            pod = %env.pod_name,
            node = %env.node_name,
            "unknown component, skipping event"
        );
        return Ok(None);
    };

    match component {
        Component::Client => route_client(env),
        Component::Server => route_server(env),
    }
}

fn route_client(env: &Envelope) -> Result<Option<Event>, DecodeError> {
    let Some(kind) = ClientEventKind::from_tag(&env.event) else {
        warn!(
            event = %env.event,
            payload = %env.raw_payload(),
            pod = %env.pod_name,
            node = %env.node_name,
            "unknown client event type"
        );
        return Ok(None);
    };

    info!(
        event = kind.tag(),
        pod = %env.pod_name,
        node = %env.node_name,
        ts = %env.timestamp,
        "handling client event"
    );

    let tag = kind.tag();
    let event = match kind {
        ClientEventKind::Readline => Event::Readline(env.decode_payload(tag)?),
        ClientEventKind::SetState => Event::SetState(env.decode_payload(tag)?),
        ClientEventKind::SetCurrentServerRound => {
            Event::SetCurrentServerRound(env.decode_payload(tag)?)
        }
        ClientEventKind::CreateTrainingGraph => {
            Event::CreateTrainingGraph(env.decode_payload(tag)?)
        }
        ClientEventKind::AddOneEpochTrainingGraphPoint => {
            Event::AddOneEpochTrainingGraphPoint(env.decode_payload(tag)?)
        }
        ClientEventKind::CreateTestingGraph => Event::CreateTestingGraph(env.decode_payload(tag)?),
        ClientEventKind::AddOneServerRoundTestingGraphPoint => {
            Event::AddOneServerRoundTestingGraphPoint(env.decode_payload(tag)?)
        }
    };
    Ok(Some(event))
}

fn route_server(env: &Envelope) -> Result<Option<Event>, DecodeError> {
    let Some(kind) = ServerEventKind::from_tag(&env.event) else {
        warn!(
            event = %env.event,
            payload = %env.raw_payload(),
            pod = %env.pod_name,
            node = %env.node_name,
            "unknown server event type"
        );
        return Ok(None);
    };

    info!(
        event = kind.tag(),
        pod = %env.pod_name,
        node = %env.node_name,
        ts = %env.timestamp,
        "handling server event"
    );

    let tag = kind.tag();
    let event = match kind {
        ServerEventKind::CreateFlTraining => Event::CreateFlTraining(env.decode_payload(tag)?),
        ServerEventKind::ModelWeights => Event::ModelWeights(env.decode_payload(tag)?),
    };
    Ok(Some(event))
}
