// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the ingestion pipeline.
//!
//! Only [`ServicesError`] is ever fatal, and only at startup. Everything else is scoped to a
//! single line, event, pod or tick and is logged by the stage that owns that unit of work.

use chrono::{DateTime, Utc};

/// A raw pod log line could not be split into a timestamp and a message.
///
/// Both variants keep the remainder of the line so callers can log it.
#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("malformed log line: no separator after timestamp")]
    MalformedLine { remainder: String },

    #[error("bad timestamp prefix: {source}")]
    BadTimestamp {
        remainder: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl LineError {
    /// The part of the line that followed (or, without a separator, made up) the timestamp.
    pub fn remainder(&self) -> &str {
        match self {
            Self::MalformedLine { remainder } | Self::BadTimestamp { remainder, .. } => remainder,
        }
    }
}

/// JSON decoding failure for an envelope or for a matched event's typed payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope is not valid JSON: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("{event} payload is missing")]
    MissingPayload { event: &'static str },

    #[error("{event} unmarshal: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`crate::store::Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    Conflict(String),

    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Failure while applying one event. Aborts that event only.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure talking to the container-orchestration cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster client configuration error: {0}")]
    Config(String),

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("log stream for pod {pod} closed before it was opened")]
    StreamAborted { pod: String },
}

/// Cause of a failed [`crate::tailer::PodTailer::tail`] call.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("failed to open pod log stream: {0}")]
    Open(#[source] ClusterError),

    #[error("read log error: {0}")]
    Read(#[source] std::io::Error),

    #[error("envelope queue closed")]
    QueueClosed,
}

/// A tail that stopped early. `cursor` is the high-watermark reached before `source` happened and
/// must still be recorded by the caller.
#[derive(Debug, thiserror::Error)]
#[error("tail of pod {pod} stopped at {cursor:?}: {source}")]
pub struct PartialTail {
    pub pod: String,
    pub cursor: Option<DateTime<Utc>>,
    #[source]
    pub source: TailError,
}

/// Errors that can occur while configuring, starting or stopping the ingestion services.
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to initialize store: {0}")]
    StoreInit(#[source] StoreError),

    #[error("Failed to initialize cluster client: {0}")]
    ClusterInit(#[source] ClusterError),

    #[error("Services already started")]
    AlreadyStarted,

    #[error("Runtime error: {0}")]
    Runtime(String),
}
