// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails the logs of federated-learning pods and persists the structured events they emit.
//!
//! [`discovery::Discovery`] lists pods on a fixed interval and runs one [`tailer::PodTailer`]
//! per pod. Tailers parse timestamped lines into [`envelope::Envelope`]s and push them onto a
//! bounded queue consumed by [`ingest_service::IngestService`], which routes each envelope and
//! applies it through the watermark-gated [`persistence::Ingestor`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cluster;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod errors;
pub mod ingest_service;
pub mod kube_cluster;
pub mod line;
pub mod persistence;
pub mod router;
pub mod services;
pub mod store;
pub mod tailer;
