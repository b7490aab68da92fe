// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The cluster collaborator: pod listing and per-pod log streams.

use crate::errors::ClusterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io;
use tokio::sync::mpsc;

/// Label read from each pod to decide how its events are routed.
pub const COMPONENT_LABEL: &str = "component";

/// Pod metadata needed to tag envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
}

impl PodInfo {
    pub fn new(name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Value of the `component` label, or an empty string when the pod has none.
    pub fn component(&self) -> &str {
        self.labels
            .get(COMPONENT_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// A stream of raw log lines for one pod. Each line is still prefixed with its timestamp.
///
/// Dropping the stream closes it, which in turn stops whatever is feeding it.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<io::Result<String>>,
}

impl LogStream {
    pub fn new(rx: mpsc::Receiver<io::Result<String>>) -> Self {
        Self { rx }
    }

    /// Builds an already-finished stream from a fixed list of lines.
    pub fn from_lines<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = io::Result<String>>,
    {
        let lines: Vec<_> = lines.into_iter().collect();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity covers every line, so this cannot fail.
            let _ = tx.try_send(line);
        }
        Self { rx }
    }

    /// Next line, or `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Lists the pods in `namespace` matching `label_selector`.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError>;

    /// Opens a timestamped log stream for `pod`, starting at `since` when set or at the beginning
    /// of the retained logs otherwise. The since-time filter is advisory.
    async fn open_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError>;
}
