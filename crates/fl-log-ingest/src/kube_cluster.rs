// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`Cluster`] backed by the Kubernetes API.

use crate::cluster::{Cluster, LogStream, PodInfo};
use crate::errors::ClusterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncBufRead, AsyncBufReadExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::io;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Lines buffered between the HTTP body reader and the tailer.
const LINE_BUFFER: usize = 256;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Builds a client from `kubeconfig` when given, otherwise from the in-cluster environment
    /// or the default kubeconfig.
    pub async fn try_new(kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Config(format!("{}: {e}", path.display())))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };
        info!(cluster_url = %config.cluster_url, "kubernetes client configured");
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }
}

/// Splits `reader` on newlines and forwards each line to `tx` until the body ends or the receiver
/// goes away. Bytes that are not UTF-8 are replaced rather than failing the line.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<io::Result<String>>)
where
    R: AsyncBufRead,
{
    let mut reader = Box::pin(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            () = tx.closed() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => {
                let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let line = String::from_utf8_lossy(line).into_owned();
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

fn pod_info(pod: Pod) -> PodInfo {
    PodInfo {
        name: pod.metadata.name.unwrap_or_default(),
        node_name: pod.spec.and_then(|spec| spec.node_name).unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items.into_iter().map(pod_info).collect())
    }

    async fn open_log_stream(
        &self,
        namespace: &str,
        pod: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogStream, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            timestamps: true,
            since_time: since,
            ..LogParams::default()
        };
        let pod_name = pod.to_string();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel();

        // The reader borrows the request, so a task owns both and forwards lines until the
        // body ends or the LogStream is dropped.
        tokio::spawn(async move {
            let reader = match api.log_stream(&pod_name, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };
            forward_lines(reader, tx).await;
            debug!(pod = %pod_name, "pod log stream finished");
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(LogStream::new(rx)),
            Ok(Err(e)) => Err(ClusterError::Api(e)),
            Err(_) => Err(ClusterError::StreamAborted {
                pod: pod.to_string(),
            }),
        }
    }
}
