// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental tail of one pod's log stream.
//!
//! The since-time sent to the cluster is advisory, so every line is re-checked against the cursor
//! and lines at or before it are dropped. The returned cursor is the latest timestamp the tail has
//! fully handled: either forwarded downstream or discarded as noise.

use crate::cluster::{Cluster, PodInfo};
use crate::envelope::Envelope;
use crate::errors::{PartialTail, TailError};
use crate::line::parse_timestamp_line;
use chrono::{DateTime, Utc};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-pod high-watermark. `None` means the pod's full retained history.
pub type Cursor = Option<DateTime<Utc>>;

pub struct PodTailer {
    cluster: Arc<dyn Cluster>,
    namespace: String,
    tx: Sender<Envelope>,
    cancel_token: CancellationToken,
}

impl PodTailer {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        namespace: impl Into<String>,
        tx: Sender<Envelope>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            tx,
            cancel_token,
        }
    }

    /// Reads `pod`'s log from `cursor` until the stream ends or the tailer is cancelled, sending
    /// every decoded envelope downstream.
    ///
    /// On failure the error still carries the cursor reached so far.
    pub async fn tail(&self, pod: &PodInfo, cursor: Cursor) -> Result<Cursor, PartialTail> {
        let partial = |cursor: Cursor, source: TailError| PartialTail {
            pod: pod.name.clone(),
            cursor,
            source,
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Ok(cursor),
            opened = self.cluster.open_log_stream(&self.namespace, &pod.name, cursor) => opened,
        };
        let mut stream = opened.map_err(|e| partial(cursor, TailError::Open(e)))?;

        let mut last = cursor;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    debug!(pod = %pod.name, cursor = ?last, "tail cancelled");
                    return Ok(last);
                }
                next = stream.next_line() => next,
            };

            let line = match next {
                None => return Ok(last),
                Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    debug!(pod = %pod.name, error = %e, "skip undecodable log line");
                    continue;
                }
                Some(Err(e)) => return Err(partial(last, TailError::Read(e))),
                Some(Ok(line)) => line,
            };
            trace!(pod = %pod.name, line = %line, "raw log line");

            let (ts, message) = match parse_timestamp_line(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(pod = %pod.name, error = %e, remainder = %e.remainder(), "skip unparsable log line");
                    continue;
                }
            };

            if matches!(cursor, Some(since) if ts <= since) {
                continue;
            }

            if !message.starts_with('{') {
                debug!(pod = %pod.name, message = %message, "skip non-JSON log line");
                last = last.max(Some(ts));
                continue;
            }

            let envelope = match Envelope::decode(message, pod, ts) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(pod = %pod.name, error = %e, "skip undecodable envelope");
                    last = last.max(Some(ts));
                    continue;
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    debug!(pod = %pod.name, cursor = ?last, "tail cancelled");
                    return Ok(last);
                }
                sent = self.tx.send(envelope) => {
                    if sent.is_err() {
                        return Err(partial(last, TailError::QueueClosed));
                    }
                }
            }
            last = last.max(Some(ts));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::LogStream;
    use crate::errors::ClusterError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct OneStream {
        lines: Mutex<Option<Vec<io::Result<String>>>>,
        since: Mutex<Option<Cursor>>,
    }

    impl OneStream {
        fn new(lines: Vec<io::Result<String>>) -> Self {
            Self {
                lines: Mutex::new(Some(lines)),
                since: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Cluster for OneStream {
        async fn list_pods(&self, _: &str, _: &str) -> Result<Vec<PodInfo>, ClusterError> {
            Ok(Vec::new())
        }

        async fn open_log_stream(
            &self,
            _: &str,
            pod: &str,
            since: Cursor,
        ) -> Result<LogStream, ClusterError> {
            *self.since.lock().unwrap() = Some(since);
            match self.lines.lock().unwrap().take() {
                Some(lines) => Ok(LogStream::from_lines(lines)),
                None => Err(ClusterError::StreamAborted {
                    pod: pod.to_string(),
                }),
            }
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    fn line(secs: i64, message: &str) -> io::Result<String> {
        Ok(format!("{} {message}", at(secs).to_rfc3339()))
    }

    fn pod() -> PodInfo {
        PodInfo::new("client-0", "n1").with_label("component", "clientapp")
    }

    const EVENT: &str = r#"{"event":"READLINE","payload":{"fl_training_id":"t1","partition_id":0,"text":"hi"}}"#;

    fn tailer(cluster: Arc<dyn Cluster>, capacity: usize) -> (PodTailer, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            PodTailer::new(cluster, "flwr", tx, CancellationToken::new()),
            rx,
        )
    }

    #[tokio::test]
    async fn emits_envelopes_after_cursor_and_returns_max() {
        let cluster = Arc::new(OneStream::new(vec![
            line(1, EVENT),
            line(2, EVENT),
            line(3, EVENT),
            line(4, EVENT),
        ]));
        let (tailer, mut rx) = tailer(cluster.clone(), 16);

        let cursor = tailer.tail(&pod(), Some(at(2))).await.unwrap();
        assert_eq!(cursor, Some(at(4)));
        assert_eq!(*cluster.since.lock().unwrap(), Some(Some(at(2))));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.timestamp, at(3));
        assert_eq!(first.pod_name, "client-0");
        assert_eq!(first.component, "clientapp");
        assert_eq!(rx.recv().await.unwrap().timestamp, at(4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn noise_is_skipped() {
        let cluster = Arc::new(OneStream::new(vec![
            line(1, "plain text output"),
            Ok("not-a-timestamp {\"event\":\"X\"}".to_string()),
            line(2, "{broken json"),
            line(3, ""),
            line(4, EVENT),
            Ok("garbage-without-separator".to_string()),
        ]));
        let (tailer, mut rx) = tailer(cluster, 16);

        let cursor = tailer.tail(&pod(), None).await.unwrap();
        assert_eq!(cursor, Some(at(4)));
        assert_eq!(rx.recv().await.unwrap().timestamp, at(4));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_error_keeps_partial_cursor() {
        let cluster = Arc::new(OneStream::new(vec![
            line(1, EVENT),
            line(2, EVENT),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            line(3, EVENT),
        ]));
        let (tailer, _rx) = tailer(cluster, 16);

        let err = tailer.tail(&pod(), None).await.unwrap_err();
        assert_eq!(err.cursor, Some(at(2)));
        assert!(matches!(err.source, TailError::Read(_)));
    }

    #[tokio::test]
    async fn undecodable_line_is_skipped_not_retried() {
        let cluster = Arc::new(OneStream::new(vec![
            line(1, EVENT),
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )),
            line(3, EVENT),
        ]));
        let (tailer, mut rx) = tailer(cluster, 16);

        let cursor = tailer.tail(&pod(), None).await.unwrap();
        assert_eq!(cursor, Some(at(3)));
        assert_eq!(rx.recv().await.unwrap().timestamp, at(1));
        assert_eq!(rx.recv().await.unwrap().timestamp, at(3));
    }

    #[tokio::test]
    async fn open_failure_returns_original_cursor() {
        let cluster = Arc::new(OneStream::new(Vec::new()));
        cluster.lines.lock().unwrap().take();
        let (tailer, _rx) = tailer(cluster, 16);

        let err = tailer.tail(&pod(), Some(at(7))).await.unwrap_err();
        assert_eq!(err.cursor, Some(at(7)));
        assert!(matches!(err.source, TailError::Open(_)));
    }

    #[tokio::test]
    async fn cancelled_tail_returns_progress_so_far() {
        let cluster = Arc::new(OneStream::new(vec![line(1, EVENT), line(2, EVENT)]));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel_token = CancellationToken::new();
        let tailer = PodTailer::new(cluster, "flwr", tx, cancel_token.clone());

        // The queue holds one envelope, so the tail blocks sending the second until cancelled.
        let handle = tokio::spawn(async move { tailer.tail(&pod(), None).await });
        let first = rx.recv().await.unwrap();
        assert_eq!(first.timestamp, at(1));
        tokio::task::yield_now().await;
        cancel_token.cancel();

        let cursor = handle.await.unwrap().unwrap();
        assert!(cursor == Some(at(1)) || cursor == Some(at(2)));
    }

    #[tokio::test]
    async fn already_cancelled_tail_does_not_open_a_stream() {
        let cluster = Arc::new(OneStream::new(vec![line(1, EVENT)]));
        let (tx, _rx) = mpsc::channel(1);
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();
        let tailer = PodTailer::new(cluster.clone(), "flwr", tx, cancel_token);

        assert_eq!(tailer.tail(&pod(), Some(at(0))).await.unwrap(), Some(at(0)));
        assert!(cluster.since.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let cluster = Arc::new(OneStream::new(vec![line(1, "not json"), line(2, EVENT)]));
        let (tailer, rx) = tailer(cluster, 1);
        drop(rx);

        let err = tailer.tail(&pod(), None).await.unwrap_err();
        assert!(matches!(err.source, TailError::QueueClosed));
        assert_eq!(err.cursor, Some(at(1)));
    }
}
