// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sync Runner
//!
//! Background task driving the [`SyncIngestor`] from both upstream channels:
//!
//! - **poll**: every `poll_interval` the [`LockFeed`] snapshot is fetched
//!   and folded in as inserts/updates
//! - **push**: events sent on the channel returned by [`SyncRunner::new`]
//!   are applied as they arrive
//!
//! Both channels feed the same ingestor, one batch at a time.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{SyncIngestor, UpstreamLockEvent};

const PUSH_BUFFER: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(String),

    #[error("feed answered {status}")]
    Status { status: u16 },

    #[error("unexpected feed payload: {0}")]
    InvalidResponse(String),
}

/// Source of full lock snapshots for the poll channel.
#[async_trait]
pub trait LockFeed: Send + Sync {
    async fn poll_locks(&self) -> Result<Vec<Value>, FeedError>;
}

/// `GET <url>` returning a JSON array of locks, or an object wrapping one
/// under `locks` or `data`.
pub struct HttpLockFeed {
    url: url::Url,
    http: Client,
}

impl HttpLockFeed {
    pub fn new(url: &str) -> Result<Self, FeedError> {
        let url = url
            .parse()
            .map_err(|e: url::ParseError| FeedError::Request(format!("{url}: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FeedError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl LockFeed for HttpLockFeed {
    async fn poll_locks(&self) -> Result<Vec<Value>, FeedError> {
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| FeedError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| FeedError::InvalidResponse(e.to_string()))?;
        unwrap_snapshot(body)
    }
}

fn unwrap_snapshot(body: Value) -> Result<Vec<Value>, FeedError> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("locks").or_else(|| map.remove("data")) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(FeedError::InvalidResponse(
                "expected an array under `locks` or `data`".to_string(),
            )),
        },
        other => Err(FeedError::InvalidResponse(format!(
            "expected an array, got {other}"
        ))),
    }
}

pub struct SyncRunner {
    ingestor: Arc<SyncIngestor>,
    feed: Option<Arc<dyn LockFeed>>,
    push_rx: mpsc::Receiver<UpstreamLockEvent>,
    poll_interval: Duration,
}

impl SyncRunner {
    /// Returns the runner and the sender the push subscription writes to.
    pub fn new(
        ingestor: Arc<SyncIngestor>,
        feed: Option<Arc<dyn LockFeed>>,
        poll_interval: Duration,
    ) -> (Self, mpsc::Sender<UpstreamLockEvent>) {
        let (push_tx, push_rx) = mpsc::channel(PUSH_BUFFER);
        (
            Self {
                ingestor,
                feed,
                push_rx,
                poll_interval,
            },
            push_tx,
        )
    }

    /// Run until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(runner.run(shutdown.clone()));
    /// ```
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            poll = self.feed.is_some(),
            "Lock sync starting"
        );

        let mut push_open = true;
        loop {
            if shutdown.is_cancelled() {
                info!("Lock sync shutting down");
                return;
            }

            self.poll_step().await;

            let sleep = tokio::time::sleep(self.poll_interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    event = self.push_rx.recv(), if push_open => match event {
                        Some(event) => {
                            self.ingestor.process(vec![event]).await;
                        }
                        None => {
                            info!("Push channel closed, continuing with poll only");
                            push_open = false;
                        }
                    },
                    _ = shutdown.cancelled() => {
                        info!("Lock sync shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn poll_step(&self) {
        let Some(feed) = &self.feed else {
            return;
        };
        match feed.poll_locks().await {
            Ok(records) if records.is_empty() => {}
            Ok(records) => {
                let events = self.ingestor.events_from_snapshot(records);
                self.ingestor.process(events).await;
            }
            Err(e) => warn!(error = %e, "Lock feed poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationRelay;
    use crate::storage::{LockStore, MemoryBackend};
    use crate::sync::{ChainDefaults, UpstreamEventKind};
    use serde_json::json;
    use std::sync::Mutex;

    struct StaticFeed {
        records: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl LockFeed for StaticFeed {
        async fn poll_locks(&self) -> Result<Vec<Value>, FeedError> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn record(id: &str) -> Value {
        json!({ "lock_id": id, "authorization_code": format!("AUTH-{id}"), "amount_usd": "250.00" })
    }

    #[test]
    fn snapshot_shapes() {
        assert_eq!(unwrap_snapshot(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(unwrap_snapshot(json!({"locks": [1]})).unwrap().len(), 1);
        assert_eq!(unwrap_snapshot(json!({"data": []})).unwrap().len(), 0);
        assert!(unwrap_snapshot(json!({"other": []})).is_err());
        assert!(unwrap_snapshot(json!("nope")).is_err());
    }

    #[tokio::test]
    async fn runner_folds_poll_and_push_until_cancelled() {
        let store = Arc::new(LockStore::open(Arc::new(MemoryBackend::new())).unwrap());
        let relay = Arc::new(NotificationRelay::new(store.clone(), vec![]));
        let ingestor = Arc::new(SyncIngestor::new(
            store.clone(),
            relay,
            ChainDefaults {
                network: "lemonchain".into(),
                chain_id: 1005,
            },
        ));
        let feed: Arc<dyn LockFeed> = Arc::new(StaticFeed {
            records: Mutex::new(vec![record("L1")]),
        });

        let (runner, push) = SyncRunner::new(ingestor, Some(feed), Duration::from_millis(20));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(runner.run(shutdown.clone()));

        push.send(UpstreamLockEvent::push(UpstreamEventKind::Insert, record("L2")))
            .await
            .unwrap();
        push.send(UpstreamLockEvent::push(UpstreamEventKind::Insert, record("L1")))
            .await
            .unwrap();

        for _ in 0..100 {
            if store.contains_lock("L1") && store.contains_lock("L2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert!(store.contains_lock("L1"));
        assert!(store.contains_lock("L2"));
        assert_eq!(store.stats().locks.get("pending"), Some(&2));
    }

    #[test]
    fn rejects_bad_feed_url() {
        assert!(HttpLockFeed::new("::not a url").is_err());
    }
}
