// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Lock Subscription
//!
//! WebSocket client for the upstream realtime broadcast. Every frame is
//! mapped to [`UpstreamLockEvent`]s and forwarded on the push channel of the
//! [`SyncRunner`](super::SyncRunner):
//!
//! | frame `type`                      | event                                   |
//! |-----------------------------------|-----------------------------------------|
//! | `lock.created`                    | INSERT of `data` (or `data.event.payload`) |
//! | `lock.approved`                   | UPDATE of `data.payload`, status `approved` |
//! | `lock.rejected`                   | UPDATE of `data.payload`, status `rejected` |
//! | `mint.completed`                  | UPDATE of `data.payload`, status `minted`   |
//! | `initial_state`                   | INSERT for every entry of `data.locks`  |
//!
//! Other frames are ignored. Dropped connections are re-established with
//! exponential backoff until the cancellation token fires or the push
//! channel closes.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::FeedError;
use super::{UpstreamEventKind, UpstreamLockEvent};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// How a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    PushClosed,
}

#[derive(Debug, Clone)]
pub struct LockSubscription {
    url: url::Url,
}

impl LockSubscription {
    /// `url` must use the `ws` or `wss` scheme.
    pub fn new(url: &str) -> Result<Self, FeedError> {
        let parsed: url::Url = url
            .parse()
            .map_err(|e: url::ParseError| FeedError::Request(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(FeedError::Request(format!(
                "{url}: expected a ws:// or wss:// url"
            )));
        }
        Ok(Self { url: parsed })
    }

    /// Forward upstream events into `push` until cancelled.
    ///
    /// ```rust,ignore
    /// tokio::spawn(subscription.run(push.clone(), shutdown.clone()));
    /// ```
    pub async fn run(self, push: mpsc::Sender<UpstreamLockEvent>, shutdown: CancellationToken) {
        info!(url = %self.url, "Lock subscription starting");
        let mut attempts = 0u32;
        loop {
            let session = tokio::select! {
                session = self.session(&push) => session,
                _ = shutdown.cancelled() => {
                    info!("Lock subscription shutting down");
                    return;
                }
            };
            match session {
                Ok(SessionEnd::PushClosed) => {
                    info!("Push channel closed, lock subscription stopping");
                    return;
                }
                Ok(SessionEnd::Disconnected) => {
                    attempts = 1;
                    warn!(url = %self.url, "Lock subscription disconnected");
                }
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    warn!(url = %self.url, attempts, error = %e, "Lock subscription failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff(attempts)) => {}
                _ = shutdown.cancelled() => {
                    info!("Lock subscription shutting down");
                    return;
                }
            }
        }
    }

    async fn session(&self, push: &mpsc::Sender<UpstreamLockEvent>) -> Result<SessionEnd, FeedError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Request(e.to_string()))?;
        info!(url = %self.url, "Lock subscription connected");

        let (mut write, mut read) = stream.split();
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    for event in events_from_message(&text) {
                        if push.send(event).await.is_err() {
                            return Ok(SessionEnd::PushClosed);
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Lock subscription read failed");
                    break;
                }
            }
        }
        Ok(SessionEnd::Disconnected)
    }
}

fn backoff(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(5);
    (RECONNECT_BASE_DELAY * factor).min(MAX_RECONNECT_DELAY)
}

/// Map one broadcast frame to upstream events. Unknown or malformed frames
/// map to none.
pub fn events_from_message(text: &str) -> Vec<UpstreamLockEvent> {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("Ignoring non-JSON subscription frame");
        return Vec::new();
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);
    match frame.get("type").and_then(Value::as_str) {
        Some("lock.created") => {
            let record = data
                .pointer("/event/payload")
                .cloned()
                .unwrap_or(data);
            insert(record).into_iter().collect()
        }
        Some("lock.approved") => update(data, "approved").into_iter().collect(),
        Some("lock.rejected") => update(data, "rejected").into_iter().collect(),
        Some("mint.completed") => update(data, "minted").into_iter().collect(),
        Some("initial_state") => match data.get("locks") {
            Some(Value::Array(locks)) => locks
                .iter()
                .filter_map(|row| insert(snapshot_record(row)))
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn insert(record: Value) -> Option<UpstreamLockEvent> {
    record
        .is_object()
        .then(|| UpstreamLockEvent::push(UpstreamEventKind::Insert, record))
}

fn update(data: Value, status: &str) -> Option<UpstreamLockEvent> {
    let mut record = if data.get("payload").is_some() {
        data["payload"].clone()
    } else {
        data
    };
    let map = record.as_object_mut()?;
    map.entry("status")
        .or_insert_with(|| Value::String(status.to_string()));
    Some(UpstreamLockEvent::push(UpstreamEventKind::Update, record))
}

/// Snapshot rows keep the lock document under `data` next to the indexed
/// columns.
fn snapshot_record(row: &Value) -> Value {
    match row.get("data") {
        Some(inner @ Value::Object(_)) => inner.clone(),
        _ => row.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn created_frames_become_inserts() {
        let events = events_from_message(
            &json!({"type": "lock.created", "data": {"lockId": "L1", "amount": "10"}}).to_string(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, UpstreamEventKind::Insert);
        assert_eq!(events[0].record["lockId"], "L1");

        let nested = events_from_message(
            &json!({"type": "lock.created", "data": {"event": {"payload": {"lockId": "L2"}}}})
                .to_string(),
        );
        assert_eq!(nested[0].record, json!({"lockId": "L2"}));
    }

    #[test]
    fn status_frames_become_updates_with_status() {
        let events = events_from_message(
            &json!({"type": "lock.approved", "data": {"payload": {"lockId": "L1"}}}).to_string(),
        );
        assert_eq!(events[0].kind, UpstreamEventKind::Update);
        assert_eq!(events[0].record["status"], "approved");

        let minted = events_from_message(
            &json!({"type": "mint.completed", "data": {"payload": {"lockId": "L1", "status": "minted"}}})
                .to_string(),
        );
        assert_eq!(minted[0].record["status"], "minted");

        let rejected = events_from_message(
            &json!({"type": "lock.rejected", "data": {"lockId": "L3"}}).to_string(),
        );
        assert_eq!(rejected[0].record, json!({"lockId": "L3", "status": "rejected"}));
    }

    #[test]
    fn initial_state_unwraps_snapshot_rows() {
        let events = events_from_message(
            &json!({
                "type": "initial_state",
                "data": {
                    "locks": [
                        {"id": "L1", "data": {"lockId": "L1", "amount": "5"}},
                        {"lock_id": "L2", "amount_usd": "7", "data": null}
                    ],
                    "lockReserves": []
                }
            })
            .to_string(),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record, json!({"lockId": "L1", "amount": "5"}));
        assert_eq!(events[1].record["lock_id"], "L2");
    }

    #[test]
    fn other_frames_are_ignored() {
        assert!(events_from_message("not json").is_empty());
        assert!(events_from_message(r#"{"type":"pong"}"#).is_empty());
        assert!(events_from_message(r#"{"type":"lock.approved","data":"L1"}"#).is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(20), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn only_websocket_urls_are_accepted() {
        assert!(LockSubscription::new("ws://127.0.0.1:9000/ws").is_ok());
        assert!(LockSubscription::new("https://bank.example.org/ws").is_err());
        assert!(LockSubscription::new("::nope").is_err());
    }

    #[tokio::test]
    async fn forwards_broadcast_frames_into_push_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            ws.send(Message::Text(
                json!({"type": "lock.created", "data": {"lockId": "L1", "amount": "10"}})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(
                json!({"type": "lock.approved", "data": {"payload": {"lockId": "L1"}}})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
            // hold the connection open until the client goes away
            while let Some(Ok(_)) = ws.next().await {}
        });

        let subscription = LockSubscription::new(&format!("ws://{addr}")).unwrap();
        let (push, mut events) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(push, shutdown.clone()));

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, UpstreamEventKind::Insert);
        assert_eq!(second.kind, UpstreamEventKind::Update);
        assert_eq!(second.record["status"], "approved");

        shutdown.cancel();
        handle.await.unwrap();
        server.abort();
    }
}
