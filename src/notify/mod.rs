// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Notification Relay
//!
//! At-least-once delivery of settlement outcomes to external sinks (the
//! upstream bank system and the cloud sync channel).
//!
//! Delivery is best-effort with respect to the state change that caused it:
//! a failed notification is logged and kept, never rolled back into the
//! engine. Each notification is written to the store's outbox before the
//! first attempt and removed only once every sink has accepted it, so a
//! crash or outage is covered by [`NotificationRelay::flush_outbox`].

pub mod webhook;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::LockStore;

pub use webhook::WebhookSink;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    NewLock,
    LockApproved,
    LockRejected,
    LockReserveCreated,
    LockReservePromoted,
    LockMinted,
}

impl NotificationEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewLock => "new_lock",
            Self::LockApproved => "lock_approved",
            Self::LockRejected => "lock_rejected",
            Self::LockReserveCreated => "lock_reserve_created",
            Self::LockReservePromoted => "lock_reserve_promoted",
            Self::LockMinted => "lock_minted",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Also the idempotency key sinks use to drop redeliveries.
    pub id: String,
    pub event: NotificationEvent,
    /// Lock id the event is about.
    pub subject: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Notification not yet accepted by every sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub notification: Notification,
    pub pending_sinks: Vec<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("sink answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("sink misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryResult {
    pub notification_id: String,
    pub delivered: Vec<String>,
    /// `(sink, error)` for sinks that still owe a delivery.
    pub failed: Vec<(String, String)>,
}

impl DeliveryResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Attempts per sink inside one `notify` call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Relay
// =============================================================================

pub struct NotificationRelay {
    sinks: Vec<Arc<dyn NotificationSink>>,
    store: Arc<LockStore>,
    retry: RetryPolicy,
    /// Notifications an inline `notify` is still retrying.
    in_flight: Mutex<HashSet<String>>,
}

/// Holds a notification id in the relay's in-flight set until dropped.
struct Delivering<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl NotificationRelay {
    pub fn new(store: Arc<LockStore>, sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sinks,
            store,
            retry: RetryPolicy::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Deliver an event to every sink. Never fails the caller.
    pub async fn notify(
        &self,
        event: NotificationEvent,
        subject: &str,
        payload: serde_json::Value,
    ) -> DeliveryResult {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            event,
            subject: subject.to_string(),
            payload,
            created_at: Utc::now(),
        };

        if self.sinks.is_empty() {
            tracing::debug!(event = %event, subject, "No notification sinks configured");
            return DeliveryResult {
                notification_id: notification.id,
                ..DeliveryResult::default()
            };
        }

        let _delivering = self.delivering(&notification.id);
        let entry = OutboxEntry {
            notification,
            pending_sinks: self.sink_names(),
            attempts: 0,
            last_error: None,
        };
        if let Err(e) = self.store.put_outbox(entry.clone()) {
            tracing::warn!(error = %e, event = %event, subject, "Failed to persist notification to outbox");
        }

        self.attempt(entry, self.retry).await
    }

    /// Retry every outbox entry once. Returns the number fully delivered.
    ///
    /// Entries still being retried by an inline `notify` are left to it.
    pub async fn flush_outbox(&self) -> usize {
        let entries: Vec<OutboxEntry> = self
            .store
            .outbox_entries()
            .into_iter()
            .filter(|entry| !self.is_delivering(&entry.notification.id))
            .collect();
        if entries.is_empty() {
            return 0;
        }
        tracing::debug!(pending = entries.len(), "Flushing notification outbox");

        let single = RetryPolicy {
            attempts: 1,
            ..self.retry
        };
        let mut delivered = 0;
        for entry in entries {
            if self.attempt(entry, single).await.is_complete() {
                delivered += 1;
            }
        }
        delivered
    }

    fn delivering(&self, id: &str) -> Delivering<'_> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        Delivering {
            set: &self.in_flight,
            id: id.to_string(),
        }
    }

    fn is_delivering(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    async fn attempt(&self, mut entry: OutboxEntry, retry: RetryPolicy) -> DeliveryResult {
        let notification = &entry.notification;
        let mut result = DeliveryResult {
            notification_id: notification.id.clone(),
            ..DeliveryResult::default()
        };

        for sink in &self.sinks {
            let name = sink.name();
            if !entry.pending_sinks.iter().any(|s| s == name) {
                continue;
            }
            match deliver_with_retry(sink.as_ref(), notification, retry).await {
                Ok(()) => result.delivered.push(name.to_string()),
                Err(e) => {
                    tracing::warn!(
                        sink = name,
                        event = %notification.event,
                        subject = %notification.subject,
                        error = %e,
                        "Notification delivery failed"
                    );
                    result.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        let id = notification.id.clone();
        let persisted = if result.failed.is_empty() {
            self.store.delete_outbox(&id)
        } else {
            entry
                .pending_sinks
                .retain(|s| !result.delivered.iter().any(|d| d == s));
            entry.attempts += 1;
            entry.last_error = result.failed.first().map(|(_, e)| e.clone());
            self.store.put_outbox(entry)
        };
        if let Err(e) = persisted {
            tracing::warn!(error = %e, notification_id = %id, "Failed to update notification outbox");
        }

        result
    }
}

async fn deliver_with_retry(
    sink: &dyn NotificationSink,
    notification: &Notification,
    retry: RetryPolicy,
) -> Result<(), DeliveryError> {
    let attempts = retry.attempts.max(1);
    let mut delay = retry.base_delay;
    let mut last = None;
    for attempt in 1..=attempts {
        match sink.deliver(notification).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(sink = sink.name(), attempt, error = %e, "Delivery attempt failed");
                last = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }
    Err(last.unwrap_or_else(|| DeliveryError::Request("no delivery attempt made".to_string())))
}
