// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sync Ingestor
//!
//! Merges lock records arriving from two upstream channels (a periodic poll
//! of the bank feed and the realtime [`LockSubscription`]) into the
//! [`LockStore`].
//!
//! ## Pipeline
//!
//! 1. [`SyncIngestor::ingest`] normalizes raw records and turns each event
//!    into at most one [`LockStoreMutation`]. Pure with respect to the store.
//! 2. [`SyncIngestor::apply`] commits the mutations and fires `new_lock`,
//!    `lock_approved` and `lock_minted` notifications for real transitions.
//!
//! ## De-duplication
//!
//! Every event is fingerprinted over its kind and canonical JSON body,
//! independent of the channel it came from. A fingerprint already applied is
//! dropped, so the same record seen by both channels converges to one lock.
//! Creation is insert-if-absent by lock id, which covers fingerprint misses
//! after a restart.

pub mod normalize;
pub mod runner;
pub mod subscription;

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::models::{Lock, LockStatus};
use crate::notify::{NotificationEvent, NotificationRelay};
use crate::storage::LockStore;

pub use normalize::{ChainDefaults, LockPatch, NormalizeError};
pub use runner::{HttpLockFeed, LockFeed, SyncRunner};
pub use subscription::{events_from_message, LockSubscription};

const SEEN_CAPACITY: usize = 10_000;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncChannel {
    Poll,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpstreamEventKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamLockEvent {
    pub channel: SyncChannel,
    pub kind: UpstreamEventKind,
    pub record: Value,
}

impl UpstreamLockEvent {
    pub fn push(kind: UpstreamEventKind, record: Value) -> Self {
        Self {
            channel: SyncChannel::Push,
            kind,
            record,
        }
    }

    /// Channel-independent identity of the event.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(match self.kind {
            UpstreamEventKind::Insert => b"insert".as_slice(),
            UpstreamEventKind::Update => b"update".as_slice(),
        });
        hasher.update([0x1f]);
        let mut canonical = String::new();
        write_canonical(&self.record, &mut canonical);
        hasher.update(canonical.as_bytes());
        alloy::hex::encode(hasher.finalize())
    }
}

/// Compact JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockStoreMutation {
    Create {
        lock: Lock,
        fingerprint: String,
    },
    Merge {
        lock_id: String,
        patch: LockPatch,
        fingerprint: String,
    },
}

impl LockStoreMutation {
    pub fn lock_id(&self) -> &str {
        match self {
            Self::Create { lock, .. } => &lock.lock_id,
            Self::Merge { lock_id, .. } => lock_id,
        }
    }

    fn fingerprint(&self) -> &str {
        match self {
            Self::Create { fingerprint, .. } | Self::Merge { fingerprint, .. } => fingerprint,
        }
    }
}

/// Outcome counts of one [`SyncIngestor::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub failed: usize,
}

// =============================================================================
// Ingestor
// =============================================================================

pub struct SyncIngestor {
    store: Arc<LockStore>,
    relay: Arc<NotificationRelay>,
    defaults: ChainDefaults,
    seen: Mutex<LruCache<String, ()>>,
}

impl SyncIngestor {
    pub fn new(store: Arc<LockStore>, relay: Arc<NotificationRelay>, defaults: ChainDefaults) -> Self {
        let capacity = NonZeroUsize::new(SEEN_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            relay,
            defaults,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Turn a polled snapshot into events: unknown locks are inserts, known
    /// ones updates.
    pub fn events_from_snapshot(&self, records: Vec<Value>) -> Vec<UpstreamLockEvent> {
        records
            .into_iter()
            .map(|record| {
                let known = normalize::lock_id(&record).is_some_and(|id| self.store.contains_lock(&id));
                UpstreamLockEvent {
                    channel: SyncChannel::Poll,
                    kind: if known {
                        UpstreamEventKind::Update
                    } else {
                        UpstreamEventKind::Insert
                    },
                    record,
                }
            })
            .collect()
    }

    /// Map upstream events to store mutations.
    ///
    /// Inserts of known locks and updates of unknown locks are dropped, as
    /// are events whose fingerprint was already applied or repeats earlier in
    /// the same batch.
    pub fn ingest(&self, events: Vec<UpstreamLockEvent>) -> Vec<LockStoreMutation> {
        let mut batch_fingerprints = HashSet::new();
        let mut batch_creates = HashSet::new();
        let mut mutations = Vec::new();

        for event in events {
            let fingerprint = event.fingerprint();
            if self.was_seen(&fingerprint) || !batch_fingerprints.insert(fingerprint.clone()) {
                debug!(channel = ?event.channel, "Duplicate upstream event dropped");
                continue;
            }

            match event.kind {
                UpstreamEventKind::Insert => {
                    let lock = match normalize::normalize_lock(&event.record, &self.defaults) {
                        Ok(lock) => lock,
                        Err(e) => {
                            warn!(channel = ?event.channel, error = %e, "Upstream lock rejected");
                            continue;
                        }
                    };
                    if self.store.contains_lock(&lock.lock_id)
                        || !batch_creates.insert(lock.lock_id.clone())
                    {
                        debug!(lock_id = %lock.lock_id, "Insert for known lock dropped");
                        continue;
                    }
                    mutations.push(LockStoreMutation::Create { lock, fingerprint });
                }
                UpstreamEventKind::Update => {
                    let Some(lock_id) = normalize::lock_id(&event.record) else {
                        warn!(channel = ?event.channel, "Upstream update without lock id dropped");
                        continue;
                    };
                    if !self.store.contains_lock(&lock_id) && !batch_creates.contains(&lock_id) {
                        warn!(lock_id = %lock_id, channel = ?event.channel, "Update for unknown lock dropped");
                        continue;
                    }
                    let patch = normalize::normalize_patch(&event.record, &self.defaults);
                    mutations.push(LockStoreMutation::Merge {
                        lock_id,
                        patch,
                        fingerprint,
                    });
                }
            }
        }

        mutations
    }

    /// Commit mutations one by one. Failures are logged and counted; the
    /// event stays unseen so a redelivery can retry it.
    pub async fn apply(&self, mutations: Vec<LockStoreMutation>) -> SyncReport {
        let mut report = SyncReport::default();

        for mutation in mutations {
            let fingerprint = mutation.fingerprint().to_string();
            let lock_id = mutation.lock_id().to_string();

            let outcome = match mutation {
                LockStoreMutation::Create { lock, .. } => self.apply_create(lock).await,
                LockStoreMutation::Merge { lock_id, patch, .. } => {
                    self.apply_merge(&lock_id, &patch).await
                }
            };

            match outcome {
                Ok(Applied::Created) => report.created += 1,
                Ok(Applied::Merged) => report.merged += 1,
                Ok(Applied::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    warn!(lock_id = %lock_id, error = %e, "Failed to apply upstream lock");
                    report.failed += 1;
                    continue;
                }
            }
            self.mark_seen(fingerprint);
        }

        if report.created + report.merged > 0 {
            info!(
                created = report.created,
                merged = report.merged,
                unchanged = report.unchanged,
                failed = report.failed,
                "Upstream locks applied"
            );
        }
        report
    }

    /// `ingest` followed by `apply`.
    pub async fn process(&self, events: Vec<UpstreamLockEvent>) -> SyncReport {
        let mutations = self.ingest(events);
        if mutations.is_empty() {
            return SyncReport::default();
        }
        self.apply(mutations).await
    }

    async fn apply_create(&self, lock: Lock) -> crate::error::SettlementResult<Applied> {
        let payload = lock_payload(&lock);
        let lock_id = lock.lock_id.clone();
        if !self.store.create_lock(lock)? {
            return Ok(Applied::Unchanged);
        }
        info!(lock_id = %lock_id, "New lock ingested");
        self.relay
            .notify(NotificationEvent::NewLock, &lock_id, payload)
            .await;
        Ok(Applied::Created)
    }

    async fn apply_merge(
        &self,
        lock_id: &str,
        patch: &LockPatch,
    ) -> crate::error::SettlementResult<Applied> {
        let Some(mut preview) = self.store.lock(lock_id) else {
            return Err(crate::error::SettlementError::not_found("lock", lock_id));
        };
        if !patch.apply(&mut preview) {
            return Ok(Applied::Unchanged);
        }

        let mut before = None;
        let merged = self.store.update_lock(lock_id, |lock| {
            before = Some(lock.status);
            patch.apply(lock);
        })?;

        let transitioned = before.is_some_and(|b| b != merged.status);
        if transitioned {
            info!(lock_id, status = %merged.status, "Upstream status merged");
            let event = match merged.status {
                LockStatus::Approved => Some(NotificationEvent::LockApproved),
                LockStatus::Minted => Some(NotificationEvent::LockMinted),
                LockStatus::Pending | LockStatus::Rejected => None,
            };
            if let Some(event) = event {
                self.relay.notify(event, lock_id, lock_payload(&merged)).await;
            }
        }
        Ok(Applied::Merged)
    }

    fn was_seen(&self, fingerprint: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(fingerprint)
    }

    fn mark_seen(&self, fingerprint: String) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(fingerprint, ());
    }
}

enum Applied {
    Created,
    Merged,
    Unchanged,
}

fn lock_payload(lock: &Lock) -> Value {
    serde_json::json!({
        "lock_id": lock.lock_id,
        "authorization_code": lock.authorization_code,
        "amount": lock.amount.to_string(),
        "currency": lock.currency,
        "beneficiary": lock.beneficiary,
        "bank_name": lock.bank_name,
        "status": lock.status,
    })
}
