// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Keyed settlement store with synchronous write-through.
//!
//! Every mutation goes through [`LockStore::commit`]:
//!
//! 1. Each [`StoreMutation`] is validated against the current state and
//!    applied to the in-memory maps, recording how to undo it.
//! 2. The whole batch is serialized and handed to the [`DurableBackend`] as
//!    one atomic write.
//! 3. If validation or the durable write fails, the applied mutations are
//!    undone in reverse order and the error is returned.
//!
//! Store-level invariants enforced here: positive lock amounts, unique
//! authorization codes, monotonic lock status, balanced reserves, immutable
//! terminal queue items and rejections, and at most one confirmation per
//! authorization code.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{DurableBackend, EntityKind, StorageError, StorageResult, WriteOp};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    Lock, LockReserve, LockStatus, MintConfirmation, MintQueueItem, MintStatus, RejectedLock,
    ReserveStatus, Verification,
};
use crate::notify::OutboxEntry;

// =============================================================================
// Mutations
// =============================================================================

/// One change to the store. A `Vec` of these commits atomically.
#[derive(Debug, Clone)]
pub enum StoreMutation {
    PutLock(Lock),
    PutReserve(LockReserve),
    PutQueueItem(MintQueueItem),
    PutConfirmation(MintConfirmation),
    PutRejection(RejectedLock),
    PutOutbox(OutboxEntry),
    /// Only outbox entries may be deleted; settlement records are permanent.
    Delete { kind: EntityKind, key: String },
    /// Fail the batch unless the lock currently has `status`.
    ExpectLockStatus { lock_id: String, status: LockStatus },
    /// Fail the batch unless the queue item currently has `status`.
    ExpectQueueStatus { item_id: String, status: MintStatus },
    /// Fail the batch unless the reserve currently has `status`.
    ExpectReserveStatus {
        reserve_id: String,
        status: ReserveStatus,
    },
}

impl StoreMutation {
    fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ExpectLockStatus { .. }
                | Self::ExpectQueueStatus { .. }
                | Self::ExpectReserveStatus { .. }
        )
    }
}

enum Undo {
    Nothing,
    Lock(String, Option<Lock>),
    Reserve(String, Option<LockReserve>),
    QueueItem(String, Option<MintQueueItem>),
    Confirmation(String, Option<MintConfirmation>),
    Rejection(String, Option<RejectedLock>),
    Outbox(String, Option<OutboxEntry>),
}

/// Record counts per entity and status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub locks: HashMap<String, usize>,
    pub reserves: HashMap<String, usize>,
    pub queue: HashMap<String, usize>,
    pub confirmations: usize,
    pub rejections: usize,
    pub outbox: usize,
    pub unverified: usize,
}

#[derive(Default)]
struct StoreState {
    locks: HashMap<String, Lock>,
    /// authorization_code -> lock_id
    auth_index: HashMap<String, String>,
    reserves: HashMap<String, LockReserve>,
    queue: HashMap<String, MintQueueItem>,
    /// Keyed by authorization code.
    confirmations: HashMap<String, MintConfirmation>,
    rejections: HashMap<String, RejectedLock>,
    outbox: HashMap<String, OutboxEntry>,
}

// =============================================================================
// LockStore
// =============================================================================

pub struct LockStore {
    state: Mutex<StoreState>,
    backend: Arc<dyn DurableBackend>,
}

impl LockStore {
    /// Rehydrate the in-memory maps from the backend.
    ///
    /// Must complete before the ingestor or engine touch the store.
    pub fn open(backend: Arc<dyn DurableBackend>) -> StorageResult<Self> {
        let mut state = StoreState::default();

        for lock in load::<Lock>(backend.as_ref(), EntityKind::Lock)? {
            state
                .auth_index
                .insert(lock.authorization_code.clone(), lock.lock_id.clone());
            state.locks.insert(lock.lock_id.clone(), lock);
        }
        for reserve in load::<LockReserve>(backend.as_ref(), EntityKind::Reserve)? {
            state.reserves.insert(reserve.id.clone(), reserve);
        }
        for item in load::<MintQueueItem>(backend.as_ref(), EntityKind::QueueItem)? {
            state.queue.insert(item.id.clone(), item);
        }
        for confirmation in load::<MintConfirmation>(backend.as_ref(), EntityKind::Confirmation)? {
            state
                .confirmations
                .insert(confirmation.authorization_code.clone(), confirmation);
        }
        for rejection in load::<RejectedLock>(backend.as_ref(), EntityKind::Rejection)? {
            state.rejections.insert(rejection.lock_id.clone(), rejection);
        }
        for entry in load::<OutboxEntry>(backend.as_ref(), EntityKind::Outbox)? {
            state.outbox.insert(entry.notification.id.clone(), entry);
        }

        tracing::info!(
            locks = state.locks.len(),
            reserves = state.reserves.len(),
            queue = state.queue.len(),
            confirmations = state.confirmations.len(),
            outbox = state.outbox.len(),
            "Lock store rehydrated"
        );

        Ok(Self {
            state: Mutex::new(state),
            backend,
        })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a batch of mutations atomically.
    pub fn commit(&self, mutations: Vec<StoreMutation>) -> SettlementResult<()> {
        let mut state = self.state();
        self.commit_locked(&mut state, mutations)
    }

    fn commit_locked(
        &self,
        state: &mut StoreState,
        mutations: Vec<StoreMutation>,
    ) -> SettlementResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }

        let mut undo_log = Vec::with_capacity(mutations.len());
        for mutation in &mutations {
            match apply(state, mutation.clone()) {
                Ok(undo) => undo_log.push(undo),
                Err(e) => {
                    rollback(state, undo_log);
                    return Err(e);
                }
            }
        }

        let persisted = write_ops(&mutations).and_then(|ops| self.backend.write_batch(&ops));
        if let Err(e) = persisted {
            tracing::warn!(
                error = %e,
                mutations = mutations.len(),
                "Durable write failed, rolling back"
            );
            rollback(state, undo_log);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn put_lock(&self, lock: Lock) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutLock(lock)])
    }

    pub fn put_reserve(&self, reserve: LockReserve) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutReserve(reserve)])
    }

    pub fn put_queue_item(&self, item: MintQueueItem) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutQueueItem(item)])
    }

    pub fn put_confirmation(&self, confirmation: MintConfirmation) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutConfirmation(confirmation)])
    }

    pub fn put_rejection(&self, rejection: RejectedLock) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutRejection(rejection)])
    }

    pub fn delete(&self, kind: EntityKind, key: &str) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::Delete {
            kind,
            key: key.to_string(),
        }])
    }

    /// Insert a lock unless one with the same id already exists.
    ///
    /// Returns `false` when the lock was already present.
    pub fn create_lock(&self, lock: Lock) -> SettlementResult<bool> {
        let mut state = self.state();
        if state.locks.contains_key(&lock.lock_id) {
            return Ok(false);
        }
        self.commit_locked(&mut state, vec![StoreMutation::PutLock(lock)])?;
        Ok(true)
    }

    /// Read-modify-write a lock under the store lock.
    pub fn update_lock<F>(&self, lock_id: &str, f: F) -> SettlementResult<Lock>
    where
        F: FnOnce(&mut Lock),
    {
        let mut state = self.state();
        let mut lock = state
            .locks
            .get(lock_id)
            .cloned()
            .ok_or_else(|| SettlementError::not_found("lock", lock_id))?;
        f(&mut lock);
        lock.updated_at = Utc::now();
        self.commit_locked(&mut state, vec![StoreMutation::PutLock(lock.clone())])?;
        Ok(lock)
    }

    /// Clear the unverified flag once reconciliation has confirmed a record.
    ///
    /// `key` is the record id, or the authorization code for confirmations.
    pub fn mark_verified(&self, kind: EntityKind, key: &str) -> SettlementResult<()> {
        let mut state = self.state();
        let mutation = match kind {
            EntityKind::Lock => state.locks.get(key).cloned().map(|mut l| {
                l.verification = Verification::Verified;
                l.updated_at = Utc::now();
                StoreMutation::PutLock(l)
            }),
            EntityKind::Reserve => state.reserves.get(key).cloned().map(|mut r| {
                r.verification = Verification::Verified;
                r.updated_at = Utc::now();
                StoreMutation::PutReserve(r)
            }),
            EntityKind::QueueItem => state.queue.get(key).cloned().map(|mut q| {
                q.verification = Verification::Verified;
                q.updated_at = Utc::now();
                StoreMutation::PutQueueItem(q)
            }),
            EntityKind::Confirmation => state.confirmations.get(key).cloned().map(|mut c| {
                c.verification = Verification::Verified;
                StoreMutation::PutConfirmation(c)
            }),
            EntityKind::Rejection | EntityKind::Outbox => {
                return Err(SettlementError::validation(format!(
                    "{} records carry no verification flag",
                    kind.table_name()
                )));
            }
        };
        let mutation = mutation.ok_or_else(|| SettlementError::not_found(kind.table_name(), key))?;
        self.commit_locked(&mut state, vec![mutation])?;
        tracing::info!(table = kind.table_name(), key, "Record marked verified");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn lock(&self, lock_id: &str) -> Option<Lock> {
        self.state().locks.get(lock_id).cloned()
    }

    pub fn contains_lock(&self, lock_id: &str) -> bool {
        self.state().locks.contains_key(lock_id)
    }

    pub fn find_by_authorization_code(&self, code: &str) -> Option<Lock> {
        let state = self.state();
        state
            .auth_index
            .get(code)
            .and_then(|lock_id| state.locks.get(lock_id))
            .cloned()
    }

    pub fn reserve(&self, reserve_id: &str) -> Option<LockReserve> {
        self.state().reserves.get(reserve_id).cloned()
    }

    pub fn reserve_for_lock(&self, lock_id: &str) -> Option<LockReserve> {
        self.state()
            .reserves
            .values()
            .find(|r| r.original_lock_id == lock_id)
            .cloned()
    }

    pub fn queue_item(&self, item_id: &str) -> Option<MintQueueItem> {
        self.state().queue.get(item_id).cloned()
    }

    pub fn queue_items_for_lock(&self, lock_id: &str) -> Vec<MintQueueItem> {
        let mut items: Vec<_> = self
            .state()
            .queue
            .values()
            .filter(|q| q.lock_id == lock_id)
            .cloned()
            .collect();
        items.sort_by_key(|q| q.created_at);
        items
    }

    pub fn confirmation(&self, authorization_code: &str) -> Option<MintConfirmation> {
        self.state().confirmations.get(authorization_code).cloned()
    }

    pub fn rejection(&self, lock_id: &str) -> Option<RejectedLock> {
        self.state().rejections.get(lock_id).cloned()
    }

    pub fn list_locks_by_status(&self, status: LockStatus) -> Vec<Lock> {
        let mut locks: Vec<_> = self
            .state()
            .locks
            .values()
            .filter(|l| l.status == status)
            .cloned()
            .collect();
        locks.sort_by_key(|l| l.created_at);
        locks
    }

    pub fn list_reserves_by_status(&self, status: ReserveStatus) -> Vec<LockReserve> {
        let mut reserves: Vec<_> = self
            .state()
            .reserves
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        reserves.sort_by_key(|r| r.created_at);
        reserves
    }

    pub fn list_queue_by_status(&self, status: MintStatus) -> Vec<MintQueueItem> {
        let mut items: Vec<_> = self
            .state()
            .queue
            .values()
            .filter(|q| q.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|q| q.created_at);
        items
    }

    pub fn list_confirmations(&self) -> Vec<MintConfirmation> {
        let mut confirmations: Vec<_> = self.state().confirmations.values().cloned().collect();
        confirmations.sort_by_key(|c| c.minted_at);
        confirmations
    }

    pub fn list_rejections(&self) -> Vec<RejectedLock> {
        let mut rejections: Vec<_> = self.state().rejections.values().cloned().collect();
        rejections.sort_by_key(|r| r.rejected_at);
        rejections
    }

    // -------------------------------------------------------------------------
    // Reconciliation queries
    // -------------------------------------------------------------------------

    pub fn list_unverified_locks(&self) -> Vec<Lock> {
        let mut locks: Vec<_> = self
            .state()
            .locks
            .values()
            .filter(|l| l.verification.is_unverified())
            .cloned()
            .collect();
        locks.sort_by_key(|l| l.created_at);
        locks
    }

    pub fn list_unverified_reserves(&self) -> Vec<LockReserve> {
        let mut reserves: Vec<_> = self
            .state()
            .reserves
            .values()
            .filter(|r| r.verification.is_unverified())
            .cloned()
            .collect();
        reserves.sort_by_key(|r| r.created_at);
        reserves
    }

    pub fn list_unverified_queue_items(&self) -> Vec<MintQueueItem> {
        let mut items: Vec<_> = self
            .state()
            .queue
            .values()
            .filter(|q| q.verification.is_unverified())
            .cloned()
            .collect();
        items.sort_by_key(|q| q.created_at);
        items
    }

    pub fn list_unverified_confirmations(&self) -> Vec<MintConfirmation> {
        let mut confirmations: Vec<_> = self
            .state()
            .confirmations
            .values()
            .filter(|c| c.verification.is_unverified())
            .cloned()
            .collect();
        confirmations.sort_by_key(|c| c.minted_at);
        confirmations
    }

    // -------------------------------------------------------------------------
    // Outbox
    // -------------------------------------------------------------------------

    pub fn put_outbox(&self, entry: OutboxEntry) -> SettlementResult<()> {
        self.commit(vec![StoreMutation::PutOutbox(entry)])
    }

    pub fn delete_outbox(&self, notification_id: &str) -> SettlementResult<()> {
        self.delete(EntityKind::Outbox, notification_id)
    }

    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<_> = self.state().outbox.values().cloned().collect();
        entries.sort_by_key(|e| e.notification.created_at);
        entries
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state();
        let mut stats = StoreStats::default();
        for lock in state.locks.values() {
            *stats.locks.entry(lock.status.to_string()).or_default() += 1;
        }
        for reserve in state.reserves.values() {
            *stats.reserves.entry(reserve.status.to_string()).or_default() += 1;
        }
        for item in state.queue.values() {
            *stats.queue.entry(item.status.to_string()).or_default() += 1;
        }
        stats.confirmations = state.confirmations.len();
        stats.rejections = state.rejections.len();
        stats.outbox = state.outbox.len();
        stats.unverified = state
            .locks
            .values()
            .filter(|l| l.verification.is_unverified())
            .count()
            + state
                .reserves
                .values()
                .filter(|r| r.verification.is_unverified())
                .count()
            + state
                .queue
                .values()
                .filter(|q| q.verification.is_unverified())
                .count()
            + state
                .confirmations
                .values()
                .filter(|c| c.verification.is_unverified())
                .count();
        stats
    }
}

// =============================================================================
// Apply / Undo
// =============================================================================

fn apply(state: &mut StoreState, mutation: StoreMutation) -> SettlementResult<Undo> {
    match mutation {
        StoreMutation::ExpectLockStatus { lock_id, status } => {
            let actual = state
                .locks
                .get(&lock_id)
                .ok_or_else(|| SettlementError::not_found("lock", &lock_id))?
                .status;
            if actual != status {
                return Err(SettlementError::conflict("lock", lock_id, status, actual));
            }
            Ok(Undo::Nothing)
        }
        StoreMutation::ExpectQueueStatus { item_id, status } => {
            let actual = state
                .queue
                .get(&item_id)
                .ok_or_else(|| SettlementError::not_found("queue item", &item_id))?
                .status;
            if actual != status {
                return Err(SettlementError::conflict("queue item", item_id, status, actual));
            }
            Ok(Undo::Nothing)
        }
        StoreMutation::ExpectReserveStatus { reserve_id, status } => {
            let actual = state
                .reserves
                .get(&reserve_id)
                .ok_or_else(|| SettlementError::not_found("reserve", &reserve_id))?
                .status;
            if actual != status {
                return Err(SettlementError::conflict("reserve", reserve_id, status, actual));
            }
            Ok(Undo::Nothing)
        }
        StoreMutation::PutLock(lock) => {
            if lock.amount <= Decimal::ZERO {
                return Err(SettlementError::validation(format!(
                    "lock {} amount must be positive",
                    lock.lock_id
                )));
            }
            match state.locks.get(&lock.lock_id) {
                Some(existing) => {
                    if existing.authorization_code != lock.authorization_code {
                        return Err(SettlementError::validation(format!(
                            "authorization code of lock {} cannot change",
                            lock.lock_id
                        )));
                    }
                    if !existing.status.can_advance_to(lock.status) {
                        return Err(SettlementError::conflict(
                            "lock",
                            &lock.lock_id,
                            format!("a status reachable from {}", existing.status),
                            lock.status,
                        ));
                    }
                }
                None => {
                    if state.auth_index.contains_key(&lock.authorization_code) {
                        return Err(SettlementError::validation(format!(
                            "authorization code {} already in use",
                            lock.authorization_code
                        )));
                    }
                    state
                        .auth_index
                        .insert(lock.authorization_code.clone(), lock.lock_id.clone());
                }
            }
            let key = lock.lock_id.clone();
            let previous = state.locks.insert(key.clone(), lock);
            Ok(Undo::Lock(key, previous))
        }
        StoreMutation::PutReserve(reserve) => {
            if !reserve.is_balanced() {
                return Err(SettlementError::validation(format!(
                    "reserve {} is unbalanced: {} consumed + {} remaining != {}",
                    reserve.id,
                    reserve.consumed_amount,
                    reserve.remaining_amount,
                    reserve.original_amount
                )));
            }
            if let Some(existing) = state.reserves.get(&reserve.id) {
                if existing.status == ReserveStatus::FullyConsumed
                    && reserve.status != ReserveStatus::FullyConsumed
                {
                    return Err(SettlementError::conflict(
                        "reserve",
                        &reserve.id,
                        ReserveStatus::FullyConsumed,
                        reserve.status,
                    ));
                }
            }
            let key = reserve.id.clone();
            let previous = state.reserves.insert(key.clone(), reserve);
            Ok(Undo::Reserve(key, previous))
        }
        StoreMutation::PutQueueItem(item) => {
            if item.amount_usd <= Decimal::ZERO {
                return Err(SettlementError::validation(format!(
                    "queue item {} amount must be positive",
                    item.id
                )));
            }
            if let Some(existing) = state.queue.get(&item.id) {
                if existing.status.is_terminal()
                    && (existing.status != item.status || existing.amount_usd != item.amount_usd)
                {
                    return Err(SettlementError::conflict(
                        "queue item",
                        &item.id,
                        existing.status,
                        item.status,
                    ));
                }
            }
            let key = item.id.clone();
            let previous = state.queue.insert(key.clone(), item);
            Ok(Undo::QueueItem(key, previous))
        }
        StoreMutation::PutConfirmation(confirmation) => {
            if let Some(existing) = state.confirmations.get(&confirmation.authorization_code) {
                if existing.id != confirmation.id {
                    return Err(SettlementError::conflict(
                        "confirmation",
                        &confirmation.authorization_code,
                        "no confirmation",
                        &existing.id,
                    ));
                }
            }
            let key = confirmation.authorization_code.clone();
            let previous = state.confirmations.insert(key.clone(), confirmation);
            Ok(Undo::Confirmation(key, previous))
        }
        StoreMutation::PutRejection(rejection) => {
            if let Some(existing) = state.rejections.get(&rejection.lock_id) {
                if *existing != rejection {
                    return Err(SettlementError::conflict(
                        "rejection",
                        &rejection.lock_id,
                        "no rejection",
                        "rejected",
                    ));
                }
            }
            let key = rejection.lock_id.clone();
            let previous = state.rejections.insert(key.clone(), rejection);
            Ok(Undo::Rejection(key, previous))
        }
        StoreMutation::PutOutbox(entry) => {
            let key = entry.notification.id.clone();
            let previous = state.outbox.insert(key.clone(), entry);
            Ok(Undo::Outbox(key, previous))
        }
        StoreMutation::Delete { kind, key } => {
            if kind != EntityKind::Outbox {
                return Err(SettlementError::validation(format!(
                    "{} records are never deleted",
                    kind.table_name()
                )));
            }
            let previous = state.outbox.remove(&key);
            Ok(Undo::Outbox(key, previous))
        }
    }
}

fn rollback(state: &mut StoreState, undo_log: Vec<Undo>) {
    for undo in undo_log.into_iter().rev() {
        match undo {
            Undo::Nothing => {}
            Undo::Lock(key, previous) => match previous {
                Some(lock) => {
                    state.locks.insert(key, lock);
                }
                None => {
                    if let Some(removed) = state.locks.remove(&key) {
                        state.auth_index.remove(&removed.authorization_code);
                    }
                }
            },
            Undo::Reserve(key, previous) => restore(&mut state.reserves, key, previous),
            Undo::QueueItem(key, previous) => restore(&mut state.queue, key, previous),
            Undo::Confirmation(key, previous) => restore(&mut state.confirmations, key, previous),
            Undo::Rejection(key, previous) => restore(&mut state.rejections, key, previous),
            Undo::Outbox(key, previous) => restore(&mut state.outbox, key, previous),
        }
    }
}

fn restore<T>(map: &mut HashMap<String, T>, key: String, previous: Option<T>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

// =============================================================================
// Serialization
// =============================================================================

fn write_ops(mutations: &[StoreMutation]) -> StorageResult<Vec<WriteOp>> {
    mutations
        .iter()
        .filter(|mutation| !mutation.is_precondition())
        .map(|mutation| -> StorageResult<WriteOp> {
            let (kind, key, value) = match mutation {
                StoreMutation::PutLock(l) => (EntityKind::Lock, &l.lock_id, serde_json::to_vec(l)?),
                StoreMutation::PutReserve(r) => (EntityKind::Reserve, &r.id, serde_json::to_vec(r)?),
                StoreMutation::PutQueueItem(q) => {
                    (EntityKind::QueueItem, &q.id, serde_json::to_vec(q)?)
                }
                StoreMutation::PutConfirmation(c) => (
                    EntityKind::Confirmation,
                    &c.authorization_code,
                    serde_json::to_vec(c)?,
                ),
                StoreMutation::PutRejection(r) => {
                    (EntityKind::Rejection, &r.lock_id, serde_json::to_vec(r)?)
                }
                StoreMutation::PutOutbox(e) => (
                    EntityKind::Outbox,
                    &e.notification.id,
                    serde_json::to_vec(e)?,
                ),
                StoreMutation::Delete { kind, key } => {
                    return Ok(WriteOp::Delete {
                        kind: *kind,
                        key: key.clone(),
                    });
                }
                StoreMutation::ExpectLockStatus { .. }
                | StoreMutation::ExpectQueueStatus { .. }
                | StoreMutation::ExpectReserveStatus { .. } => {
                    return Err(StorageError::Backend(
                        "precondition has no durable form".to_string(),
                    ));
                }
            };
            Ok(WriteOp::Put {
                kind,
                key: key.clone(),
                value,
            })
        })
        .collect()
}

fn load<T: DeserializeOwned>(
    backend: &dyn DurableBackend,
    kind: EntityKind,
) -> StorageResult<Vec<T>> {
    backend
        .load_all(kind)?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StorageError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DEFAULT_CURRENCY, SignatureChain};
    use crate::storage::{MemoryBackend, RedbBackend};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn lock(id: &str, code: &str, amount: &str) -> Lock {
        let now = Utc::now();
        Lock {
            lock_id: id.into(),
            authorization_code: code.into(),
            amount: dec(amount),
            currency: DEFAULT_CURRENCY.into(),
            beneficiary: "0x00000000000000000000000000000000000000a1".into(),
            bank_id: None,
            bank_name: "Test Bank".into(),
            custody_vault_ref: None,
            expiry: None,
            status: LockStatus::Pending,
            signatures: vec![],
            chain_refs: None,
            approved_amount: None,
            verification: Verification::Verified,
            created_at: now,
            updated_at: now,
        }
    }

    fn queue_item(id: &str, lock_id: &str, amount: &str) -> MintQueueItem {
        let now = Utc::now();
        MintQueueItem {
            id: id.into(),
            authorization_code: format!("AUTH-{id}"),
            amount_usd: dec(amount),
            currency: DEFAULT_CURRENCY.into(),
            lock_id: lock_id.into(),
            reserve_id: None,
            bank_name: "Test Bank".into(),
            beneficiary: "0xabc".into(),
            status: MintStatus::Pending,
            signature_chain: SignatureChain::default(),
            iso_metadata: None,
            verification: Verification::Verified,
            created_at: now,
            updated_at: now,
        }
    }

    fn memory_store() -> (LockStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = LockStore::open(backend.clone()).unwrap();
        (store, backend)
    }

    #[test]
    fn create_lock_is_insert_if_absent() {
        let (store, _) = memory_store();
        assert!(store.create_lock(lock("L1", "AUTH-1", "100")).unwrap());
        assert!(!store.create_lock(lock("L1", "AUTH-1", "999")).unwrap());
        assert_eq!(store.lock("L1").unwrap().amount, dec("100"));
        assert_eq!(
            store.find_by_authorization_code("AUTH-1").unwrap().lock_id,
            "L1"
        );
    }

    #[test]
    fn rejects_non_positive_amount_and_duplicate_code() {
        let (store, _) = memory_store();
        let err = store.put_lock(lock("L0", "AUTH-0", "0")).unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));

        store.put_lock(lock("L1", "AUTH-1", "10")).unwrap();
        let err = store.put_lock(lock("L2", "AUTH-1", "10")).unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
        assert!(store.lock("L2").is_none());
    }

    #[test]
    fn status_never_moves_backwards() {
        let (store, _) = memory_store();
        store.put_lock(lock("L1", "AUTH-1", "10")).unwrap();
        store
            .update_lock("L1", |l| l.status = LockStatus::Approved)
            .unwrap();
        let err = store
            .update_lock("L1", |l| l.status = LockStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, SettlementError::StateConflict { .. }));
        assert_eq!(store.lock("L1").unwrap().status, LockStatus::Approved);
    }

    #[test]
    fn failed_durable_write_rolls_back_whole_batch() {
        let (store, backend) = memory_store();
        store.put_lock(lock("L1", "AUTH-1", "10")).unwrap();

        backend.set_fail_writes(true);
        let mut approved = store.lock("L1").unwrap();
        approved.status = LockStatus::Approved;
        let err = store
            .commit(vec![
                StoreMutation::PutLock(approved),
                StoreMutation::PutQueueItem(queue_item("Q1", "L1", "10")),
                StoreMutation::PutLock(lock("L2", "AUTH-2", "5")),
            ])
            .unwrap_err();
        assert!(matches!(err, SettlementError::Storage(_)));

        assert_eq!(store.lock("L1").unwrap().status, LockStatus::Pending);
        assert!(store.queue_item("Q1").is_none());
        assert!(store.lock("L2").is_none());
        assert!(store.find_by_authorization_code("AUTH-2").is_none());
    }

    #[test]
    fn invalid_mutation_mid_batch_undoes_earlier_ones() {
        let (store, backend) = memory_store();
        let err = store
            .commit(vec![
                StoreMutation::PutLock(lock("L1", "AUTH-1", "10")),
                StoreMutation::PutQueueItem(queue_item("Q1", "L1", "-1")),
            ])
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
        assert!(store.lock("L1").is_none());
        assert_eq!(backend.committed_batches(), 0);
    }

    #[test]
    fn failed_precondition_aborts_batch() {
        let (store, backend) = memory_store();
        store.put_lock(lock("L1", "AUTH-1", "10")).unwrap();
        store
            .update_lock("L1", |l| l.status = LockStatus::Approved)
            .unwrap();
        let batches = backend.committed_batches();

        let err = store
            .commit(vec![
                StoreMutation::ExpectLockStatus {
                    lock_id: "L1".into(),
                    status: LockStatus::Pending,
                },
                StoreMutation::PutQueueItem(queue_item("Q1", "L1", "10")),
            ])
            .unwrap_err();
        assert!(matches!(err, SettlementError::StateConflict { .. }));
        assert!(store.queue_item("Q1").is_none());
        assert_eq!(backend.committed_batches(), batches);

        store
            .commit(vec![
                StoreMutation::ExpectLockStatus {
                    lock_id: "L1".into(),
                    status: LockStatus::Approved,
                },
                StoreMutation::PutQueueItem(queue_item("Q1", "L1", "10")),
            ])
            .unwrap();
        assert!(store.queue_item("Q1").is_some());
    }

    #[test]
    fn completed_queue_item_is_immutable() {
        let (store, _) = memory_store();
        let mut item = queue_item("Q1", "L1", "10");
        item.status = MintStatus::Completed;
        store.put_queue_item(item.clone()).unwrap();

        item.status = MintStatus::Pending;
        let err = store.put_queue_item(item).unwrap_err();
        assert!(matches!(err, SettlementError::StateConflict { .. }));
    }

    #[test]
    fn settlement_records_cannot_be_deleted() {
        let (store, _) = memory_store();
        store.put_lock(lock("L1", "AUTH-1", "10")).unwrap();
        assert!(store.delete(EntityKind::Lock, "L1").is_err());
        assert!(store.lock("L1").is_some());
    }

    #[test]
    fn unverified_records_are_queryable_and_can_be_cleared() {
        let (store, _) = memory_store();
        let mut l = lock("L1", "AUTH-1", "10");
        l.verification = Verification::Unverified;
        store.put_lock(l).unwrap();
        store.put_lock(lock("L2", "AUTH-2", "10")).unwrap();

        assert_eq!(store.list_unverified_locks().len(), 1);
        assert_eq!(store.stats().unverified, 1);

        store.mark_verified(EntityKind::Lock, "L1").unwrap();
        assert!(store.list_unverified_locks().is_empty());
        assert!(store.mark_verified(EntityKind::Lock, "missing").is_err());
    }

    #[test]
    fn rehydrates_from_redb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settlement.redb");
        {
            let backend = Arc::new(RedbBackend::open(&path).unwrap());
            let store = LockStore::open(backend).unwrap();
            store.put_lock(lock("L1", "AUTH-1", "10000")).unwrap();
            store.put_queue_item(queue_item("Q1", "L1", "4000")).unwrap();
        }

        let backend = Arc::new(RedbBackend::open(&path).unwrap());
        let store = LockStore::open(backend).unwrap();
        assert_eq!(store.lock("L1").unwrap().amount, dec("10000"));
        assert_eq!(
            store.find_by_authorization_code("AUTH-1").unwrap().lock_id,
            "L1"
        );
        assert_eq!(store.list_queue_by_status(MintStatus::Pending).len(), 1);
        assert_eq!(store.stats().locks.get("pending"), Some(&1));
    }
}
