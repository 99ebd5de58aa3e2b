// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement Storage
//!
//! [`LockStore`] keeps every settlement record in keyed in-memory maps and
//! writes each mutation through to a [`DurableBackend`] before it becomes
//! visible. A failed durable write rolls the in-memory mutation back and
//! surfaces [`StorageError`]; the two never diverge.
//!
//! ## Backends
//!
//! - [`RedbBackend`] - embedded ACID database (one table per entity)
//! - [`MemoryBackend`] - volatile backend for sandbox runs and tests
//!
//! ## Table Layout
//!
//! ```text
//! locks          lock_id            -> Lock (JSON)
//! reserves       reserve_id         -> LockReserve (JSON)
//! mint_queue     queue_item_id      -> MintQueueItem (JSON)
//! confirmations  authorization_code -> MintConfirmation (JSON)
//! rejections     lock_id            -> RejectedLock (JSON)
//! outbox         notification_id    -> OutboxEntry (JSON)
//! ```

pub mod lock_db;
pub mod lock_store;
pub mod memory;

pub use lock_db::RedbBackend;
pub use lock_store::{LockStore, StoreMutation, StoreStats};
pub use memory::MemoryBackend;

/// Entity families persisted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Lock,
    Reserve,
    QueueItem,
    Confirmation,
    Rejection,
    Outbox,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Lock,
        EntityKind::Reserve,
        EntityKind::QueueItem,
        EntityKind::Confirmation,
        EntityKind::Rejection,
        EntityKind::Outbox,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::Lock => "locks",
            EntityKind::Reserve => "reserves",
            EntityKind::QueueItem => "mint_queue",
            EntityKind::Confirmation => "confirmations",
            EntityKind::Rejection => "rejections",
            EntityKind::Outbox => "outbox",
        }
    }
}

/// One durable write. A batch of these commits atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        kind: EntityKind,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        kind: EntityKind,
        key: String,
    },
}

/// Durable medium behind [`LockStore`].
pub trait DurableBackend: Send + Sync {
    /// Apply all operations atomically, or none of them.
    fn write_batch(&self, batch: &[WriteOp]) -> StorageResult<()>;

    /// Every `(key, value)` pair stored for one entity family.
    fn load_all(&self, kind: EntityKind) -> StorageResult<Vec<(String, Vec<u8>)>>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend write failed: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
