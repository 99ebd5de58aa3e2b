// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded settlement database backed by redb (pure Rust, ACID).
//!
//! Every table maps a string key to the JSON encoding of one record. A
//! [`WriteOp`] batch runs inside a single write transaction, so a lock
//! approval that touches a lock, a reserve and a queue item lands entirely
//! or not at all.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::{DurableBackend, EntityKind, StorageResult, WriteOp};

// =============================================================================
// Table Definitions
// =============================================================================

const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
const RESERVES: TableDefinition<&str, &[u8]> = TableDefinition::new("reserves");
const MINT_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("mint_queue");
const CONFIRMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("confirmations");
const REJECTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("rejections");
const OUTBOX: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

fn table_for(kind: EntityKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        EntityKind::Lock => LOCKS,
        EntityKind::Reserve => RESERVES,
        EntityKind::QueueItem => MINT_QUEUE,
        EntityKind::Confirmation => CONFIRMATIONS,
        EntityKind::Rejection => REJECTIONS,
        EntityKind::Outbox => OUTBOX,
    }
}

// =============================================================================
// RedbBackend
// =============================================================================

/// Durable backend stored in a single redb file.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        for kind in EntityKind::ALL {
            let _ = write_txn.open_table(table_for(kind))?;
        }
        write_txn.commit()?;

        tracing::info!(path = %path.display(), "Settlement database opened");
        Ok(Self { db })
    }
}

impl DurableBackend for RedbBackend {
    fn write_batch(&self, batch: &[WriteOp]) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        for op in batch {
            match op {
                WriteOp::Put { kind, key, value } => {
                    let mut table = write_txn.open_table(table_for(*kind))?;
                    table.insert(key.as_str(), value.as_slice())?;
                }
                WriteOp::Delete { kind, key } => {
                    let mut table = write_txn.open_table(table_for(*kind))?;
                    table.remove(key.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_all(&self, kind: EntityKind) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table_for(kind))?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            rows.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(rows)
    }
}
