// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Volatile backend for sandbox runs and tests.
//!
//! Writes can be switched to fail on demand, which is how rollback of the
//! in-memory store is exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{DurableBackend, EntityKind, StorageError, StorageResult, WriteOp};

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<EntityKind, BTreeMap<String, Vec<u8>>>>,
    fail_writes: AtomicBool,
    batches: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write_batch` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of batches committed so far.
    pub fn committed_batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

impl DurableBackend for MemoryBackend {
    fn write_batch(&self, batch: &[WriteOp]) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("simulated write failure".to_string()));
        }
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        for op in batch {
            match op {
                WriteOp::Put { kind, key, value } => {
                    tables
                        .entry(*kind)
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                WriteOp::Delete { kind, key } => {
                    if let Some(table) = tables.get_mut(kind) {
                        table.remove(key);
                    }
                }
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_all(&self, kind: EntityKind) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables
            .get(&kind)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
