// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deterministic in-process ledger for sandbox/manual operation and tests.
//!
//! Hashes and signatures are derived from each request's idempotency key, so
//! replaying a request yields the same receipt. The ledger can be taken
//! offline, slowed down, or told to refuse mints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{
    AcceptRequest, CustodyRequest, LedgerError, LedgerNetwork, LedgerReceipt, MintReceipt,
    MintRequest, ReserveRequest, SignatureChainClient,
};
use crate::models::generate_code;

/// Address recorded as the signer of sandbox signatures.
pub const SANDBOX_SIGNER: &str = "0x5A4DB0C5A4DB0C5A4DB0C5A4DB0C5A4DB0C5A4DB";

const GENESIS_BLOCK: u64 = 1_000_000;

pub struct SandboxLedger {
    network: LedgerNetwork,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    mint_failure: Mutex<Option<String>>,
    next_block: AtomicU64,
    submissions: AtomicUsize,
    steps: Mutex<HashMap<String, LedgerReceipt>>,
    mints: Mutex<HashMap<String, MintReceipt>>,
}

impl SandboxLedger {
    pub fn new(network: impl Into<String>, chain_id: u64) -> Self {
        Self {
            network: LedgerNetwork {
                name: network.into(),
                chain_id,
                contract: None,
            },
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            mint_failure: Mutex::new(None),
            next_block: AtomicU64::new(GENESIS_BLOCK),
            submissions: AtomicUsize::new(0),
            steps: Mutex::new(HashMap::new()),
            mints: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate an unreachable ledger.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Make `mint_and_certify` answer with `success == false`.
    pub fn set_mint_failure(&self, reason: Option<String>) {
        *self
            .mint_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason;
    }

    /// Number of operations that produced a new ledger record.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    async fn reach(&self) -> Result<(), LedgerError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("sandbox ledger offline".to_string()));
        }
        Ok(())
    }

    fn step(&self, key: String, reference: Option<String>) -> LedgerReceipt {
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        steps
            .entry(key.clone())
            .or_insert_with(|| {
                self.submissions.fetch_add(1, Ordering::SeqCst);
                LedgerReceipt {
                    success: true,
                    tx_hash: Some(digest("tx", &key)),
                    block_number: Some(self.next_block.fetch_add(1, Ordering::SeqCst)),
                    signature: Some(digest("sig", &key)),
                    signer: Some(SANDBOX_SIGNER.to_string()),
                    reference,
                    error: None,
                }
            })
            .clone()
    }
}

fn digest(domain: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(key.as_bytes());
    format!("0x{}", alloy::hex::encode(hasher.finalize()))
}

#[async_trait]
impl SignatureChainClient for SandboxLedger {
    fn network(&self) -> LedgerNetwork {
        self.network.clone()
    }

    async fn register_custody_certification(
        &self,
        request: &CustodyRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.reach().await?;
        let key = request.idempotency_key();
        let injection_id = digest("injection", &key);
        Ok(self.step(key, Some(injection_id)))
    }

    async fn accept_lock(&self, request: &AcceptRequest) -> Result<LedgerReceipt, LedgerError> {
        self.reach().await?;
        Ok(self.step(request.idempotency_key(), request.ledger_ref.clone()))
    }

    async fn move_to_reserve(&self, request: &ReserveRequest) -> Result<LedgerReceipt, LedgerError> {
        self.reach().await?;
        Ok(self.step(request.idempotency_key(), request.ledger_ref.clone()))
    }

    async fn mint_and_certify(&self, request: &MintRequest) -> Result<MintReceipt, LedgerError> {
        self.reach().await?;

        let failure = self
            .mint_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(reason) = failure {
            return Ok(MintReceipt {
                receipt: LedgerReceipt::failed(reason),
                publication_code: None,
                certificate_id: None,
                mode: request.mode(),
            });
        }

        let key = request.idempotency_key();
        let mut mints = self.mints.lock().unwrap_or_else(PoisonError::into_inner);
        let receipt = mints
            .entry(key.clone())
            .or_insert_with(|| {
                self.submissions.fetch_add(1, Ordering::SeqCst);
                let certificate = digest("certificate", &key);
                MintReceipt {
                    receipt: LedgerReceipt {
                        success: true,
                        tx_hash: Some(digest("tx", &key)),
                        block_number: Some(self.next_block.fetch_add(1, Ordering::SeqCst)),
                        signature: Some(digest("sig", &key)),
                        signer: Some(SANDBOX_SIGNER.to_string()),
                        reference: request.signature_chain.injection_id.clone(),
                        error: None,
                    },
                    publication_code: Some(generate_code("PUB")),
                    certificate_id: Some(format!("CERT-{}", &certificate[2..18].to_ascii_uppercase())),
                    mode: request.mode(),
                }
            })
            .clone();
        Ok(receipt)
    }

    async fn find_mint(&self, request: &MintRequest) -> Result<Option<MintReceipt>, LedgerError> {
        self.reach().await?;
        Ok(self
            .mints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.idempotency_key())
            .cloned())
    }
}
