// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Timeout and client-side de-duplication around any ledger client.
//!
//! Successful receipts are cached under the request's idempotency key, so a
//! retried operation returns the original receipt instead of submitting a
//! second transaction. Failed receipts and errors are not cached.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;

use super::{
    AcceptRequest, CustodyRequest, LedgerError, LedgerNetwork, LedgerReceipt, MintReceipt,
    MintRequest, ReserveRequest, SignatureChainClient,
};

const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Clone)]
enum CachedReceipt {
    Step(LedgerReceipt),
    Mint(MintReceipt),
}

pub struct GuardedLedger {
    inner: Arc<dyn SignatureChainClient>,
    timeout: Duration,
    receipts: Mutex<LruCache<String, CachedReceipt>>,
}

impl GuardedLedger {
    pub fn new(inner: Arc<dyn SignatureChainClient>, timeout: Duration) -> Self {
        Self::with_capacity(inner, timeout, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        inner: Arc<dyn SignatureChainClient>,
        timeout: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            inner,
            timeout,
            receipts: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    fn cached(&self, key: &str) -> Option<CachedReceipt> {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, key: String, receipt: CachedReceipt) {
        self.receipts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, receipt);
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout = ?self.timeout, "Ledger call timed out");
                Err(LedgerError::Timeout(self.timeout))
            }
        }
    }

    async fn step<F>(&self, operation: &'static str, key: String, call: F) -> Result<LedgerReceipt, LedgerError>
    where
        F: Future<Output = Result<LedgerReceipt, LedgerError>>,
    {
        if let Some(CachedReceipt::Step(receipt)) = self.cached(&key) {
            tracing::debug!(operation, key = %key, "Returning cached ledger receipt");
            return Ok(receipt);
        }
        let receipt = self.bounded(operation, call).await?;
        if receipt.success {
            self.remember(key, CachedReceipt::Step(receipt.clone()));
        }
        Ok(receipt)
    }
}

#[async_trait]
impl SignatureChainClient for GuardedLedger {
    fn network(&self) -> LedgerNetwork {
        self.inner.network()
    }

    async fn register_custody_certification(
        &self,
        request: &CustodyRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.step(
            "register_custody_certification",
            request.idempotency_key(),
            self.inner.register_custody_certification(request),
        )
        .await
    }

    async fn accept_lock(&self, request: &AcceptRequest) -> Result<LedgerReceipt, LedgerError> {
        self.step(
            "accept_lock",
            request.idempotency_key(),
            self.inner.accept_lock(request),
        )
        .await
    }

    async fn move_to_reserve(&self, request: &ReserveRequest) -> Result<LedgerReceipt, LedgerError> {
        self.step(
            "move_to_reserve",
            request.idempotency_key(),
            self.inner.move_to_reserve(request),
        )
        .await
    }

    async fn mint_and_certify(&self, request: &MintRequest) -> Result<MintReceipt, LedgerError> {
        let key = request.idempotency_key();
        if let Some(CachedReceipt::Mint(receipt)) = self.cached(&key) {
            tracing::debug!(authorization_code = %request.authorization_code, "Returning cached mint receipt");
            return Ok(receipt);
        }
        let receipt = self
            .bounded("mint_and_certify", self.inner.mint_and_certify(request))
            .await?;
        if receipt.receipt.success {
            self.remember(key, CachedReceipt::Mint(receipt.clone()));
        }
        Ok(receipt)
    }

    async fn find_mint(&self, request: &MintRequest) -> Result<Option<MintReceipt>, LedgerError> {
        if let Some(CachedReceipt::Mint(receipt)) = self.cached(&request.idempotency_key()) {
            return Ok(Some(receipt));
        }
        self.bounded("find_mint", self.inner.find_mint(request)).await
    }
}
