// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Mint workflow steps 1-3.
//!
//! ```text
//! Queued ─► LockHash ─► MintHash ─► TargetConfirmed ─► (execute_mint)
//! ```
//!
//! Each step only collects data. Dropping a workflow before
//! [`SettlementEngine::execute_mint`](super::SettlementEngine::execute_mint)
//! leaves no trace.

use sha2::{Digest, Sha256};

use crate::error::{SettlementError, SettlementResult};
use crate::ledger::{idempotency_key, LedgerNetwork};
use crate::models::{normalize_amount, Lock, MintQueueItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintStep {
    Queued,
    LockHash,
    MintHash,
    TargetConfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintWorkflow {
    item: MintQueueItem,
    lock_hash: Option<String>,
    mint_hash: Option<String>,
    target: Option<LedgerNetwork>,
}

impl MintWorkflow {
    pub fn queued(item: MintQueueItem) -> Self {
        Self {
            item,
            lock_hash: None,
            mint_hash: None,
            target: None,
        }
    }

    pub fn step(&self) -> MintStep {
        match (&self.lock_hash, &self.mint_hash, &self.target) {
            (Some(_), Some(_), Some(_)) => MintStep::TargetConfirmed,
            (Some(_), Some(_), None) => MintStep::MintHash,
            (Some(_), None, _) => MintStep::LockHash,
            (None, _, _) => MintStep::Queued,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.step() == MintStep::TargetConfirmed
    }

    pub fn item(&self) -> &MintQueueItem {
        &self.item
    }

    pub fn lock_hash(&self) -> Option<&str> {
        self.lock_hash.as_deref()
    }

    pub fn mint_hash(&self) -> Option<&str> {
        self.mint_hash.as_deref()
    }

    pub fn target(&self) -> Option<&LedgerNetwork> {
        self.target.as_ref()
    }

    /// Step 1: the transaction that anchored the lock, or a digest of the
    /// lock's identity when it was never anchored.
    pub fn collect_lock_hash(mut self, lock: Option<&Lock>) -> Self {
        let anchored = self.item.signature_chain.lock_tx_hash.clone().or_else(|| {
            lock.and_then(|l| l.chain_refs.as_ref())
                .and_then(|refs| refs.tx_hash.clone())
        });
        self.lock_hash = Some(anchored.unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.item.lock_id.as_bytes());
            hasher.update([0x1f]);
            hasher.update(self.item.authorization_code.as_bytes());
            hasher.update([0x1f]);
            hasher.update(normalize_amount(self.item.amount_usd).to_string().as_bytes());
            format!("0x{}", alloy::hex::encode(hasher.finalize()))
        }));
        self
    }

    /// Step 2: the mint reference. Same key the ledger de-duplicates on.
    pub fn collect_mint_hash(mut self) -> Self {
        self.mint_hash = Some(idempotency_key(
            "mint_and_certify",
            &[&self.item.authorization_code],
        ));
        self
    }

    /// Step 3: check the target ledger matches the chain the lock lives on.
    pub fn confirm_target(mut self, network: LedgerNetwork, lock: Option<&Lock>) -> SettlementResult<Self> {
        if self.mint_hash.is_none() {
            return Err(SettlementError::validation(format!(
                "mint {}: target confirmed before hashes were collected",
                self.item.id
            )));
        }
        if let Some(refs) = lock.and_then(|l| l.chain_refs.as_ref()) {
            if refs.chain_id != network.chain_id {
                return Err(SettlementError::validation(format!(
                    "mint {}: lock anchored on chain {} but ledger targets chain {}",
                    self.item.id, refs.chain_id, network.chain_id
                )));
            }
        }
        self.target = Some(network);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChainRefs, MintStatus, SignatureChain, Verification};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn item() -> MintQueueItem {
        let now = Utc::now();
        MintQueueItem {
            id: "MQ-1".into(),
            authorization_code: "AUTH-1".into(),
            amount_usd: Decimal::from(4000),
            currency: "USD".into(),
            lock_id: "L1".into(),
            reserve_id: None,
            bank_name: "Bank".into(),
            beneficiary: "0xabc".into(),
            status: MintStatus::Pending,
            signature_chain: SignatureChain::default(),
            iso_metadata: None,
            verification: Verification::Verified,
            created_at: now,
            updated_at: now,
        }
    }

    fn network(chain_id: u64) -> LedgerNetwork {
        LedgerNetwork {
            name: "lemonchain".into(),
            chain_id,
            contract: None,
        }
    }

    #[test]
    fn steps_advance_in_order() {
        let workflow = MintWorkflow::queued(item());
        assert_eq!(workflow.step(), MintStep::Queued);
        let workflow = workflow.collect_lock_hash(None);
        assert_eq!(workflow.step(), MintStep::LockHash);
        let workflow = workflow.collect_mint_hash();
        assert_eq!(workflow.step(), MintStep::MintHash);
        let workflow = workflow.confirm_target(network(1005), None).unwrap();
        assert!(workflow.is_ready());
        assert_eq!(workflow.lock_hash().unwrap().len(), 66);
    }

    #[test]
    fn anchored_lock_hash_is_reused() {
        let mut item = item();
        item.signature_chain.lock_tx_hash = Some("0xlocktx".into());
        let workflow = MintWorkflow::queued(item).collect_lock_hash(None);
        assert_eq!(workflow.lock_hash(), Some("0xlocktx"));
    }

    #[test]
    fn target_must_follow_hashes_and_match_chain() {
        assert!(MintWorkflow::queued(item())
            .confirm_target(network(1005), None)
            .is_err());

        let now = Utc::now();
        let lock = Lock {
            lock_id: "L1".into(),
            authorization_code: "AUTH-1".into(),
            amount: Decimal::from(10000),
            currency: "USD".into(),
            beneficiary: "0xabc".into(),
            bank_id: None,
            bank_name: "Bank".into(),
            custody_vault_ref: None,
            expiry: None,
            status: crate::models::LockStatus::Approved,
            signatures: vec![],
            chain_refs: Some(ChainRefs {
                network: "other".into(),
                chain_id: 1,
                tx_hash: None,
                block_number: None,
            }),
            approved_amount: None,
            verification: Verification::Verified,
            created_at: now,
            updated_at: now,
        };
        let err = MintWorkflow::queued(item())
            .collect_lock_hash(Some(&lock))
            .collect_mint_hash()
            .confirm_target(network(1005), Some(&lock))
            .unwrap_err();
        assert!(matches!(err, SettlementError::Validation(_)));
    }
}
