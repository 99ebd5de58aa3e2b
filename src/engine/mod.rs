// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement Engine
//!
//! Lock state machine and mint workflow.
//!
//! ```text
//! Lock:      Pending ─► Approved ─► Minted
//!                  └──► Rejected
//! Approval:  Lock(Approved) + MintQueueItem + 0..1 LockReserve(active)
//! Promotion: LockReserve(fully_consumed) + MintQueueItem
//! Mint:      MintQueueItem pending ─► minting ─► completed + MintConfirmation
//! ```
//!
//! ## Serialization
//!
//! Reads, validation and commits run under one writer guard and never await.
//! Ledger and notification calls happen outside it. A record with a ledger
//! call in flight is claimed, so a concurrent approve/reject/mint on it fails
//! with `StateConflict`, and every commit re-checks the expected status
//! inside the store before applying.
//!
//! ## Ledger Degradation
//!
//! Approval never blocks on the ledger: an unreachable or refusing ledger
//! yields a local pseudo-signature and an `Unverified` record. Minting never
//! falls back. A mint whose outcome is unknown (timeout, transport error)
//! leaves the item `minting`; the next attempt asks the ledger for an
//! existing mint before submitting again.

pub mod certificate;
pub mod workflow;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::primitives::Address;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::ledger::fallback::pseudo_signature;
use crate::ledger::{
    register_and_accept, MintReceipt, MintRequest, ReserveRequest, SignatureChainClient,
};
use crate::models::{
    generate_code, normalize_amount, ChainRefs, ConfirmationSignatures, Lock, LockReserve,
    LockStatus, MintConfirmation, MintQueueItem, MintStatus, RejectedLock, ReserveStatus,
    Signature, SignatureChain, SignatureRole, Verification,
};
use crate::notify::{NotificationEvent, NotificationRelay};
use crate::storage::{LockStore, StoreMutation};

pub use certificate::CertificateInput;
pub use workflow::{MintStep, MintWorkflow};

/// Values stamped onto records the engine creates.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Credited when a queue item's beneficiary is not a usable address.
    pub fallback_vault: String,
    pub minted_by: String,
}

impl EngineSettings {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            fallback_vault: config.fallback_vault_address.clone(),
            minted_by: config.minted_by.clone(),
        }
    }
}

/// Records written by one approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Approval {
    pub lock: Lock,
    pub queue_item: MintQueueItem,
    pub reserve: Option<LockReserve>,
    pub verification: Verification,
}

/// Records written by one reserve promotion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub reserve: LockReserve,
    pub queue_item: MintQueueItem,
}

pub struct SettlementEngine {
    store: Arc<LockStore>,
    ledger: Arc<dyn SignatureChainClient>,
    relay: Arc<NotificationRelay>,
    settings: EngineSettings,
    writer: Mutex<()>,
    in_flight: Mutex<HashSet<String>>,
}

/// Releases an in-flight claim when dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Second signature plus whatever the ledger returned with it.
struct ApprovalSigning {
    signature: Signature,
    chain_refs: Option<ChainRefs>,
    injection_id: Option<String>,
    verification: Verification,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<LockStore>,
        ledger: Arc<dyn SignatureChainClient>,
        relay: Arc<NotificationRelay>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            relay,
            settings,
            writer: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key` for the duration of a ledger call.
    fn claim(&self, key: String, entity: &'static str, id: &str) -> SettlementResult<Claim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Err(SettlementError::conflict(entity, id, "idle", "in progress"));
        }
        Ok(Claim {
            set: &self.in_flight,
            key,
        })
    }

    fn is_claimed(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    // =========================================================================
    // Approve
    // =========================================================================

    /// Approve `approved_amount` of a pending lock for minting.
    ///
    /// Writes the approved lock, one queue item for `approved_amount`, and a
    /// reserve for the remainder if there is one, in a single commit.
    pub async fn approve_lock(&self, lock_id: &str, approved_amount: Decimal) -> SettlementResult<Approval> {
        let approved_amount = normalize_amount(approved_amount);
        let (lock, _claim) = {
            let _writer = self.write_guard();
            let lock = self
                .store
                .lock(lock_id)
                .ok_or_else(|| SettlementError::not_found("lock", lock_id))?;
            if lock.status != LockStatus::Pending {
                return Err(SettlementError::conflict(
                    "lock",
                    lock_id,
                    LockStatus::Pending,
                    lock.status,
                ));
            }
            if lock.is_expired(Utc::now()) {
                return Err(SettlementError::validation(format!("lock {lock_id} has expired")));
            }
            if approved_amount <= Decimal::ZERO || approved_amount > lock.amount {
                return Err(SettlementError::validation(format!(
                    "approved amount {approved_amount} must be in (0, {}] for lock {lock_id}",
                    lock.amount
                )));
            }
            let claim = self.claim(lock_key(lock_id), "lock", lock_id)?;
            (lock, claim)
        };
        let remaining = lock.amount - approved_amount;

        let signing = self.sign_approval(&lock, approved_amount).await;

        let mut reserve = None;
        if remaining > Decimal::ZERO {
            reserve = Some(
                self.build_reserve(&lock, remaining, signing.injection_id.clone())
                    .await,
            );
        }

        // Upstream merges may have landed while the ledger was signing, so the
        // approval is applied to the lock as it is now.
        let (approved, queue_item, reserve) = {
            let _writer = self.write_guard();
            let current = self
                .store
                .lock(lock_id)
                .ok_or_else(|| SettlementError::not_found("lock", lock_id))?;
            let now = Utc::now();

            let mut approved = current.clone();
            approved.status = LockStatus::Approved;
            approved.put_signature(signing.signature.clone());
            if signing.chain_refs.is_some() {
                approved.chain_refs = signing.chain_refs.clone();
            }
            approved.approved_amount = Some(approved_amount);
            approved.verification = current.verification.combine(signing.verification);
            approved.updated_at = now;

            let first_signature = current
                .signature(SignatureRole::CustodyCertification)
                .cloned();
            let queue_item = MintQueueItem {
                id: generate_code("MQ"),
                authorization_code: current.authorization_code.clone(),
                amount_usd: approved_amount,
                currency: current.currency.clone(),
                lock_id: current.lock_id.clone(),
                reserve_id: None,
                bank_name: current.bank_name.clone(),
                beneficiary: current.beneficiary.clone(),
                status: MintStatus::Pending,
                signature_chain: SignatureChain {
                    injection_id: signing.injection_id.clone(),
                    first_signature: first_signature.clone(),
                    second_signature: Some(signing.signature.clone()),
                    lock_tx_hash: current.chain_refs.as_ref().and_then(|r| r.tx_hash.clone()),
                },
                iso_metadata: None,
                verification: signing.verification,
                created_at: now,
                updated_at: now,
            };

            let reserve = reserve.map(|mut reserve| {
                reserve.beneficiary = current.beneficiary.clone();
                reserve.bank_name = current.bank_name.clone();
                reserve.first_signature = first_signature;
                reserve
            });

            let mut mutations = vec![
                StoreMutation::ExpectLockStatus {
                    lock_id: lock_id.to_string(),
                    status: LockStatus::Pending,
                },
                StoreMutation::PutLock(approved.clone()),
                StoreMutation::PutQueueItem(queue_item.clone()),
            ];
            if let Some(reserve) = &reserve {
                mutations.push(StoreMutation::PutReserve(reserve.clone()));
            }
            self.store.commit(mutations)?;
            (approved, queue_item, reserve)
        };

        info!(
            lock_id,
            approved = %approved_amount,
            remaining = %remaining,
            queue_item = %queue_item.id,
            verification = ?approved.verification,
            "Lock approved"
        );

        self.relay
            .notify(
                NotificationEvent::LockApproved,
                lock_id,
                json!({
                    "lock_id": lock_id,
                    "authorization_code": approved.authorization_code,
                    "approved_amount": approved_amount.to_string(),
                    "remaining_amount": remaining.to_string(),
                    "queue_item_id": queue_item.id,
                    "second_signature": signing.signature.hash,
                    "tx_hash": signing.signature.chain_tx,
                    "injection_id": signing.injection_id,
                    "verification": approved.verification,
                }),
            )
            .await;
        if let Some(reserve) = &reserve {
            self.relay
                .notify(
                    NotificationEvent::LockReserveCreated,
                    lock_id,
                    json!({
                        "lock_id": lock_id,
                        "reserve_id": reserve.id,
                        "authorization_code": reserve.authorization_code,
                        "remaining_amount": reserve.remaining_amount.to_string(),
                        "reserve_tx_hash": reserve.reserve_tx_hash,
                    }),
                )
                .await;
        }

        Ok(Approval {
            verification: approved.verification,
            lock: approved,
            queue_item,
            reserve,
        })
    }

    async fn sign_approval(&self, lock: &Lock, amount: Decimal) -> ApprovalSigning {
        let network = self.ledger.network();
        let failure = match register_and_accept(self.ledger.as_ref(), lock, amount).await {
            Ok(outcome) if outcome.is_signed() => {
                let acceptance = &outcome.acceptance;
                let mut signature = Signature::new(
                    SignatureRole::Approval,
                    acceptance.signer.clone().unwrap_or_default(),
                    acceptance.signature.clone().unwrap_or_default(),
                );
                if let Some(tx) = &acceptance.tx_hash {
                    signature = signature.with_chain_tx(tx.clone());
                }
                return ApprovalSigning {
                    signature,
                    chain_refs: Some(ChainRefs {
                        network: network.name,
                        chain_id: network.chain_id,
                        tx_hash: acceptance.tx_hash.clone(),
                        block_number: acceptance.block_number,
                    }),
                    injection_id: outcome.injection_id().map(str::to_string),
                    verification: Verification::Verified,
                };
            }
            Ok(outcome) => outcome
                .acceptance
                .error
                .clone()
                .unwrap_or_else(|| "ledger returned no approval signature".to_string()),
            Err(e) => e.to_string(),
        };

        warn!(
            lock_id = %lock.lock_id,
            error = %failure,
            "Ledger approval failed, signing locally; lock will be unverified"
        );
        ApprovalSigning {
            signature: pseudo_signature(SignatureRole::Approval, &lock.lock_id),
            chain_refs: None,
            injection_id: None,
            verification: Verification::Unverified,
        }
    }

    async fn build_reserve(
        &self,
        lock: &Lock,
        remaining: Decimal,
        ledger_ref: Option<String>,
    ) -> LockReserve {
        let request = ReserveRequest {
            lock_id: lock.lock_id.clone(),
            reserve_id: generate_code("RSV"),
            authorization_code: format!("RESERVE-{}", lock.authorization_code),
            amount: remaining,
            ledger_ref,
        };

        let (reserve_tx_hash, verification) = match self.ledger.move_to_reserve(&request).await {
            Ok(receipt) if receipt.success => (receipt.tx_hash, Verification::Verified),
            Ok(receipt) => {
                warn!(
                    lock_id = %lock.lock_id,
                    reserve_id = %request.reserve_id,
                    error = ?receipt.error,
                    "Ledger refused move to reserve; reserve will be unverified"
                );
                (None, Verification::Unverified)
            }
            Err(e) => {
                warn!(
                    lock_id = %lock.lock_id,
                    reserve_id = %request.reserve_id,
                    error = %e,
                    "Move to reserve failed; reserve will be unverified"
                );
                (None, Verification::Unverified)
            }
        };

        let now = Utc::now();
        LockReserve {
            id: request.reserve_id,
            original_lock_id: lock.lock_id.clone(),
            authorization_code: request.authorization_code,
            original_amount: remaining,
            remaining_amount: remaining,
            consumed_amount: Decimal::ZERO,
            beneficiary: lock.beneficiary.clone(),
            bank_name: lock.bank_name.clone(),
            currency: lock.currency.clone(),
            status: ReserveStatus::Active,
            first_signature: lock.signature(SignatureRole::CustodyCertification).cloned(),
            reserve_tx_hash,
            ledger_ref: request.ledger_ref,
            verification,
            created_at: now,
            updated_at: now,
        }
    }

    // =========================================================================
    // Reject
    // =========================================================================

    /// Terminally reject a pending lock. No ledger call.
    pub async fn reject_lock(&self, lock_id: &str, reason: &str, actor: &str) -> SettlementResult<RejectedLock> {
        let reason = reason.trim();
        let actor = actor.trim();
        if reason.is_empty() || actor.is_empty() {
            return Err(SettlementError::validation(
                "rejection needs a reason and an actor",
            ));
        }

        let rejection = {
            let _writer = self.write_guard();
            let lock = self
                .store
                .lock(lock_id)
                .ok_or_else(|| SettlementError::not_found("lock", lock_id))?;
            if lock.status != LockStatus::Pending {
                return Err(SettlementError::conflict(
                    "lock",
                    lock_id,
                    LockStatus::Pending,
                    lock.status,
                ));
            }
            if self.is_claimed(&lock_key(lock_id)) {
                return Err(SettlementError::conflict(
                    "lock",
                    lock_id,
                    LockStatus::Pending,
                    "approval in progress",
                ));
            }

            let now = Utc::now();
            let rejection = RejectedLock {
                lock_id: lock_id.to_string(),
                reason: reason.to_string(),
                rejected_by: actor.to_string(),
                rejected_at: now,
            };
            let mut rejected = lock;
            rejected.status = LockStatus::Rejected;
            rejected.updated_at = now;
            self.store.commit(vec![
                StoreMutation::ExpectLockStatus {
                    lock_id: lock_id.to_string(),
                    status: LockStatus::Pending,
                },
                StoreMutation::PutLock(rejected),
                StoreMutation::PutRejection(rejection.clone()),
            ])?;
            rejection
        };

        info!(lock_id, actor, reason, "Lock rejected");
        self.relay
            .notify(
                NotificationEvent::LockRejected,
                lock_id,
                json!({
                    "lock_id": lock_id,
                    "reason": rejection.reason,
                    "rejected_by": rejection.rejected_by,
                    "rejected_at": rejection.rejected_at,
                }),
            )
            .await;
        Ok(rejection)
    }

    // =========================================================================
    // Promote
    // =========================================================================

    /// Queue the whole remainder of an active reserve for minting.
    pub async fn promote_reserve_to_queue(&self, reserve_id: &str) -> SettlementResult<Promotion> {
        let promotion = {
            let _writer = self.write_guard();
            let mut reserve = self
                .store
                .reserve(reserve_id)
                .ok_or_else(|| SettlementError::not_found("reserve", reserve_id))?;
            if reserve.status != ReserveStatus::Active {
                return Err(SettlementError::conflict(
                    "reserve",
                    reserve_id,
                    ReserveStatus::Active,
                    reserve.status,
                ));
            }
            if reserve.remaining_amount <= Decimal::ZERO {
                return Err(SettlementError::validation(format!(
                    "reserve {reserve_id} has nothing left to promote"
                )));
            }

            let amount = reserve.consume_all();
            let now = Utc::now();
            let queue_item = MintQueueItem {
                id: generate_code("MQ"),
                authorization_code: reserve.authorization_code.clone(),
                amount_usd: amount,
                currency: reserve.currency.clone(),
                lock_id: reserve.original_lock_id.clone(),
                reserve_id: Some(reserve.id.clone()),
                bank_name: reserve.bank_name.clone(),
                beneficiary: reserve.beneficiary.clone(),
                status: MintStatus::Pending,
                signature_chain: SignatureChain {
                    injection_id: reserve.ledger_ref.clone(),
                    first_signature: reserve.first_signature.clone(),
                    second_signature: None,
                    lock_tx_hash: reserve.reserve_tx_hash.clone(),
                },
                iso_metadata: None,
                verification: reserve.verification,
                created_at: now,
                updated_at: now,
            };
            self.store.commit(vec![
                StoreMutation::ExpectReserveStatus {
                    reserve_id: reserve_id.to_string(),
                    status: ReserveStatus::Active,
                },
                StoreMutation::PutReserve(reserve.clone()),
                StoreMutation::PutQueueItem(queue_item.clone()),
            ])?;
            Promotion { reserve, queue_item }
        };

        info!(
            reserve_id,
            lock_id = %promotion.reserve.original_lock_id,
            amount = %promotion.queue_item.amount_usd,
            queue_item = %promotion.queue_item.id,
            "Reserve promoted to mint queue"
        );
        self.relay
            .notify(
                NotificationEvent::LockReservePromoted,
                &promotion.reserve.original_lock_id,
                json!({
                    "lock_id": promotion.reserve.original_lock_id,
                    "reserve_id": reserve_id,
                    "queue_item_id": promotion.queue_item.id,
                    "amount": promotion.queue_item.amount_usd.to_string(),
                }),
            )
            .await;
        Ok(promotion)
    }

    // =========================================================================
    // Mint
    // =========================================================================

    /// Run mint steps 1-3 for a queue item. No side effects.
    pub fn begin_mint(&self, item_id: &str) -> SettlementResult<MintWorkflow> {
        let item = self
            .store
            .queue_item(item_id)
            .ok_or_else(|| SettlementError::not_found("queue item", item_id))?;
        if item.status == MintStatus::Cancelled {
            return Err(SettlementError::conflict(
                "queue item",
                item_id,
                MintStatus::Pending,
                item.status,
            ));
        }
        let lock = self.store.lock(&item.lock_id);
        MintWorkflow::queued(item)
            .collect_lock_hash(lock.as_ref())
            .collect_mint_hash()
            .confirm_target(self.ledger.network(), lock.as_ref())
    }

    /// Step 4: mint and certify.
    ///
    /// Returns the existing confirmation when the item was already minted, so
    /// retries never mint twice.
    pub async fn execute_mint(&self, workflow: MintWorkflow) -> SettlementResult<MintConfirmation> {
        if !workflow.is_ready() {
            return Err(SettlementError::validation(format!(
                "mint {} is at {:?}, steps 1-3 not complete",
                workflow.item().id,
                workflow.step()
            )));
        }
        let item_id = workflow.item().id.clone();

        let (item, resume, _claim) = {
            let _writer = self.write_guard();
            let item = self
                .store
                .queue_item(&item_id)
                .ok_or_else(|| SettlementError::not_found("queue item", &item_id))?;
            if let Some(existing) = self.store.confirmation(&item.authorization_code) {
                info!(queue_item = %item_id, confirmation = %existing.id, "Mint already confirmed");
                return Ok(existing);
            }
            let claim = self.claim(mint_key(&item_id), "queue item", &item_id)?;
            let resume = match item.status {
                MintStatus::Pending => {
                    let mut minting = item.clone();
                    minting.status = MintStatus::Minting;
                    minting.updated_at = Utc::now();
                    self.store.commit(vec![
                        StoreMutation::ExpectQueueStatus {
                            item_id: item_id.clone(),
                            status: MintStatus::Pending,
                        },
                        StoreMutation::PutQueueItem(minting),
                    ])?;
                    false
                }
                MintStatus::Minting => true,
                MintStatus::Completed | MintStatus::Cancelled => {
                    return Err(SettlementError::conflict(
                        "queue item",
                        &item_id,
                        MintStatus::Pending,
                        item.status,
                    ));
                }
            };
            (item, resume, claim)
        };

        let (beneficiary, used_fallback) = self.resolve_beneficiary(&item.beneficiary);
        if used_fallback {
            warn!(
                queue_item = %item_id,
                beneficiary = %item.beneficiary,
                fallback = %beneficiary,
                "Invalid beneficiary, minting to fallback vault"
            );
        }
        let request = MintRequest {
            queue_item_id: item_id.clone(),
            authorization_code: item.authorization_code.clone(),
            lock_id: item.lock_id.clone(),
            amount: item.amount_usd,
            beneficiary: beneficiary.clone(),
            signature_chain: item.signature_chain.clone(),
        };

        let receipt = self.submit_mint(&item, &request, resume).await?;
        let confirmation = self.confirm_mint(&item, receipt, beneficiary, used_fallback)?;

        info!(
            queue_item = %item_id,
            authorization_code = %confirmation.authorization_code,
            publication_code = %confirmation.publication_code,
            tx_hash = %confirmation.tx_hash,
            amount = %confirmation.minted_amount,
            mode = ?confirmation.mode,
            "Mint completed"
        );
        self.relay
            .notify(
                NotificationEvent::LockMinted,
                &confirmation.lock_id,
                json!({
                    "lock_id": confirmation.lock_id,
                    "authorization_code": confirmation.authorization_code,
                    "publication_code": confirmation.publication_code,
                    "certificate_id": confirmation.certificate_id,
                    "minted_amount": confirmation.minted_amount,
                    "beneficiary": confirmation.beneficiary,
                    "used_fallback_beneficiary": confirmation.used_fallback_beneficiary,
                    "tx_hash": confirmation.tx_hash,
                    "block_number": confirmation.block_number,
                    "verification": confirmation.verification,
                }),
            )
            .await;
        Ok(confirmation)
    }

    /// Steps 1-4 in one call.
    pub async fn execute_mint_by_id(&self, item_id: &str) -> SettlementResult<MintConfirmation> {
        let workflow = self.begin_mint(item_id)?;
        self.execute_mint(workflow).await
    }

    /// Data for the certificate renderer once a mint is confirmed.
    pub fn certificate_input(&self, authorization_code: &str) -> SettlementResult<CertificateInput> {
        let confirmation = self
            .store
            .confirmation(authorization_code)
            .ok_or_else(|| SettlementError::not_found("confirmation", authorization_code))?;
        let lock = self
            .store
            .lock(&confirmation.lock_id)
            .ok_or_else(|| SettlementError::not_found("lock", &confirmation.lock_id))?;
        CertificateInput::from_confirmation(&lock, &confirmation)
    }

    /// `(address, used_fallback)`. Unparsable and zero addresses fall back.
    fn resolve_beneficiary(&self, raw: &str) -> (String, bool) {
        match Address::from_str(raw.trim()) {
            Ok(address) if address != Address::ZERO => (address.to_checksum(None), false),
            _ => (self.settings.fallback_vault.clone(), true),
        }
    }

    async fn submit_mint(
        &self,
        item: &MintQueueItem,
        request: &MintRequest,
        resume: bool,
    ) -> SettlementResult<MintReceipt> {
        if resume {
            match self.ledger.find_mint(request).await {
                Ok(Some(found)) if found.receipt.success => {
                    if let Some(owner) = self.certificate_owner(&found, &item.id) {
                        return Err(SettlementError::mint(
                            &item.authorization_code,
                            format!(
                                "previous attempt unresolved: ledger certificate already confirms queue item {owner}"
                            ),
                        ));
                    }
                    info!(queue_item = %item.id, "Resumed mint found on ledger");
                    return Ok(found);
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SettlementError::mint(
                        &item.authorization_code,
                        format!("previous attempt unresolved: {e}"),
                    ));
                }
            }
        }

        match self.ledger.mint_and_certify(request).await {
            Ok(receipt) if receipt.receipt.success => Ok(receipt),
            Ok(receipt) => {
                let reason = receipt
                    .receipt
                    .error
                    .unwrap_or_else(|| "ledger refused mint".to_string());
                warn!(queue_item = %item.id, error = %reason, "Mint refused, item back to pending");
                self.release_mint(&item.id)?;
                Err(SettlementError::mint(&item.authorization_code, reason))
            }
            Err(e) => {
                warn!(
                    queue_item = %item.id,
                    error = %e,
                    "Mint outcome unknown, item stays minting until resolved"
                );
                Err(SettlementError::mint(&item.authorization_code, e.to_string()))
            }
        }
    }

    /// Queue item other than `item_id` already confirmed by `found`'s certificate.
    fn certificate_owner(&self, found: &MintReceipt, item_id: &str) -> Option<String> {
        let certificate = found.certificate_id.as_deref()?;
        self.store
            .list_confirmations()
            .into_iter()
            .find(|c| c.certificate_id == certificate && c.queue_item_id != item_id)
            .map(|c| c.queue_item_id)
    }

    /// Put a `minting` item whose ledger outcome stayed unresolved back to
    /// `pending`.
    ///
    /// Only for an operator who has checked the ledger and found that no
    /// earlier attempt landed; the next `execute_mint` submits again.
    pub fn reopen_unresolved_mint(&self, item_id: &str, actor: &str) -> SettlementResult<MintQueueItem> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(SettlementError::validation("reopening a mint needs an actor"));
        }

        let _writer = self.write_guard();
        let mut item = self
            .store
            .queue_item(item_id)
            .ok_or_else(|| SettlementError::not_found("queue item", item_id))?;
        if item.status != MintStatus::Minting {
            return Err(SettlementError::conflict(
                "queue item",
                item_id,
                MintStatus::Minting,
                item.status,
            ));
        }
        if self.is_claimed(&mint_key(item_id)) {
            return Err(SettlementError::conflict(
                "queue item",
                item_id,
                MintStatus::Minting,
                "mint in progress",
            ));
        }
        if self.store.confirmation(&item.authorization_code).is_some() {
            return Err(SettlementError::conflict(
                "queue item",
                item_id,
                "unconfirmed",
                "confirmed",
            ));
        }

        item.status = MintStatus::Pending;
        item.updated_at = Utc::now();
        self.store.commit(vec![
            StoreMutation::ExpectQueueStatus {
                item_id: item_id.to_string(),
                status: MintStatus::Minting,
            },
            StoreMutation::PutQueueItem(item.clone()),
        ])?;
        warn!(queue_item = %item_id, actor, "Unresolved mint reopened by operator");
        Ok(item)
    }

    /// Return a refused mint to `pending`.
    fn release_mint(&self, item_id: &str) -> SettlementResult<()> {
        let _writer = self.write_guard();
        let Some(mut item) = self.store.queue_item(item_id) else {
            return Ok(());
        };
        item.status = MintStatus::Pending;
        item.updated_at = Utc::now();
        self.store.commit(vec![
            StoreMutation::ExpectQueueStatus {
                item_id: item_id.to_string(),
                status: MintStatus::Minting,
            },
            StoreMutation::PutQueueItem(item),
        ])
    }

    fn confirm_mint(
        &self,
        item: &MintQueueItem,
        receipt: MintReceipt,
        beneficiary: String,
        used_fallback: bool,
    ) -> SettlementResult<MintConfirmation> {
        let tx_hash = receipt.receipt.tx_hash.clone().ok_or_else(|| {
            SettlementError::mint(&item.authorization_code, "ledger receipt carries no tx hash")
        })?;

        let (third, third_verification) = match (&receipt.receipt.signature, &receipt.receipt.signer) {
            (Some(hash), signer) => (
                Signature::new(
                    SignatureRole::BackedCertificate,
                    signer.clone().unwrap_or_default(),
                    hash.clone(),
                )
                .with_chain_tx(tx_hash.clone()),
                Verification::Verified,
            ),
            (None, _) => (
                pseudo_signature(SignatureRole::BackedCertificate, &item.authorization_code),
                Verification::Unverified,
            ),
        };

        let publication_code = receipt
            .publication_code
            .clone()
            .unwrap_or_else(|| generate_code("PUB"));
        let confirmation = MintConfirmation {
            id: generate_code("MC"),
            authorization_code: item.authorization_code.clone(),
            certificate_id: receipt
                .certificate_id
                .clone()
                .unwrap_or_else(|| generate_code("CERT")),
            publication_code,
            tx_hash,
            block_number: receipt.receipt.block_number.unwrap_or_default(),
            minted_amount: normalize_amount(item.amount_usd).to_string(),
            minted_by: self.settings.minted_by.clone(),
            minted_at: Utc::now(),
            signatures: ConfirmationSignatures {
                first: item.signature_chain.first_signature.clone(),
                second: item.signature_chain.second_signature.clone(),
                third: third.clone(),
            },
            queue_item_id: item.id.clone(),
            lock_id: item.lock_id.clone(),
            beneficiary,
            used_fallback_beneficiary: used_fallback,
            mode: receipt.mode,
            verification: item.verification.combine(third_verification),
        };

        let _writer = self.write_guard();
        let mut completed = self
            .store
            .queue_item(&item.id)
            .ok_or_else(|| SettlementError::not_found("queue item", &item.id))?;
        completed.status = MintStatus::Completed;
        completed.updated_at = confirmation.minted_at;

        let mut mutations = vec![
            StoreMutation::ExpectQueueStatus {
                item_id: item.id.clone(),
                status: MintStatus::Minting,
            },
            StoreMutation::PutConfirmation(confirmation.clone()),
            StoreMutation::PutQueueItem(completed),
        ];
        // Reserve mints leave the lock's own status alone.
        if item.reserve_id.is_none() {
            if let Some(mut lock) = self.store.lock(&item.lock_id) {
                if lock.status == LockStatus::Approved {
                    lock.status = LockStatus::Minted;
                    lock.put_signature(third);
                    lock.updated_at = confirmation.minted_at;
                    mutations.push(StoreMutation::PutLock(lock));
                }
            }
        }
        self.store.commit(mutations)?;
        Ok(confirmation)
    }
}

fn lock_key(lock_id: &str) -> String {
    format!("lock:{lock_id}")
}

fn mint_key(item_id: &str) -> String {
    format!("mint:{item_id}")
}
