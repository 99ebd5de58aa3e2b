// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Signature-Chain Ledger
//!
//! The ledger anchors the three-link signature chain:
//!
//! ```text
//! register_custody_certification   1st signature (bank custody)
//! accept_lock                      2nd signature (approval)
//! move_to_reserve                  reserve bookkeeping for a partial approval
//! mint_and_certify                 3rd signature (backed certificate) + mint
//! ```
//!
//! Every operation is safe to retry. Each request derives an idempotency key
//! from its inputs; [`GuardedLedger`] de-duplicates successful submissions on
//! that key and bounds every call with a timeout.
//!
//! Implementations return `Err` only for transport failures (unreachable
//! ledger, timeout). A ledger that answers but refuses the operation returns
//! a receipt with `success == false`.

pub mod evm;
pub mod fallback;
pub mod guard;
pub mod sandbox;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{Lock, MintMode, Signature, SignatureChain};

pub use evm::EvmLedgerClient;
pub use guard::GuardedLedger;
pub use sandbox::SandboxLedger;

// =============================================================================
// Receipts
// =============================================================================

/// Outcome of one ledger operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    /// Signature issued by the ledger for this step (0x-prefixed).
    pub signature: Option<String>,
    /// Address that produced `signature`.
    pub signer: Option<String>,
    /// Ledger-side identifier of the anchored record (e.g. injection id).
    pub reference: Option<String>,
    pub error: Option<String>,
}

impl LedgerReceipt {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub receipt: LedgerReceipt,
    pub publication_code: Option<String>,
    pub certificate_id: Option<String>,
    pub mode: MintMode,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("ledger client misconfigured: {0}")]
    Configuration(String),

    /// The ledger answered but cannot say whether an earlier submission landed.
    #[error("ledger outcome unresolved: {0}")]
    Unresolved(String),
}

/// Network a client is bound to, recorded in chain refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerNetwork {
    pub name: String,
    pub chain_id: u64,
    /// Address of the signature-chain contract, when there is one.
    pub contract: Option<String>,
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyRequest {
    pub lock_id: String,
    pub authorization_code: String,
    pub amount: Decimal,
    pub beneficiary: String,
    pub bank_name: String,
    pub first_signature: Option<Signature>,
}

impl CustodyRequest {
    pub fn from_lock(lock: &Lock) -> Self {
        Self {
            lock_id: lock.lock_id.clone(),
            authorization_code: lock.authorization_code.clone(),
            amount: lock.amount,
            beneficiary: lock.beneficiary.clone(),
            bank_name: lock.bank_name.clone(),
            first_signature: lock
                .signature(crate::models::SignatureRole::CustodyCertification)
                .cloned(),
        }
    }

    pub fn idempotency_key(&self) -> String {
        idempotency_key("register_custody", &[&self.lock_id])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptRequest {
    pub lock_id: String,
    pub authorization_code: String,
    pub approved_amount: Decimal,
    /// Ledger reference returned by the custody registration.
    pub ledger_ref: Option<String>,
}

impl AcceptRequest {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(
            "accept_lock",
            &[&self.lock_id, &self.approved_amount.normalize().to_string()],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub lock_id: String,
    pub reserve_id: String,
    pub authorization_code: String,
    pub amount: Decimal,
    pub ledger_ref: Option<String>,
}

impl ReserveRequest {
    pub fn idempotency_key(&self) -> String {
        idempotency_key("move_to_reserve", &[&self.lock_id, &self.reserve_id])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    pub queue_item_id: String,
    pub authorization_code: String,
    pub lock_id: String,
    pub amount: Decimal,
    /// Already-resolved, valid beneficiary address.
    pub beneficiary: String,
    pub signature_chain: SignatureChain,
}

impl MintRequest {
    /// One mint per authorization code, whatever the retry count.
    pub fn idempotency_key(&self) -> String {
        idempotency_key("mint_and_certify", &[&self.authorization_code])
    }

    pub fn mode(&self) -> MintMode {
        if self.signature_chain.is_empty() {
            MintMode::Direct
        } else {
            MintMode::SignatureChain
        }
    }
}

// =============================================================================
// Client Trait
// =============================================================================

#[async_trait]
pub trait SignatureChainClient: Send + Sync {
    fn network(&self) -> LedgerNetwork;

    async fn register_custody_certification(
        &self,
        request: &CustodyRequest,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn accept_lock(&self, request: &AcceptRequest) -> Result<LedgerReceipt, LedgerError>;

    async fn move_to_reserve(&self, request: &ReserveRequest) -> Result<LedgerReceipt, LedgerError>;

    async fn mint_and_certify(&self, request: &MintRequest) -> Result<MintReceipt, LedgerError>;

    /// Look up a mint already anchored for this request.
    ///
    /// Used to settle a timed-out `mint_and_certify` before resubmitting.
    /// `Ok(None)` means the mint definitely did not land; when that cannot be
    /// established the answer is [`LedgerError::Unresolved`].
    async fn find_mint(&self, request: &MintRequest) -> Result<Option<MintReceipt>, LedgerError>;
}

/// Registration and acceptance results for one approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub registration: LedgerReceipt,
    pub acceptance: LedgerReceipt,
}

impl ApprovalOutcome {
    /// Both steps succeeded and the ledger issued the 2nd signature.
    pub fn is_signed(&self) -> bool {
        self.registration.success && self.acceptance.success && self.acceptance.signature.is_some()
    }

    pub fn injection_id(&self) -> Option<&str> {
        self.registration.reference.as_deref()
    }
}

/// Register the lock's custody certification, then accept it for `amount`.
///
/// Acceptance is skipped when the registration was refused.
pub async fn register_and_accept(
    client: &dyn SignatureChainClient,
    lock: &Lock,
    amount: Decimal,
) -> Result<ApprovalOutcome, LedgerError> {
    let registration = client
        .register_custody_certification(&CustodyRequest::from_lock(lock))
        .await?;
    if !registration.success {
        let reason = registration
            .error
            .clone()
            .unwrap_or_else(|| "custody registration refused".to_string());
        return Ok(ApprovalOutcome {
            registration,
            acceptance: LedgerReceipt::failed(reason),
        });
    }

    let acceptance = client
        .accept_lock(&AcceptRequest {
            lock_id: lock.lock_id.clone(),
            authorization_code: lock.authorization_code.clone(),
            approved_amount: amount,
            ledger_ref: registration.reference.clone(),
        })
        .await?;

    Ok(ApprovalOutcome {
        registration,
        acceptance,
    })
}

/// Stable 0x-prefixed SHA-256 key over an operation name and its inputs.
pub fn idempotency_key(operation: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    for part in parts {
        hasher.update([0x1f]);
        hasher.update(part.as_bytes());
    }
    format!("0x{}", alloy::hex::encode(hasher.finalize()))
}
