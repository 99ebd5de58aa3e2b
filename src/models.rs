// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement Data Model
//!
//! Canonical records shared by every component. Upstream payloads of any
//! shape are normalized into these types once, at ingestion
//! (see [`crate::sync::normalize`]); nothing downstream reads raw JSON.
//!
//! ## Record Relationships
//!
//! ```text
//! Lock 1 ── 0..1 LockReserve
//! Lock / LockReserve 1 ── 0..* MintQueueItem
//! MintQueueItem 1 ── 0..1 MintConfirmation
//! Lock 1 ── 0..1 RejectedLock
//! ```
//!
//! Amounts are [`Decimal`] money values rounded to cents and serialized as
//! strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Money
// =============================================================================

/// Default currency when an upstream record omits one.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Round to cents and strip trailing zeros (`4000.00` becomes `4000`).
pub fn normalize_amount(amount: Decimal) -> Decimal {
    amount.round_dp(2).normalize()
}

/// Parse a human-entered amount such as `"10,000.50"` or `"$4000"`.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | ' ' | '_'))
        .collect();
    Decimal::from_str(&cleaned).ok().map(normalize_amount)
}

// =============================================================================
// Identifiers
// =============================================================================

/// Generate a human-shareable reference: `PREFIX-<base36 millis>-<random>`.
///
/// Used for authorization codes (`AUTH`), publication codes (`PUB`),
/// reserve ids (`RSV`), queue ids (`MQ`) and confirmation ids (`MC`).
pub fn generate_code(prefix: &str) -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}-{}-{}",
        to_base36(millis),
        random[..6].to_ascii_uppercase()
    )
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

// =============================================================================
// Verification
// =============================================================================

/// Whether a record's signatures were produced by the ledger or synthesized
/// locally because the ledger was unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    #[default]
    Verified,
    /// Carries a locally generated pseudo-signature; needs reconciliation.
    Unverified,
}

impl Verification {
    pub fn is_unverified(self) -> bool {
        self == Self::Unverified
    }

    /// Unverified wins: a record built from any unverified part is unverified.
    pub fn combine(self, other: Self) -> Self {
        if self.is_unverified() || other.is_unverified() {
            Self::Unverified
        } else {
            Self::Verified
        }
    }
}

// =============================================================================
// Signatures
// =============================================================================

/// Position of a signature in the three-link chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureRole {
    /// 1st signature: bank custody certification, carried by the upstream lock.
    CustodyCertification,
    /// 2nd signature: lock acceptance.
    Approval,
    /// 3rd signature: backed certificate issued at mint.
    BackedCertificate,
}

impl fmt::Display for SignatureRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CustodyCertification => "custody_certification",
            Self::Approval => "approval",
            Self::BackedCertificate => "backed_certificate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub role: SignatureRole,
    /// Signer address (0x-prefixed).
    pub address: String,
    /// Signature hash (0x-prefixed).
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_tx: Option<String>,
}

impl Signature {
    pub fn new(role: SignatureRole, address: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            role,
            address: address.into(),
            hash: hash.into(),
            timestamp: Utc::now(),
            chain_tx: None,
        }
    }

    pub fn with_chain_tx(mut self, tx_hash: impl Into<String>) -> Self {
        self.chain_tx = Some(tx_hash.into());
        self
    }
}

/// Where a record was anchored on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRefs {
    pub network: String,
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

// =============================================================================
// Lock
// =============================================================================

/// Lock lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Pending,
    Approved,
    Rejected,
    Minted,
}

impl LockStatus {
    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Staying in the same status is always allowed.
    pub fn can_advance_to(self, next: Self) -> bool {
        use LockStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Approved | Rejected) => true,
            (Approved, Minted) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Minted)
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Minted => "minted",
        };
        f.write_str(s)
    }
}

impl FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "locked" | "new" => Ok(Self::Pending),
            "approved" | "accepted" => Ok(Self::Approved),
            "rejected" | "cancelled" => Ok(Self::Rejected),
            "minted" | "completed" => Ok(Self::Minted),
            other => Err(format!("unknown lock status `{other}`")),
        }
    }
}

/// Custody-fund reservation certified by a bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    /// Unique across all locks.
    pub authorization_code: String,
    pub amount: Decimal,
    pub currency: String,
    pub beneficiary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_id: Option<String>,
    pub bank_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custody_vault_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    pub status: LockStatus,
    #[serde(default)]
    pub signatures: Vec<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_refs: Option<ChainRefs>,
    /// Amount approved for minting, set on approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_amount: Option<Decimal>,
    #[serde(default)]
    pub verification: Verification,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lock {
    pub fn signature(&self, role: SignatureRole) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.role == role)
    }

    /// Replace any existing signature with the same role.
    pub fn put_signature(&mut self, signature: Signature) {
        self.signatures.retain(|s| s.role != signature.role);
        self.signatures.push(signature);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

// =============================================================================
// Lock Reserve
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveStatus {
    Active,
    FullyConsumed,
}

impl fmt::Display for ReserveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::FullyConsumed => "fully_consumed",
        })
    }
}

/// Unconsumed remainder of a lock after partial approval.
///
/// Invariant: `remaining_amount == original_amount - consumed_amount >= 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReserve {
    pub id: String,
    pub original_lock_id: String,
    /// Distinct from the lock's code so the reserve mints under its own
    /// confirmation.
    pub authorization_code: String,
    pub original_amount: Decimal,
    pub remaining_amount: Decimal,
    pub consumed_amount: Decimal,
    pub beneficiary: String,
    pub bank_name: String,
    pub currency: String,
    pub status: ReserveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_tx_hash: Option<String>,
    /// Ledger record of the source lock. Promoted mints draw on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_ref: Option<String>,
    #[serde(default)]
    pub verification: Verification,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LockReserve {
    pub fn is_balanced(&self) -> bool {
        self.remaining_amount >= Decimal::ZERO
            && self.consumed_amount >= Decimal::ZERO
            && self.consumed_amount + self.remaining_amount == self.original_amount
    }

    /// Consume the whole remainder; reserves are never re-split.
    pub fn consume_all(&mut self) -> Decimal {
        let taken = self.remaining_amount;
        self.consumed_amount = self.original_amount;
        self.remaining_amount = Decimal::ZERO;
        self.status = ReserveStatus::FullyConsumed;
        self.updated_at = Utc::now();
        taken
    }
}

// =============================================================================
// Mint Queue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStatus {
    Pending,
    /// Ledger call in flight or outcome unknown (e.g. client timeout).
    Minting,
    Completed,
    Cancelled,
}

impl MintStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for MintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Minting => "minting",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Signatures and ledger references collected before the mint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureChain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_tx_hash: Option<String>,
}

impl SignatureChain {
    /// No prior links: the mint runs unilaterally.
    pub fn is_empty(&self) -> bool {
        self.first_signature.is_none() && self.second_signature.is_none()
    }
}

/// An amount authorized for minting.
///
/// Denominated in the lock's source currency until completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintQueueItem {
    pub id: String,
    pub authorization_code: String,
    pub amount_usd: Decimal,
    pub currency: String,
    pub lock_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_id: Option<String>,
    pub bank_name: String,
    pub beneficiary: String,
    pub status: MintStatus,
    #[serde(default)]
    pub signature_chain: SignatureChain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub verification: Verification,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Mint Confirmation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintMode {
    /// Mint linked to the prior two signatures.
    SignatureChain,
    /// No prior signatures; minted unilaterally.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationSignatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<Signature>,
    pub third: Signature,
}

/// Record of a successful mint. At most one per authorization code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintConfirmation {
    pub id: String,
    pub authorization_code: String,
    pub publication_code: String,
    pub tx_hash: String,
    pub block_number: u64,
    /// Normalized decimal string, e.g. `"4000"`.
    pub minted_amount: String,
    pub minted_by: String,
    pub minted_at: DateTime<Utc>,
    pub signatures: ConfirmationSignatures,
    pub certificate_id: String,
    pub queue_item_id: String,
    pub lock_id: String,
    /// Address actually credited.
    pub beneficiary: String,
    pub used_fallback_beneficiary: bool,
    pub mode: MintMode,
    #[serde(default)]
    pub verification: Verification,
}

// =============================================================================
// Rejected Lock
// =============================================================================

/// Terminal, immutable rejection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedLock {
    pub lock_id: String,
    pub reason: String,
    pub rejected_by: String,
    pub rejected_at: DateTime<Utc>,
}
