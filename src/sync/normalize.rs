// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Raw upstream record -> canonical [`Lock`].
//!
//! Two record shapes arrive from upstream:
//!
//! - sync-table rows (`lock_id`, `amount_usd`, `bank_name`,
//!   `authorization_code`, `first_signature`, `blockchain_tx_hash`, ...)
//! - bank API notifications (`lockId`, `lockDetails.amount`,
//!   `bankInfo.bankName`, `signatures[]`, `blockchain.txHash`, ...)
//!
//! Fields are looked up by JSON pointer over both shapes, first match wins.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{
    generate_code, parse_amount, ChainRefs, Lock, LockStatus, Signature, SignatureRole,
    Verification, DEFAULT_CURRENCY,
};

const LOCK_ID: &[&str] = &["/lock_id", "/lockId", "/id"];
const AUTH_CODE: &[&str] = &["/authorization_code", "/authorizationCode"];
const AMOUNT: &[&str] = &["/amount_usd", "/lockDetails/amount", "/amount"];
const CURRENCY: &[&str] = &["/currency", "/lockDetails/currency"];
const BENEFICIARY: &[&str] = &["/beneficiary", "/lockDetails/beneficiary"];
const BANK_ID: &[&str] = &["/bank_id", "/bankInfo/bankId"];
const BANK_NAME: &[&str] = &["/bank_name", "/bankInfo/bankName"];
const BANK_SIGNER: &[&str] = &["/bankInfo/signerAddress", "/bankInfo/signer"];
const CUSTODY_VAULT: &[&str] = &["/custody_vault", "/lockDetails/custodyVault", "/bank_account"];
const EXPIRY: &[&str] = &["/expiry", "/lockDetails/expiry"];
const STATUS: &[&str] = &["/status"];
const TX_HASH: &[&str] = &["/blockchain_tx_hash", "/blockchain/txHash"];
const BLOCK: &[&str] = &["/blockchain_block", "/blockchain/blockNumber"];
const CHAIN_ID: &[&str] = &["/blockchain/chainId"];
const NETWORK: &[&str] = &["/blockchain/network"];
const CREATED_AT: &[&str] = &["/created_at", "/createdAt", "/timestamp"];

const UNKNOWN_BANK: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("record has no lock id")]
    MissingLockId,

    #[error("lock {lock_id}: missing or invalid amount")]
    InvalidAmount { lock_id: String },
}

/// Network written into chain refs when the record doesn't name one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDefaults {
    pub network: String,
    pub chain_id: u64,
}

/// Fields an upstream UPDATE may carry, each optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockPatch {
    pub status: Option<LockStatus>,
    pub beneficiary: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub signatures: Vec<Signature>,
    pub chain_refs: Option<ChainRefs>,
}

impl LockPatch {
    /// Merge into `lock`. Returns whether anything changed.
    ///
    /// Status only moves forward, beneficiary and expiry only change while
    /// the lock is pending, and signatures fill roles the lock lacks. The
    /// amount is never taken from an update.
    pub fn apply(&self, lock: &mut Lock) -> bool {
        let mut changed = false;

        if lock.status == LockStatus::Pending {
            if let Some(beneficiary) = &self.beneficiary {
                if *beneficiary != lock.beneficiary {
                    lock.beneficiary = beneficiary.clone();
                    changed = true;
                }
            }
            if self.expiry.is_some() && self.expiry != lock.expiry {
                lock.expiry = self.expiry;
                changed = true;
            }
        }

        for signature in &self.signatures {
            if lock.signature(signature.role).is_none() {
                lock.put_signature(signature.clone());
                changed = true;
            }
        }

        if lock.chain_refs.is_none() && self.chain_refs.is_some() {
            lock.chain_refs = self.chain_refs.clone();
            changed = true;
        }

        if let Some(status) = self.status {
            if status != lock.status && lock.status.can_advance_to(status) {
                lock.status = status;
                changed = true;
            }
        }

        changed
    }
}

pub fn lock_id(record: &Value) -> Option<String> {
    text(record, LOCK_ID)
}

/// Build a canonical lock from a first sighting of an upstream record.
pub fn normalize_lock(record: &Value, defaults: &ChainDefaults) -> Result<Lock, NormalizeError> {
    let lock_id = lock_id(record).ok_or(NormalizeError::MissingLockId)?;
    let amount = amount(record)
        .filter(|a| *a > Decimal::ZERO)
        .ok_or_else(|| NormalizeError::InvalidAmount {
            lock_id: lock_id.clone(),
        })?;
    let created_at = timestamp(record, CREATED_AT).unwrap_or_else(Utc::now);

    Ok(Lock {
        authorization_code: text(record, AUTH_CODE).unwrap_or_else(|| generate_code("AUTH")),
        amount,
        currency: text(record, CURRENCY)
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        beneficiary: text(record, BENEFICIARY).unwrap_or_default(),
        bank_id: text(record, BANK_ID),
        bank_name: text(record, BANK_NAME).unwrap_or_else(|| UNKNOWN_BANK.to_string()),
        custody_vault_ref: text(record, CUSTODY_VAULT),
        expiry: timestamp(record, EXPIRY),
        status: status(record).unwrap_or(LockStatus::Pending),
        signatures: signatures(record),
        chain_refs: chain_refs(record, defaults),
        approved_amount: None,
        verification: Verification::Verified,
        created_at,
        updated_at: created_at,
        lock_id,
    })
}

/// Extract the mergeable fields of an upstream UPDATE.
pub fn normalize_patch(record: &Value, defaults: &ChainDefaults) -> LockPatch {
    LockPatch {
        status: status(record),
        beneficiary: text(record, BENEFICIARY),
        expiry: timestamp(record, EXPIRY),
        signatures: signatures(record),
        chain_refs: chain_refs(record, defaults),
    }
}

// =============================================================================
// Field Extraction
// =============================================================================

/// First non-empty string (or number rendered as text) among `paths`.
fn text(record: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match record.pointer(path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn amount(record: &Value) -> Option<Decimal> {
    text(record, AMOUNT).and_then(|raw| parse_amount(&raw))
}

fn status(record: &Value) -> Option<LockStatus> {
    text(record, STATUS).and_then(|raw| raw.parse().ok())
}

fn timestamp(record: &Value, paths: &[&str]) -> Option<DateTime<Utc>> {
    text(record, paths)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn role(raw: &str) -> Option<SignatureRole> {
    let raw = raw.to_ascii_lowercase();
    if raw.contains("custody") || raw.contains("first") || raw.contains("bank") || raw.contains("dcb") {
        Some(SignatureRole::CustodyCertification)
    } else if raw.contains("approv") || raw.contains("second") || raw.contains("accept") {
        Some(SignatureRole::Approval)
    } else if raw.contains("backed") || raw.contains("third") || raw.contains("mint") {
        Some(SignatureRole::BackedCertificate)
    } else {
        None
    }
}

fn signatures(record: &Value) -> Vec<Signature> {
    let mut out: Vec<Signature> = Vec::new();
    let mut push = |signature: Signature| {
        if !out.iter().any(|s| s.role == signature.role) {
            out.push(signature);
        }
    };

    if let Some(list) = record.pointer("/signatures").and_then(Value::as_array) {
        for entry in list {
            let (Some(role), Some(hash)) = (
                entry.get("role").and_then(Value::as_str).and_then(role),
                text(entry, &["/hash"]),
            ) else {
                continue;
            };
            let mut signature = Signature::new(role, text(entry, &["/address"]).unwrap_or_default(), hash);
            if let Some(at) = timestamp(entry, &["/timestamp"]) {
                signature.timestamp = at;
            }
            if let Some(tx) = text(entry, &["/chainTx", "/chain_tx"]) {
                signature = signature.with_chain_tx(tx);
            }
            push(signature);
        }
    }

    let signer = text(record, BANK_SIGNER).unwrap_or_default();
    if let Some(hash) = text(record, &["/first_signature"]) {
        push(Signature::new(SignatureRole::CustodyCertification, signer.clone(), hash));
    }
    if let Some(hash) = text(record, &["/second_signature"]) {
        push(Signature::new(SignatureRole::Approval, String::new(), hash));
    }
    out
}

fn chain_refs(record: &Value, defaults: &ChainDefaults) -> Option<ChainRefs> {
    let tx_hash = text(record, TX_HASH);
    let block_number = text(record, BLOCK).and_then(|b| b.parse().ok());
    let chain_id = text(record, CHAIN_ID).and_then(|c| c.parse().ok());
    if tx_hash.is_none() && block_number.is_none() && chain_id.is_none() {
        return None;
    }
    Some(ChainRefs {
        network: text(record, NETWORK).unwrap_or_else(|| defaults.network.clone()),
        chain_id: chain_id.unwrap_or(defaults.chain_id),
        tx_hash,
        block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn defaults() -> ChainDefaults {
        ChainDefaults {
            network: "lemonchain".into(),
            chain_id: 1005,
        }
    }

    #[test]
    fn sync_table_row_normalizes() {
        let row = json!({
            "id": "row-1",
            "lock_id": "L1",
            "amount_usd": 10000,
            "beneficiary": "0x00000000000000000000000000000000000000a1",
            "bank_name": "Digital Commercial Bank",
            "bank_account": "ACC-9",
            "first_signature": "0xfirst",
            "second_signature": null,
            "status": "pending",
            "blockchain_tx_hash": "0xtx",
            "blockchain_block": 42,
            "authorization_code": "AUTH-XYZ",
            "created_at": "2026-01-05T10:00:00Z"
        });
        let lock = normalize_lock(&row, &defaults()).unwrap();
        assert_eq!(lock.lock_id, "L1");
        assert_eq!(lock.amount, Decimal::from(10000));
        assert_eq!(lock.authorization_code, "AUTH-XYZ");
        assert_eq!(lock.bank_name, "Digital Commercial Bank");
        assert_eq!(lock.custody_vault_ref.as_deref(), Some("ACC-9"));
        assert_eq!(lock.currency, "USD");
        assert_eq!(
            lock.signature(SignatureRole::CustodyCertification).unwrap().hash,
            "0xfirst"
        );
        assert!(lock.signature(SignatureRole::Approval).is_none());
        let refs = lock.chain_refs.unwrap();
        assert_eq!(refs.tx_hash.as_deref(), Some("0xtx"));
        assert_eq!(refs.block_number, Some(42));
        assert_eq!(refs.chain_id, 1005);
    }

    #[test]
    fn bank_notification_normalizes_to_same_shape() {
        let record = json!({
            "id": "n-1",
            "lockId": "L1",
            "authorizationCode": "AUTH-XYZ",
            "lockDetails": {
                "amount": "10,000.00",
                "currency": "usd",
                "beneficiary": "0x00000000000000000000000000000000000000a1",
                "custodyVault": "VAULT-1",
                "expiry": "2026-02-05T10:00:00Z"
            },
            "bankInfo": { "bankId": "DCB-001", "bankName": "Digital Commercial Bank", "signerAddress": "0xbank" },
            "signatures": [
                { "role": "custody_certification", "address": "0xbank", "hash": "0xfirst", "timestamp": "2026-01-05T10:00:00Z" }
            ],
            "blockchain": { "chainId": 1006, "network": "LemonChain" }
        });
        let lock = normalize_lock(&record, &defaults()).unwrap();
        assert_eq!(lock.lock_id, "L1");
        assert_eq!(lock.amount, Decimal::from_str("10000").unwrap());
        assert_eq!(lock.currency, "USD");
        assert_eq!(lock.bank_id.as_deref(), Some("DCB-001"));
        assert_eq!(lock.custody_vault_ref.as_deref(), Some("VAULT-1"));
        assert!(lock.expiry.is_some());
        let first = lock.signature(SignatureRole::CustodyCertification).unwrap();
        assert_eq!(first.address, "0xbank");
        let refs = lock.chain_refs.unwrap();
        assert_eq!(refs.chain_id, 1006);
        assert_eq!(refs.network, "LemonChain");
        assert!(refs.tx_hash.is_none());
    }

    #[test]
    fn missing_code_is_generated_and_bad_amount_rejected() {
        let lock = normalize_lock(&json!({"lock_id": "L2", "amount": "5"}), &defaults()).unwrap();
        assert!(lock.authorization_code.starts_with("AUTH-"));
        assert!(lock.chain_refs.is_none());

        assert_eq!(
            normalize_lock(&json!({"lock_id": "L3", "amount": "0"}), &defaults()),
            Err(NormalizeError::InvalidAmount { lock_id: "L3".into() })
        );
        assert_eq!(
            normalize_lock(&json!({"amount": "5"}), &defaults()),
            Err(NormalizeError::MissingLockId)
        );
    }

    #[test]
    fn patch_never_moves_status_backwards() {
        let mut lock = normalize_lock(
            &json!({"lock_id": "L1", "amount": 10, "status": "approved"}),
            &defaults(),
        )
        .unwrap();
        let patch = normalize_patch(&json!({"lock_id": "L1", "status": "pending"}), &defaults());
        assert!(!patch.apply(&mut lock));
        assert_eq!(lock.status, LockStatus::Approved);

        let patch = normalize_patch(
            &json!({"lock_id": "L1", "status": "minted", "beneficiary": "0xnew"}),
            &defaults(),
        );
        assert!(patch.apply(&mut lock));
        assert_eq!(lock.status, LockStatus::Minted);
        // beneficiary is frozen once the lock left pending
        assert_ne!(lock.beneficiary, "0xnew");
    }

    #[test]
    fn patch_cannot_mint_a_pending_lock() {
        let mut lock = normalize_lock(
            &json!({"lock_id": "L1", "amount": 10, "status": "pending"}),
            &defaults(),
        )
        .unwrap();
        let patch = normalize_patch(&json!({"lock_id": "L1", "status": "minted"}), &defaults());
        assert!(!patch.apply(&mut lock));
        assert_eq!(lock.status, LockStatus::Pending);
    }
}
