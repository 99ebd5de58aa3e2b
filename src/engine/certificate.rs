// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Input handed to the external certificate renderer after a mint.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{SettlementError, SettlementResult};
use crate::models::{ConfirmationSignatures, Lock, MintConfirmation, MintMode, Verification};

/// Everything a backed certificate shows. Built only from a finalized lock
/// and its confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateInput {
    pub certificate_id: String,
    pub publication_code: String,
    pub authorization_code: String,
    pub lock_id: String,
    pub bank_name: String,
    pub custody_vault_ref: Option<String>,
    pub currency: String,
    pub locked_amount: String,
    pub minted_amount: String,
    pub beneficiary: String,
    pub used_fallback_beneficiary: bool,
    pub tx_hash: String,
    pub block_number: u64,
    pub network: Option<String>,
    pub chain_id: Option<u64>,
    pub signatures: ConfirmationSignatures,
    pub mode: MintMode,
    pub verification: Verification,
    pub minted_at: DateTime<Utc>,
}

impl CertificateInput {
    pub fn from_confirmation(lock: &Lock, confirmation: &MintConfirmation) -> SettlementResult<Self> {
        if confirmation.lock_id != lock.lock_id {
            return Err(SettlementError::validation(format!(
                "confirmation {} belongs to lock {}, not {}",
                confirmation.id, confirmation.lock_id, lock.lock_id
            )));
        }

        let input = Self {
            certificate_id: confirmation.certificate_id.clone(),
            publication_code: confirmation.publication_code.clone(),
            authorization_code: confirmation.authorization_code.clone(),
            lock_id: lock.lock_id.clone(),
            bank_name: lock.bank_name.clone(),
            custody_vault_ref: lock.custody_vault_ref.clone(),
            currency: lock.currency.clone(),
            locked_amount: lock.amount.to_string(),
            minted_amount: confirmation.minted_amount.clone(),
            beneficiary: confirmation.beneficiary.clone(),
            used_fallback_beneficiary: confirmation.used_fallback_beneficiary,
            tx_hash: confirmation.tx_hash.clone(),
            block_number: confirmation.block_number,
            network: lock.chain_refs.as_ref().map(|r| r.network.clone()),
            chain_id: lock.chain_refs.as_ref().map(|r| r.chain_id),
            signatures: confirmation.signatures.clone(),
            mode: confirmation.mode,
            verification: confirmation.verification,
            minted_at: confirmation.minted_at,
        };

        let missing: Vec<&str> = [
            ("certificate_id", &input.certificate_id),
            ("publication_code", &input.publication_code),
            ("authorization_code", &input.authorization_code),
            ("bank_name", &input.bank_name),
            ("minted_amount", &input.minted_amount),
            ("beneficiary", &input.beneficiary),
            ("tx_hash", &input.tx_hash),
            ("third_signature", &input.signatures.third.hash),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            return Err(SettlementError::validation(format!(
                "certificate for {} is missing {}",
                input.authorization_code,
                missing.join(", ")
            )));
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LockStatus, Signature, SignatureRole};
    use rust_decimal::Decimal;

    fn lock() -> Lock {
        let now = Utc::now();
        Lock {
            lock_id: "L1".into(),
            authorization_code: "AUTH-1".into(),
            amount: Decimal::from(10000),
            currency: "USD".into(),
            beneficiary: "0xabc".into(),
            bank_id: None,
            bank_name: "Digital Commercial Bank".into(),
            custody_vault_ref: Some("VAULT-1".into()),
            expiry: None,
            status: LockStatus::Minted,
            signatures: vec![],
            chain_refs: None,
            approved_amount: Some(Decimal::from(4000)),
            verification: Verification::Verified,
            created_at: now,
            updated_at: now,
        }
    }

    fn confirmation() -> MintConfirmation {
        MintConfirmation {
            id: "MC-1".into(),
            authorization_code: "AUTH-1".into(),
            publication_code: "PUB-1".into(),
            tx_hash: "0xtx".into(),
            block_number: 7,
            minted_amount: "4000".into(),
            minted_by: "settlement-engine".into(),
            minted_at: Utc::now(),
            signatures: ConfirmationSignatures {
                first: None,
                second: None,
                third: Signature::new(SignatureRole::BackedCertificate, "0x1", "0xsig"),
            },
            certificate_id: "CERT-1".into(),
            queue_item_id: "MQ-1".into(),
            lock_id: "L1".into(),
            beneficiary: "0xabc".into(),
            used_fallback_beneficiary: false,
            mode: MintMode::Direct,
            verification: Verification::Verified,
        }
    }

    #[test]
    fn complete_input_is_built() {
        let input = CertificateInput::from_confirmation(&lock(), &confirmation()).unwrap();
        assert_eq!(input.minted_amount, "4000");
        assert_eq!(input.locked_amount, "10000");
        assert_eq!(input.custody_vault_ref.as_deref(), Some("VAULT-1"));
    }

    #[test]
    fn empty_required_field_is_rejected() {
        let mut c = confirmation();
        c.tx_hash = String::new();
        let err = CertificateInput::from_confirmation(&lock(), &c).unwrap_err();
        assert!(err.to_string().contains("tx_hash"));

        let mut c = confirmation();
        c.lock_id = "L9".into();
        assert!(CertificateInput::from_confirmation(&lock(), &c).is_err());
    }
}
