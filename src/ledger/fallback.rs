// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Locally generated pseudo-signatures.
//!
//! Used when the ledger cannot be reached so the operator workflow keeps
//! moving. Records carrying one are flagged [`Verification::Unverified`]
//! and stay queryable until reconciliation.
//!
//! [`Verification::Unverified`]: crate::models::Verification::Unverified

use sha2::{Digest, Sha256};

use crate::models::{Signature, SignatureRole};

/// Signer recorded on pseudo-signatures. Never a real key.
pub const LOCAL_SIGNER: &str = "0x0000000000000000000000000000000000000000";

/// A random, unforgeable-by-accident placeholder for `role` over `subject`.
pub fn pseudo_signature(role: SignatureRole, subject: &str) -> Signature {
    let mut hasher = Sha256::new();
    hasher.update(role.to_string().as_bytes());
    hasher.update(subject.as_bytes());
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let hash = format!("0x{}", alloy::hex::encode(hasher.finalize()));
    Signature::new(role, LOCAL_SIGNER, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_signatures_are_unique_and_marked() {
        let a = pseudo_signature(SignatureRole::Approval, "L1");
        let b = pseudo_signature(SignatureRole::Approval, "L1");
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 66);
        assert_eq!(a.role, SignatureRole::Approval);
        assert_eq!(a.address, LOCAL_SIGNER);
        assert!(a.chain_tx.is_none());
    }
}
