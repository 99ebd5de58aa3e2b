// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Error taxonomy for the settlement core.
//!
//! | Variant | Caller behaviour |
//! |---------|------------------|
//! | `Validation` | rejected synchronously, nothing was mutated |
//! | `StateConflict` | record not in the required state; refresh and retry |
//! | `NotFound` | unknown id |
//! | `LedgerUnavailable` | transport failure; approval paths degrade to unverified |
//! | `Mint` | step 4 did not complete; retry is safe |
//! | `Storage` | durable write failed and the in-memory mutation was rolled back |
//! | `NotificationDelivery` | best-effort, logged only |

use crate::ledger::LedgerError;
use crate::notify::DeliveryError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state conflict: {entity} {id} is {actual}, expected {expected}")]
    StateConflict {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(#[from] LedgerError),

    #[error("mint failed for {authorization_code}: {reason}")]
    Mint {
        authorization_code: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("notification delivery failed: {0}")]
    NotificationDelivery(#[from] DeliveryError),
}

pub type SettlementResult<T> = Result<T, SettlementError>;

impl SettlementError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    pub fn conflict(
        entity: &'static str,
        id: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::StateConflict {
            entity,
            id: id.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn mint(authorization_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mint {
            authorization_code: authorization_code.into(),
            reason: reason.into(),
        }
    }

    /// Whether the operator may simply retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StateConflict { .. }
                | Self::LedgerUnavailable(_)
                | Self::Mint { .. }
                | Self::Storage(_)
        )
    }
}
