// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Custody Settlement - Lock-to-Mint Settlement Core
//!
//! Turns bank-certified custody locks into minted stablecoin through a
//! three-signature chain anchored on an EVM ledger.
//!
//! ## Modules
//!
//! - `sync` - Upstream lock ingestion (poll + push), normalization, de-dup
//! - `storage` - `LockStore` with write-through to redb
//! - `engine` - Approve / reject / promote / mint state machine
//! - `ledger` - Signature-chain ledger client (alloy EVM + sandbox)
//! - `notify` - Outbox-backed notification relay and signed webhooks
//! - `state` - Component wiring for the host binary

pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod state;
pub mod storage;
pub mod sync;
