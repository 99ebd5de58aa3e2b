// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EVM signature-chain client.
//!
//! Drives the lock-reserve/minter contract through alloy. Each write is sent
//! from the operator wallet, awaited to a receipt, and the relevant event is
//! decoded from the receipt logs to recover ledger ids and signatures.
//!
//! | Operation | Contract call | Event |
//! |-----------|---------------|-------|
//! | register_custody_certification | `receiveLock` | `LockReceived` |
//! | accept_lock | `acceptLock` | `LockAccepted` |
//! | move_to_reserve | `moveToReserve` | `MovedToReserve` |
//! | mint_and_certify | `generateBackedSignatureAndMint` | `VUSDMinted` |
//!
//! Reverts and refused simulations come back as failed receipts; only RPC
//! transport failures are returned as [`LedgerError`].

use std::str::FromStr;

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{keccak256, Address, B256, U256},
    providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder},
    rpc::types::{Filter, TransactionReceipt},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{
    AcceptRequest, CustodyRequest, LedgerError, LedgerNetwork, LedgerReceipt, MintReceipt,
    MintRequest, ReserveRequest, SignatureChainClient,
};
use crate::config::EvmLedgerConfig;

sol! {
    #[sol(rpc)]
    interface ISignatureChain {
        function receiveLock(bytes32 usdInjectionId, uint256 amount, address beneficiary, bytes32 firstSignature) external returns (bytes32);
        function acceptLock(bytes32 lockId) external returns (bytes32, string);
        function moveToReserve(bytes32 lockId) external;
        function generateBackedSignatureAndMint(bytes32 lockReserveId, uint256 amount, address beneficiary, bytes32 emisorTxHash) external returns (bytes32, bytes32, string);
        function getCertificateByLock(bytes32 lockId) external view returns (bytes32);

        event LockReceived(bytes32 indexed lockId, bytes32 indexed usdInjectionId, uint256 amount, address indexed beneficiary, bytes32 firstSignature, uint256 timestamp);
        event LockAccepted(bytes32 indexed lockId, address indexed acceptedBy, bytes32 secondSignature, string authorizationCode, uint256 timestamp);
        event MovedToReserve(bytes32 indexed lockId, uint256 amount, uint256 timestamp);
        event VUSDMinted(bytes32 indexed certificateId, address indexed beneficiary, uint256 vusdAmount, uint256 usdBacking, bytes32 backedSignature, string publicationCode, uint256 timestamp);
    }
}

/// How far back `find_mint` scans for the mint event of a known certificate.
const MINT_LOOKBACK_BLOCKS: u64 = 50_000;

enum Submission {
    Mined(TransactionReceipt),
    Refused(String),
}

pub struct EvmLedgerClient {
    network: LedgerNetwork,
    provider: DynProvider,
    contract: ISignatureChain::ISignatureChainInstance<DynProvider>,
    contract_address: Address,
    signer: Address,
    token_decimals: u8,
}

impl EvmLedgerClient {
    pub fn new(
        config: &EvmLedgerConfig,
        network: impl Into<String>,
        chain_id: u64,
        token_decimals: u8,
    ) -> Result<Self, LedgerError> {
        let url: url::Url = config
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| LedgerError::Configuration(format!("rpc url: {e}")))?;
        let contract_address = Address::from_str(&config.contract_address)
            .map_err(|e| LedgerError::Configuration(format!("contract address: {e}")))?;

        let key_bytes = alloy::hex::decode(config.signer_key_hex.trim_start_matches("0x"))
            .map_err(|e| LedgerError::Configuration(format!("signer key: {e}")))?;
        let signer = PrivateKeySigner::from_slice(&key_bytes)
            .map_err(|e| LedgerError::Configuration(format!("signer key: {e}")))?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url).erased();
        let contract = ISignatureChain::new(contract_address, provider.clone());

        tracing::info!(
            contract = %contract_address,
            signer = %signer_address,
            chain_id,
            "EVM ledger client ready"
        );

        Ok(Self {
            network: LedgerNetwork {
                name: network.into(),
                chain_id,
                contract: Some(format!("{contract_address:#x}")),
            },
            provider,
            contract,
            contract_address,
            signer: signer_address,
            token_decimals,
        })
    }

    /// Wait for the receipt of a sent transaction.
    async fn settle(
        &self,
        operation: &'static str,
        sent: Result<PendingTransactionBuilder<Ethereum>, alloy::contract::Error>,
    ) -> Result<Submission, LedgerError> {
        let pending = match sent {
            Ok(pending) => pending,
            Err(alloy::contract::Error::TransportError(e)) if !e.is_error_resp() => {
                return Err(LedgerError::Transport(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(operation, error = %e, "Ledger refused transaction");
                return Ok(Submission::Refused(e.to_string()));
            }
        };

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LedgerError::Transport(format!("{operation}: {e}")))?;

        if !receipt.status() {
            let reason = format!("{operation} reverted in {:#x}", receipt.transaction_hash);
            tracing::warn!(operation, tx_hash = %receipt.transaction_hash, "Ledger transaction reverted");
            return Ok(Submission::Refused(reason));
        }
        Ok(Submission::Mined(receipt))
    }

    fn base_receipt(&self, receipt: &TransactionReceipt) -> LedgerReceipt {
        LedgerReceipt {
            success: true,
            tx_hash: Some(format!("{:#x}", receipt.transaction_hash)),
            block_number: receipt.block_number,
            signature: None,
            signer: Some(format!("{:#x}", self.signer)),
            reference: None,
            error: None,
        }
    }
}

fn decode_event<E: SolEvent>(receipt: &TransactionReceipt) -> Option<E> {
    receipt
        .inner
        .logs()
        .iter()
        .find_map(|log| log.log_decode::<E>().ok())
        .map(|decoded| decoded.inner.data)
}

/// 0x-prefixed 32-byte hex, or the keccak of the text when it isn't one.
fn to_bytes32(value: &str) -> B256 {
    B256::from_str(value).unwrap_or_else(|_| keccak256(value.as_bytes()))
}

fn hex32(value: B256) -> String {
    format!("{value:#x}")
}

/// Convert a money amount into integer token units.
pub fn to_token_units(amount: Decimal, decimals: u8) -> Option<U256> {
    let scale = Decimal::from(10u64.checked_pow(u32::from(decimals))?);
    let units = amount.checked_mul(scale)?.trunc();
    units.to_u128().map(U256::from)
}

#[async_trait]
impl SignatureChainClient for EvmLedgerClient {
    fn network(&self) -> LedgerNetwork {
        self.network.clone()
    }

    async fn register_custody_certification(
        &self,
        request: &CustodyRequest,
    ) -> Result<LedgerReceipt, LedgerError> {
        let Some(amount) = to_token_units(request.amount, self.token_decimals) else {
            return Ok(LedgerReceipt::failed(format!(
                "amount {} not representable",
                request.amount
            )));
        };
        let beneficiary = match Address::from_str(&request.beneficiary) {
            Ok(address) => address,
            Err(e) => return Ok(LedgerReceipt::failed(format!("beneficiary: {e}"))),
        };
        let injection_id = keccak256(request.idempotency_key().as_bytes());
        let first_signature = request
            .first_signature
            .as_ref()
            .map(|s| to_bytes32(&s.hash))
            .unwrap_or(B256::ZERO);

        let sent = self
            .contract
            .receiveLock(injection_id, amount, beneficiary, first_signature)
            .send()
            .await;
        match self.settle("receiveLock", sent).await? {
            Submission::Refused(reason) => Ok(LedgerReceipt::failed(reason)),
            Submission::Mined(receipt) => {
                let event = decode_event::<ISignatureChain::LockReceived>(&receipt);
                Ok(LedgerReceipt {
                    signature: event.as_ref().map(|e| hex32(e.firstSignature)),
                    reference: event.map(|e| hex32(e.lockId)),
                    ..self.base_receipt(&receipt)
                })
            }
        }
    }

    async fn accept_lock(&self, request: &AcceptRequest) -> Result<LedgerReceipt, LedgerError> {
        let Some(lock_ref) = request.ledger_ref.as_deref() else {
            return Ok(LedgerReceipt::failed("lock is not registered on the ledger"));
        };
        let sent = self.contract.acceptLock(to_bytes32(lock_ref)).send().await;
        match self.settle("acceptLock", sent).await? {
            Submission::Refused(reason) => Ok(LedgerReceipt::failed(reason)),
            Submission::Mined(receipt) => {
                let event = decode_event::<ISignatureChain::LockAccepted>(&receipt);
                if let Some(code) = event.as_ref().map(|e| e.authorizationCode.as_str()) {
                    if code != request.authorization_code {
                        tracing::debug!(
                            lock_id = %request.lock_id,
                            ledger_code = code,
                            "Ledger issued its own authorization code"
                        );
                    }
                }
                Ok(LedgerReceipt {
                    signature: event.map(|e| hex32(e.secondSignature)),
                    reference: Some(lock_ref.to_string()),
                    ..self.base_receipt(&receipt)
                })
            }
        }
    }

    async fn move_to_reserve(&self, request: &ReserveRequest) -> Result<LedgerReceipt, LedgerError> {
        let Some(lock_ref) = request.ledger_ref.as_deref() else {
            return Ok(LedgerReceipt::failed("lock is not registered on the ledger"));
        };
        let sent = self.contract.moveToReserve(to_bytes32(lock_ref)).send().await;
        match self.settle("moveToReserve", sent).await? {
            Submission::Refused(reason) => Ok(LedgerReceipt::failed(reason)),
            Submission::Mined(receipt) => {
                if decode_event::<ISignatureChain::MovedToReserve>(&receipt).is_none() {
                    tracing::debug!(reserve_id = %request.reserve_id, "No MovedToReserve event in receipt");
                }
                Ok(LedgerReceipt {
                    reference: Some(lock_ref.to_string()),
                    ..self.base_receipt(&receipt)
                })
            }
        }
    }

    async fn mint_and_certify(&self, request: &MintRequest) -> Result<MintReceipt, LedgerError> {
        let mode = request.mode();
        let refused = |reason: String| MintReceipt {
            receipt: LedgerReceipt::failed(reason),
            publication_code: None,
            certificate_id: None,
            mode,
        };

        let Some(amount) = to_token_units(request.amount, self.token_decimals) else {
            return Ok(refused(format!("amount {} not representable", request.amount)));
        };
        let beneficiary = match Address::from_str(&request.beneficiary) {
            Ok(address) => address,
            Err(e) => return Ok(refused(format!("beneficiary: {e}"))),
        };
        // Direct mode mints against the zero reserve.
        let reserve_ref = request
            .signature_chain
            .injection_id
            .as_deref()
            .map(to_bytes32)
            .unwrap_or(B256::ZERO);
        let emisor_tx = request
            .signature_chain
            .lock_tx_hash
            .as_deref()
            .map(to_bytes32)
            .unwrap_or_else(|| keccak256(request.idempotency_key().as_bytes()));

        let sent = self
            .contract
            .generateBackedSignatureAndMint(reserve_ref, amount, beneficiary, emisor_tx)
            .send()
            .await;
        match self.settle("generateBackedSignatureAndMint", sent).await? {
            Submission::Refused(reason) => Ok(refused(reason)),
            Submission::Mined(receipt) => {
                let event = decode_event::<ISignatureChain::VUSDMinted>(&receipt);
                Ok(MintReceipt {
                    receipt: LedgerReceipt {
                        signature: event.as_ref().map(|e| hex32(e.backedSignature)),
                        reference: request.signature_chain.injection_id.clone(),
                        ..self.base_receipt(&receipt)
                    },
                    publication_code: event.as_ref().map(|e| e.publicationCode.clone()),
                    certificate_id: event.map(|e| hex32(e.certificateId)),
                    mode,
                })
            }
        }
    }

    async fn find_mint(&self, request: &MintRequest) -> Result<Option<MintReceipt>, LedgerError> {
        let Some(lock_ref) = request.signature_chain.injection_id.as_deref() else {
            return Err(LedgerError::Unresolved(format!(
                "direct mint {} has no ledger lock to look up",
                request.authorization_code
            )));
        };
        let certificate_id = self
            .contract
            .getCertificateByLock(to_bytes32(lock_ref))
            .call()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        if certificate_id == B256::ZERO {
            return Ok(None);
        }

        let latest = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(ISignatureChain::VUSDMinted::SIGNATURE_HASH)
            .topic1(certificate_id)
            .from_block(latest.saturating_sub(MINT_LOOKBACK_BLOCKS))
            .to_block(latest);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;

        let Some(log) = logs.first() else {
            tracing::warn!(
                certificate_id = %certificate_id,
                "Certificate exists but its mint event is outside the lookback window"
            );
            return Err(LedgerError::Unresolved(format!(
                "certificate {} has no mint event in the last {MINT_LOOKBACK_BLOCKS} blocks",
                hex32(certificate_id)
            )));
        };
        let Some(event) = log
            .log_decode::<ISignatureChain::VUSDMinted>()
            .ok()
            .map(|decoded| decoded.inner.data)
        else {
            return Err(LedgerError::Unresolved(format!(
                "mint event of certificate {} cannot be decoded",
                hex32(certificate_id)
            )));
        };

        // Reserve mints draw on the same ledger lock as the lock's own mint.
        if !mint_event_matches(&event, request, self.token_decimals) {
            return Err(LedgerError::Unresolved(format!(
                "ledger lock {lock_ref} carries certificate {} for a different mint",
                hex32(certificate_id)
            )));
        }

        Ok(Some(MintReceipt {
            receipt: LedgerReceipt {
                success: true,
                tx_hash: log.transaction_hash.map(hex32),
                block_number: log.block_number,
                signature: Some(hex32(event.backedSignature)),
                signer: Some(format!("{:#x}", self.signer)),
                reference: Some(lock_ref.to_string()),
                error: None,
            },
            publication_code: Some(event.publicationCode),
            certificate_id: Some(hex32(certificate_id)),
            mode: request.mode(),
        }))
    }
}

/// Whether a decoded mint event was produced by `request`.
fn mint_event_matches(event: &ISignatureChain::VUSDMinted, request: &MintRequest, decimals: u8) -> bool {
    let Some(units) = to_token_units(request.amount, decimals) else {
        return false;
    };
    let beneficiary_matches = Address::from_str(&request.beneficiary)
        .is_ok_and(|address| address == event.beneficiary);
    beneficiary_matches && (event.vusdAmount == units || event.usdBacking == units)
}
