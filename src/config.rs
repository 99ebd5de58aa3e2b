// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup. Empty values are
//! treated as unset.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the settlement database | `./data` |
//! | `LEDGER_MODE` | `evm` or `sandbox` | `sandbox` |
//! | `LEDGER_RPC_URL` | EVM JSON-RPC endpoint | Required for `evm` |
//! | `LEDGER_CHAIN_ID` | Chain id recorded in chain refs | `1005` |
//! | `LEDGER_NETWORK` | Network name recorded in chain refs | `lemonchain` |
//! | `SIGNATURE_CHAIN_CONTRACT` | Signature-chain contract address | Required for `evm` |
//! | `LEDGER_SIGNER_KEY` | Operator private key (hex) | Required for `evm` |
//! | `LEDGER_TIMEOUT_SECS` | Bounded timeout per ledger call | `30` |
//! | `TOKEN_DECIMALS` | Decimals of the minted token | `6` |
//! | `FALLBACK_VAULT_ADDRESS` | Beneficiary substitute for invalid addresses | [`DEFAULT_FALLBACK_VAULT`] |
//! | `MINTED_BY` | Operator identity recorded on confirmations | `settlement-engine` |
//! | `BANK_WEBHOOK_URL` | Upstream bank notification endpoint | Disabled |
//! | `CLOUD_SYNC_URL` | Cloud sync fan-out endpoint | Disabled |
//! | `WEBHOOK_SECRET` | HMAC-SHA256 key for webhook signatures | Unsigned |
//! | `LOCK_FEED_URL` | Upstream lock poll endpoint | Disabled |
//! | `SYNC_POLL_INTERVAL_SECS` | Poll sweep interval | `30` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const LEDGER_MODE_ENV: &str = "LEDGER_MODE";
pub const LEDGER_RPC_URL_ENV: &str = "LEDGER_RPC_URL";
pub const LEDGER_CHAIN_ID_ENV: &str = "LEDGER_CHAIN_ID";
pub const LEDGER_NETWORK_ENV: &str = "LEDGER_NETWORK";
pub const SIGNATURE_CHAIN_CONTRACT_ENV: &str = "SIGNATURE_CHAIN_CONTRACT";
pub const LEDGER_SIGNER_KEY_ENV: &str = "LEDGER_SIGNER_KEY";
pub const LEDGER_TIMEOUT_SECS_ENV: &str = "LEDGER_TIMEOUT_SECS";
pub const TOKEN_DECIMALS_ENV: &str = "TOKEN_DECIMALS";
pub const FALLBACK_VAULT_ADDRESS_ENV: &str = "FALLBACK_VAULT_ADDRESS";
pub const MINTED_BY_ENV: &str = "MINTED_BY";
pub const BANK_WEBHOOK_URL_ENV: &str = "BANK_WEBHOOK_URL";
pub const CLOUD_SYNC_URL_ENV: &str = "CLOUD_SYNC_URL";
pub const WEBHOOK_SECRET_ENV: &str = "WEBHOOK_SECRET";
pub const LOCK_FEED_URL_ENV: &str = "LOCK_FEED_URL";
pub const LOCK_STREAM_URL_ENV: &str = "LOCK_STREAM_URL";
pub const SYNC_POLL_INTERVAL_SECS_ENV: &str = "SYNC_POLL_INTERVAL_SECS";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_CHAIN_ID: u64 = 1005;
pub const DEFAULT_NETWORK: &str = "lemonchain";
pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MINTED_BY: &str = "settlement-engine";

/// Custody vault credited when a beneficiary address is unusable, so that
/// approved funds never get stuck in the queue.
pub const DEFAULT_FALLBACK_VAULT: &str = "0xe6f7AF72E87E58191Db058763aFB53292a72a25E";

/// File name of the embedded settlement database inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "settlement.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration missing: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Real EVM signature-chain contract.
    Evm,
    /// Deterministic in-process ledger (manual/sandbox operation).
    Sandbox,
}

impl FromStr for LedgerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evm" | "chain" => Ok(Self::Evm),
            "sandbox" | "manual" => Ok(Self::Sandbox),
            other => Err(format!("expected `evm` or `sandbox`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("expected `json` or `pretty`, got `{other}`")),
        }
    }
}

/// Connection settings for the EVM ledger client.
#[derive(Debug, Clone)]
pub struct EvmLedgerConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub signer_key_hex: String,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub data_dir: PathBuf,
    pub ledger_mode: LedgerMode,
    pub evm: Option<EvmLedgerConfig>,
    pub network: String,
    pub chain_id: u64,
    pub ledger_timeout: Duration,
    pub token_decimals: u8,
    pub fallback_vault_address: String,
    pub minted_by: String,
    pub bank_webhook_url: Option<String>,
    pub cloud_sync_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub lock_feed_url: Option<String>,
    /// `ws://` or `wss://` endpoint of the upstream broadcast.
    pub lock_stream_url: Option<String>,
    pub poll_interval: Duration,
    pub log_format: LogFormat,
}

impl SettlementConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let ledger_mode = parse_or(&get, LEDGER_MODE_ENV, LedgerMode::Sandbox)?;
        let evm = match ledger_mode {
            LedgerMode::Evm => Some(EvmLedgerConfig {
                rpc_url: get(LEDGER_RPC_URL_ENV).ok_or(ConfigError::Missing(LEDGER_RPC_URL_ENV))?,
                contract_address: get(SIGNATURE_CHAIN_CONTRACT_ENV)
                    .ok_or(ConfigError::Missing(SIGNATURE_CHAIN_CONTRACT_ENV))?,
                signer_key_hex: get(LEDGER_SIGNER_KEY_ENV)
                    .ok_or(ConfigError::Missing(LEDGER_SIGNER_KEY_ENV))?,
            }),
            LedgerMode::Sandbox => None,
        };

        Ok(Self {
            data_dir: PathBuf::from(get(DATA_DIR_ENV).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())),
            ledger_mode,
            evm,
            network: get(LEDGER_NETWORK_ENV).unwrap_or_else(|| DEFAULT_NETWORK.to_string()),
            chain_id: parse_or(&get, LEDGER_CHAIN_ID_ENV, DEFAULT_CHAIN_ID)?,
            ledger_timeout: Duration::from_secs(parse_or(
                &get,
                LEDGER_TIMEOUT_SECS_ENV,
                DEFAULT_LEDGER_TIMEOUT.as_secs(),
            )?),
            token_decimals: parse_or(&get, TOKEN_DECIMALS_ENV, DEFAULT_TOKEN_DECIMALS)?,
            fallback_vault_address: get(FALLBACK_VAULT_ADDRESS_ENV)
                .unwrap_or_else(|| DEFAULT_FALLBACK_VAULT.to_string()),
            minted_by: get(MINTED_BY_ENV).unwrap_or_else(|| DEFAULT_MINTED_BY.to_string()),
            bank_webhook_url: get(BANK_WEBHOOK_URL_ENV),
            cloud_sync_url: get(CLOUD_SYNC_URL_ENV),
            webhook_secret: get(WEBHOOK_SECRET_ENV),
            lock_feed_url: get(LOCK_FEED_URL_ENV),
            lock_stream_url: get(LOCK_STREAM_URL_ENV),
            poll_interval: Duration::from_secs(parse_or(
                &get,
                SYNC_POLL_INTERVAL_SECS_ENV,
                DEFAULT_POLL_INTERVAL.as_secs(),
            )?),
            log_format: parse_or(&get, LOG_FORMAT_ENV, LogFormat::Pretty)?,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = SettlementConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.ledger_mode, LedgerMode::Sandbox);
        assert!(config.evm.is_none());
        assert_eq!(config.chain_id, DEFAULT_CHAIN_ID);
        assert_eq!(config.ledger_timeout, DEFAULT_LEDGER_TIMEOUT);
        assert_eq!(config.fallback_vault_address, DEFAULT_FALLBACK_VAULT);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.database_path(), PathBuf::from("./data/settlement.redb"));
        assert!(config.bank_webhook_url.is_none());
        assert!(config.lock_stream_url.is_none());
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let config =
            SettlementConfig::from_lookup(lookup(&[(BANK_WEBHOOK_URL_ENV, "   ")])).unwrap();
        assert!(config.bank_webhook_url.is_none());
    }

    #[test]
    fn evm_mode_requires_connection_settings() {
        let err = SettlementConfig::from_lookup(lookup(&[(LEDGER_MODE_ENV, "evm")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(LEDGER_RPC_URL_ENV)));

        let config = SettlementConfig::from_lookup(lookup(&[
            (LEDGER_MODE_ENV, "evm"),
            (LEDGER_RPC_URL_ENV, "https://rpc.example.org"),
            (SIGNATURE_CHAIN_CONTRACT_ENV, "0x0000000000000000000000000000000000000001"),
            (LEDGER_SIGNER_KEY_ENV, "ab"),
        ]))
        .unwrap();
        assert_eq!(config.ledger_mode, LedgerMode::Evm);
        assert_eq!(config.evm.unwrap().rpc_url, "https://rpc.example.org");
    }

    #[test]
    fn invalid_numbers_are_reported_by_name() {
        let err = SettlementConfig::from_lookup(lookup(&[(LEDGER_TIMEOUT_SECS_ENV, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { name: LEDGER_TIMEOUT_SECS_ENV, .. }
        ));
    }
}
