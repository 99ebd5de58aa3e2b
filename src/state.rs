// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Component wiring owned by the host.
//!
//! One [`LockStore`] is rehydrated first and then shared by the engine, the
//! ingestor and the relay.

use std::sync::Arc;

use crate::config::{LedgerMode, SettlementConfig};
use crate::engine::{EngineSettings, SettlementEngine};
use crate::ledger::{
    EvmLedgerClient, GuardedLedger, LedgerError, SandboxLedger, SignatureChainClient,
};
use crate::notify::{DeliveryError, NotificationRelay, NotificationSink, WebhookSink};
use crate::storage::{LockStore, RedbBackend, StorageError};
use crate::sync::runner::FeedError;
use crate::sync::{ChainDefaults, HttpLockFeed, LockFeed, LockSubscription, SyncIngestor};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to open settlement store: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to build ledger client: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to build notification sink: {0}")]
    Sink(#[from] DeliveryError),

    #[error("failed to build lock feed: {0}")]
    Feed(#[from] FeedError),
}

#[derive(Clone)]
pub struct SettlementState {
    pub store: Arc<LockStore>,
    pub ledger: Arc<dyn SignatureChainClient>,
    pub relay: Arc<NotificationRelay>,
    pub engine: Arc<SettlementEngine>,
    pub ingestor: Arc<SyncIngestor>,
    pub feed: Option<Arc<dyn LockFeed>>,
    pub subscription: Option<LockSubscription>,
}

impl SettlementState {
    pub fn build(config: &SettlementConfig) -> Result<Self, StartupError> {
        let backend = Arc::new(RedbBackend::open(&config.database_path())?);
        let store = Arc::new(LockStore::open(backend)?);

        let inner: Arc<dyn SignatureChainClient> = match (&config.ledger_mode, &config.evm) {
            (LedgerMode::Evm, Some(evm)) => Arc::new(EvmLedgerClient::new(
                evm,
                config.network.clone(),
                config.chain_id,
                config.token_decimals,
            )?),
            (LedgerMode::Evm, None) => {
                return Err(LedgerError::Configuration(
                    "evm ledger mode without connection settings".to_string(),
                )
                .into());
            }
            (LedgerMode::Sandbox, _) => {
                tracing::warn!("Running against the sandbox ledger; nothing is anchored on chain");
                Arc::new(SandboxLedger::new(config.network.clone(), config.chain_id))
            }
        };
        let ledger: Arc<dyn SignatureChainClient> =
            Arc::new(GuardedLedger::new(inner, config.ledger_timeout));

        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
        if let Some(url) = &config.bank_webhook_url {
            sinks.push(Arc::new(WebhookSink::new(
                "bank",
                url,
                config.webhook_secret.clone(),
            )?));
        }
        if let Some(url) = &config.cloud_sync_url {
            sinks.push(Arc::new(WebhookSink::new(
                "cloud_sync",
                url,
                config.webhook_secret.clone(),
            )?));
        }
        let relay = Arc::new(NotificationRelay::new(store.clone(), sinks));

        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            ledger.clone(),
            relay.clone(),
            EngineSettings::from_config(config),
        ));
        let ingestor = Arc::new(SyncIngestor::new(
            store.clone(),
            relay.clone(),
            ChainDefaults {
                network: config.network.clone(),
                chain_id: config.chain_id,
            },
        ));

        let feed = match &config.lock_feed_url {
            Some(url) => Some(Arc::new(HttpLockFeed::new(url)?) as Arc<dyn LockFeed>),
            None => None,
        };
        let subscription = config
            .lock_stream_url
            .as_deref()
            .map(LockSubscription::new)
            .transpose()?;

        tracing::info!(
            ledger_mode = ?config.ledger_mode,
            network = %config.network,
            chain_id = config.chain_id,
            sinks = ?relay.sink_names(),
            poll = feed.is_some(),
            push = subscription.is_some(),
            "Settlement state ready"
        );

        Ok(Self {
            store,
            ledger,
            relay,
            engine,
            ingestor,
            feed,
            subscription,
        })
    }
}
