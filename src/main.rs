// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::time::Duration;

use custody_settlement::config::{LogFormat, SettlementConfig};
use custody_settlement::state::SettlementState;
use custody_settlement::sync::SyncRunner;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Interval between outbox redelivery sweeps.
const OUTBOX_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    let config = match SettlementConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("custody-settlement: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);

    let state = match SettlementState::build(&config) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    let (runner, push) = SyncRunner::new(
        state.ingestor.clone(),
        state.feed.clone(),
        config.poll_interval,
    );
    let sync_task = tokio::spawn(runner.run(shutdown.clone()));
    let subscription_task = state
        .subscription
        .clone()
        .map(|subscription| tokio::spawn(subscription.run(push, shutdown.clone())));

    let relay = state.relay.clone();
    let outbox_shutdown = shutdown.clone();
    let outbox_task = tokio::spawn(async move {
        loop {
            let delivered = relay.flush_outbox().await;
            if delivered > 0 {
                info!(delivered, "Outbox notifications redelivered");
            }
            tokio::select! {
                _ = tokio::time::sleep(OUTBOX_FLUSH_INTERVAL) => {},
                _ = outbox_shutdown.cancelled() => return,
            }
        }
    });

    info!(
        data_dir = %config.data_dir.display(),
        "Custody settlement running; press Ctrl-C to stop"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    shutdown.cancel();
    let _ = tokio::join!(sync_task, outbox_task);
    if let Some(task) = subscription_task {
        let _ = task.await;
    }

    let stats = state.store.stats();
    info!(
        confirmations = stats.confirmations,
        outbox = stats.outbox,
        unverified = stats.unverified,
        "Stopped"
    );
    ExitCode::SUCCESS
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
