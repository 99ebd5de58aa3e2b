// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! End-to-end lock-to-mint flows against the sandbox ledger.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

use custody_settlement::engine::{EngineSettings, SettlementEngine};
use custody_settlement::error::SettlementError;
use custody_settlement::ledger::SandboxLedger;
use custody_settlement::models::{
    LockStatus, MintMode, MintStatus, ReserveStatus, SignatureRole, Verification,
};
use custody_settlement::notify::{
    DeliveryError, Notification, NotificationEvent, NotificationRelay, NotificationSink,
};
use custody_settlement::storage::{LockStore, MemoryBackend, RedbBackend};
use custody_settlement::sync::{
    ChainDefaults, SyncIngestor, UpstreamEventKind, UpstreamLockEvent,
};

const BENEFICIARY: &str = "0x00000000000000000000000000000000000000a1";
const VAULT: &str = "0xe6f7AF72E87E58191Db058763aFB53292a72a25E";

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    fn count(&self, event: NotificationEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(notification.event);
        Ok(())
    }
}

struct Harness {
    store: Arc<LockStore>,
    ledger: Arc<SandboxLedger>,
    sink: Arc<RecordingSink>,
    engine: SettlementEngine,
    ingestor: SyncIngestor,
}

fn harness_with(store: Arc<LockStore>) -> Harness {
    let ledger = Arc::new(SandboxLedger::new("lemonchain", 1005));
    let sink = Arc::new(RecordingSink::default());
    let relay = Arc::new(NotificationRelay::new(store.clone(), vec![sink.clone()]));
    let engine = SettlementEngine::new(
        store.clone(),
        ledger.clone(),
        relay.clone(),
        EngineSettings {
            fallback_vault: VAULT.into(),
            minted_by: "integration".into(),
        },
    );
    let ingestor = SyncIngestor::new(
        store.clone(),
        relay,
        ChainDefaults {
            network: "lemonchain".into(),
            chain_id: 1005,
        },
    );
    Harness {
        store,
        ledger,
        sink,
        engine,
        ingestor,
    }
}

fn harness() -> Harness {
    harness_on_memory().0
}

fn harness_on_memory() -> (Harness, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(LockStore::open(backend.clone()).unwrap());
    (harness_with(store), backend)
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn lock_event(id: &str, amount: &str, beneficiary: &str) -> UpstreamLockEvent {
    UpstreamLockEvent::push(
        UpstreamEventKind::Insert,
        json!({
            "lock_id": id,
            "authorization_code": format!("AUTH-{id}"),
            "amount_usd": amount,
            "beneficiary": beneficiary,
            "bank_name": "Digital Commercial Bank",
            "first_signature": format!("0xfirst-{id}"),
            "status": "pending"
        }),
    )
}

async fn ingest(h: &Harness, id: &str, amount: &str) {
    let report = h
        .ingestor
        .process(vec![lock_event(id, amount, BENEFICIARY)])
        .await;
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn scenario_a_partial_approval_splits_lock() {
    let h = harness();
    ingest(&h, "L1", "10000").await;

    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();

    let lock = h.store.lock("L1").unwrap();
    assert_eq!(lock.status, LockStatus::Approved);
    assert_eq!(lock.approved_amount, Some(dec("4000")));

    assert_eq!(approval.queue_item.amount_usd, dec("4000"));
    assert_eq!(approval.queue_item.status, MintStatus::Pending);

    let reserve = h.store.reserve_for_lock("L1").unwrap();
    assert_eq!(reserve.remaining_amount, dec("6000"));
    assert_eq!(reserve.original_amount, dec("6000"));
    assert_eq!(reserve.consumed_amount + reserve.remaining_amount, reserve.original_amount);
    assert_eq!(reserve.status, ReserveStatus::Active);
    assert_ne!(reserve.authorization_code, lock.authorization_code);
    assert!(reserve.reserve_tx_hash.is_some());

    assert_eq!(h.sink.count(NotificationEvent::LockApproved), 1);
    assert_eq!(h.sink.count(NotificationEvent::LockReserveCreated), 1);
}

#[tokio::test]
async fn scenario_b_reserve_promoted_in_full() {
    let h = harness();
    ingest(&h, "L1", "10000").await;
    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();
    let reserve_id = approval.reserve.unwrap().id;

    let promotion = h.engine.promote_reserve_to_queue(&reserve_id).await.unwrap();
    assert_eq!(promotion.queue_item.amount_usd, dec("6000"));
    assert_eq!(promotion.queue_item.reserve_id.as_deref(), Some(reserve_id.as_str()));

    let reserve = h.store.reserve(&reserve_id).unwrap();
    assert_eq!(reserve.status, ReserveStatus::FullyConsumed);
    assert_eq!(reserve.remaining_amount, Decimal::ZERO);
    assert_eq!(reserve.consumed_amount, reserve.original_amount);

    let err = h
        .engine
        .promote_reserve_to_queue(&reserve_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::StateConflict { .. }));
    assert_eq!(h.store.queue_items_for_lock("L1").len(), 2);
}

#[tokio::test]
async fn scenario_c_mint_completes_with_one_confirmation() {
    let h = harness();
    ingest(&h, "L1", "10000").await;
    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();

    let workflow = h.engine.begin_mint(&approval.queue_item.id).unwrap();
    let confirmation = h.engine.execute_mint(workflow).await.unwrap();

    assert_eq!(confirmation.minted_amount, "4000");
    assert_eq!(confirmation.mode, MintMode::SignatureChain);
    assert!(!confirmation.used_fallback_beneficiary);
    assert!(confirmation.signatures.first.is_some());
    assert!(confirmation.signatures.second.is_some());
    assert_eq!(
        h.store.queue_item(&approval.queue_item.id).unwrap().status,
        MintStatus::Completed
    );
    assert_eq!(h.store.list_confirmations().len(), 1);
    assert_eq!(h.store.lock("L1").unwrap().status, LockStatus::Minted);
    assert_eq!(h.sink.count(NotificationEvent::LockMinted), 1);
}

#[tokio::test]
async fn scenario_d_over_approval_is_rejected() {
    let h = harness();
    ingest(&h, "L1", "10000").await;

    let err = h.engine.approve_lock("L1", dec("15000")).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));
    assert_eq!(h.store.lock("L1").unwrap().status, LockStatus::Pending);
    assert!(h.store.queue_items_for_lock("L1").is_empty());
    assert_eq!(h.ledger.submissions(), 0);
}

#[tokio::test]
async fn scenario_e_rejection_is_terminal() {
    let h = harness();
    ingest(&h, "L2", "2500").await;

    h.engine
        .reject_lock("L2", "invalid beneficiary", "opA")
        .await
        .unwrap();

    assert_eq!(h.store.lock("L2").unwrap().status, LockStatus::Rejected);
    let rejection = h.store.rejection("L2").unwrap();
    assert_eq!(rejection.reason, "invalid beneficiary");
    assert_eq!(rejection.rejected_by, "opA");
    assert_eq!(h.store.list_rejections().len(), 1);
    assert!(h.store.queue_items_for_lock("L2").is_empty());
    assert_eq!(h.ledger.submissions(), 0);
    assert_eq!(h.sink.count(NotificationEvent::LockRejected), 1);
}

#[tokio::test]
async fn second_approval_is_a_state_conflict() {
    let h = harness();
    ingest(&h, "L1", "10000").await;
    h.engine.approve_lock("L1", dec("4000")).await.unwrap();

    let err = h.engine.approve_lock("L1", dec("4000")).await.unwrap_err();
    assert!(matches!(err, SettlementError::StateConflict { .. }));
    assert_eq!(h.store.queue_items_for_lock("L1").len(), 1);
}

#[tokio::test]
async fn concurrent_approvals_yield_one_winner() {
    let h = harness();
    ingest(&h, "L1", "10000").await;

    let (a, b) = tokio::join!(
        h.engine.approve_lock("L1", dec("4000")),
        h.engine.approve_lock("L1", dec("5000")),
    );
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(SettlementError::StateConflict { .. })));
    assert_eq!(h.store.queue_items_for_lock("L1").len(), 1);
}

#[tokio::test]
async fn repeated_mint_returns_same_confirmation() {
    let h = harness();
    ingest(&h, "L1", "10000").await;
    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();

    let first = h
        .engine
        .execute_mint_by_id(&approval.queue_item.id)
        .await
        .unwrap();
    for _ in 0..3 {
        let again = h
            .engine
            .execute_mint_by_id(&approval.queue_item.id)
            .await
            .unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(h.store.list_confirmations().len(), 1);
    assert_eq!(h.sink.count(NotificationEvent::LockMinted), 1);
}

#[tokio::test]
async fn duplicate_ingest_yields_one_lock() {
    let h = harness();
    let event = lock_event("L1", "10000", BENEFICIARY);
    h.ingestor.process(vec![event.clone()]).await;
    h.ingestor.process(vec![event]).await;

    assert_eq!(h.store.list_locks_by_status(LockStatus::Pending).len(), 1);
    assert_eq!(h.sink.count(NotificationEvent::NewLock), 1);
}

#[tokio::test]
async fn offline_ledger_approves_unverified() {
    let h = harness();
    ingest(&h, "L1", "10000").await;
    h.ledger.set_offline(true);

    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();
    assert_eq!(approval.verification, Verification::Unverified);
    assert_eq!(approval.lock.status, LockStatus::Approved);
    assert!(approval.lock.chain_refs.is_none());

    assert_eq!(h.store.list_unverified_locks().len(), 1);
    assert_eq!(h.store.list_unverified_queue_items().len(), 1);
    assert_eq!(h.store.list_unverified_reserves().len(), 1);

    // minting does not fall back
    let err = h
        .engine
        .execute_mint_by_id(&approval.queue_item.id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Mint { .. }));

    h.ledger.set_offline(false);
    let confirmation = h
        .engine
        .execute_mint_by_id(&approval.queue_item.id)
        .await
        .unwrap();
    assert_eq!(confirmation.verification, Verification::Unverified);
    assert_eq!(h.store.list_unverified_confirmations().len(), 1);
}

#[tokio::test]
async fn invalid_beneficiary_mints_to_fallback_vault() {
    let h = harness();
    h.ingestor
        .process(vec![lock_event("L3", "700", "IBAN-DE0012")])
        .await;
    let approval = h.engine.approve_lock("L3", dec("700")).await.unwrap();

    let confirmation = h
        .engine
        .execute_mint_by_id(&approval.queue_item.id)
        .await
        .unwrap();
    assert!(confirmation.used_fallback_beneficiary);
    assert_eq!(confirmation.beneficiary, VAULT);
    assert_eq!(
        h.store.queue_item(&approval.queue_item.id).unwrap().status,
        MintStatus::Completed
    );
}

#[tokio::test]
async fn settlement_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settlement.redb");
    let queue_item_id;
    {
        let store = Arc::new(LockStore::open(Arc::new(RedbBackend::open(&path).unwrap())).unwrap());
        let h = harness_with(store);
        ingest(&h, "L1", "10000").await;
        let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();
        queue_item_id = approval.queue_item.id;
    }

    let store = Arc::new(LockStore::open(Arc::new(RedbBackend::open(&path).unwrap())).unwrap());
    let h = harness_with(store);
    assert_eq!(h.store.lock("L1").unwrap().status, LockStatus::Approved);
    assert_eq!(h.store.reserve_for_lock("L1").unwrap().remaining_amount, dec("6000"));

    // replayed upstream insert after restart does not duplicate the lock
    let report = h
        .ingestor
        .process(vec![lock_event("L1", "10000", BENEFICIARY)])
        .await;
    assert_eq!(report.created, 0);

    let confirmation = h.engine.execute_mint_by_id(&queue_item_id).await.unwrap();
    assert_eq!(confirmation.minted_amount, "4000");
}

#[tokio::test]
async fn upstream_merge_during_approval_is_kept() {
    let h = harness();
    let report = h
        .ingestor
        .process(vec![UpstreamLockEvent::push(
            UpstreamEventKind::Insert,
            json!({
                "lock_id": "L1",
                "authorization_code": "AUTH-L1",
                "amount_usd": "10000",
                "beneficiary": BENEFICIARY,
                "bank_name": "Digital Commercial Bank",
                "status": "pending"
            }),
        )])
        .await;
    assert_eq!(report.created, 1);

    const UPDATED: &str = "0x00000000000000000000000000000000000000b2";
    h.ledger.set_latency(Duration::from_millis(100));
    let (approval, merge) = tokio::join!(
        h.engine.approve_lock("L1", dec("4000")),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.ingestor
                .process(vec![UpstreamLockEvent::push(
                    UpstreamEventKind::Update,
                    json!({
                        "lock_id": "L1",
                        "beneficiary": UPDATED,
                        "first_signature": "0xbankcert"
                    }),
                )])
                .await
        }
    );
    assert_eq!(merge.merged, 1);
    let approval = approval.unwrap();

    let lock = h.store.lock("L1").unwrap();
    assert_eq!(lock.status, LockStatus::Approved);
    assert_eq!(lock.beneficiary, UPDATED);
    assert_eq!(
        lock.signature(SignatureRole::CustodyCertification).unwrap().hash,
        "0xbankcert"
    );
    assert!(lock.signature(SignatureRole::Approval).is_some());

    assert_eq!(approval.queue_item.beneficiary, UPDATED);
    assert_eq!(
        approval.queue_item.signature_chain.first_signature.unwrap().hash,
        "0xbankcert"
    );
    assert_eq!(approval.reserve.unwrap().beneficiary, UPDATED);
}

#[tokio::test]
async fn storage_failure_during_approval_changes_nothing() {
    let (h, backend) = harness_on_memory();
    ingest(&h, "L1", "10000").await;

    h.ledger.set_latency(Duration::from_millis(50));
    let (result, _) = tokio::join!(h.engine.approve_lock("L1", dec("4000")), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.set_fail_writes(true);
    });
    assert!(matches!(result, Err(SettlementError::Storage(_))));

    assert_eq!(h.store.lock("L1").unwrap().status, LockStatus::Pending);
    assert!(h.store.queue_items_for_lock("L1").is_empty());
    assert!(h.store.reserve_for_lock("L1").is_none());
    assert_eq!(h.sink.count(NotificationEvent::LockApproved), 0);
    assert_eq!(h.sink.count(NotificationEvent::LockReserveCreated), 0);

    // the lock is not left claimed
    backend.set_fail_writes(false);
    h.ledger.set_latency(Duration::ZERO);
    h.engine.approve_lock("L1", dec("4000")).await.unwrap();
    assert_eq!(h.store.queue_items_for_lock("L1").len(), 1);
}

#[tokio::test]
async fn storage_failure_after_mint_resumes_without_resending() {
    let (h, backend) = harness_on_memory();
    ingest(&h, "L1", "10000").await;
    let approval = h.engine.approve_lock("L1", dec("4000")).await.unwrap();
    let item_id = approval.queue_item.id;

    h.ledger.set_latency(Duration::from_millis(50));
    let (result, _) = tokio::join!(h.engine.execute_mint_by_id(&item_id), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.set_fail_writes(true);
    });
    assert!(matches!(result, Err(SettlementError::Storage(_))));
    let submissions = h.ledger.submissions();

    assert_eq!(h.store.queue_item(&item_id).unwrap().status, MintStatus::Minting);
    assert!(h.store.list_confirmations().is_empty());
    assert_eq!(h.store.lock("L1").unwrap().status, LockStatus::Approved);
    assert_eq!(h.sink.count(NotificationEvent::LockMinted), 0);

    backend.set_fail_writes(false);
    h.ledger.set_latency(Duration::ZERO);
    let confirmation = h.engine.execute_mint_by_id(&item_id).await.unwrap();
    assert_eq!(confirmation.minted_amount, "4000");
    assert_eq!(h.ledger.submissions(), submissions);
    assert_eq!(h.sink.count(NotificationEvent::LockMinted), 1);
}

#[tokio::test]
async fn expired_lock_is_refused() {
    let h = harness();
    h.ingestor
        .process(vec![UpstreamLockEvent::push(
            UpstreamEventKind::Insert,
            json!({
                "lock_id": "L9",
                "amount_usd": "100",
                "beneficiary": BENEFICIARY,
                "expiry": "2020-01-01T00:00:00Z"
            }),
        )])
        .await;
    let err = h.engine.approve_lock("L9", dec("100")).await.unwrap_err();
    assert!(matches!(err, SettlementError::Validation(_)));
    assert_eq!(h.store.lock("L9").unwrap().status, LockStatus::Pending);
}
