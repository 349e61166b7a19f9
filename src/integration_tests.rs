//! End-to-end flows over the fully wired core
//!
//! Every test builds [`LedgerCore`] on `MemoryStore` + `MemoryCoordStore`
//! and a scripted `MockMarketplace`, then drives it the way the gateway and
//! the background workers do.

use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::account::{AccountKind, AuditStatus, JournalEntry, TxType};
use crate::config::AppConfig;
use crate::coord::MemoryCoordStore;
use crate::core_types::{PLATFORM_PRINCIPAL_ID, PrincipalId, Role, ShopId};
use crate::deps::{Deps, LedgerCore, Workers};
use crate::error::LedgerError;
use crate::funding::WithdrawStatus;
use crate::models::{Principal, SettlementStatus, ShipmentStatus, TokenPair};
use crate::settlement::SettleOutcome;
use crate::store::{AccountStore, CommerceStore, MemoryStore, SyncStore};
use crate::sync::{SyncOutcome, SyncStatus, SyncType};
use crate::upstream::{EscrowDetail, MockMarketplace, OrderPage, UpstreamOrder};
use crate::webhook::WebhookIngress;

const SHOP: ShopId = 42;

const TEST_CONFIG: &str = r#"
log_level: debug
log_dir: ./logs
log_file: test.log
use_json: false
gateway:
  host: 127.0.0.1
  port: 0
  jwt_secret: test-secret
  web_ui_url: http://ui.test/shops
sync:
  max_retries: 1
  orders_interval_secs: 3600
  income_interval_secs: 3600
  escrow_interval_secs: 1
settlement:
  interval_secs: 1
  batch_size: 50
"#;

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    api: Arc<MockMarketplace>,
    core: Arc<LedgerCore>,
    ingress: WebhookIngress,
    workers: Option<Workers>,
    platform: Principal,
    owner: Principal,
    operator: Principal,
}

/// Core with one bound shop served by one operator
async fn harness() -> Harness {
    let config = AppConfig::from_yaml(TEST_CONFIG).unwrap();
    let store = Arc::new(MemoryStore::new());
    let api = Arc::new(MockMarketplace::new());
    let deps = Deps {
        store: store.clone(),
        coord: Arc::new(MemoryCoordStore::new()),
        api: api.clone(),
    };
    let (core, ingress, workers) = LedgerCore::build(deps, &config).unwrap();

    let platform = core.directory.create(Role::Platform, "auditor").await.unwrap();
    let owner = core.directory.create(Role::ShopOwner, "owner").await.unwrap();
    let operator = core.directory.create(Role::Operator, "operator").await.unwrap();
    let tokens = TokenPair {
        access_token: "at".into(),
        refresh_token: "rt".into(),
        expire_at: Utc::now() + chrono::Duration::hours(4),
    };
    core.shops.bind(SHOP, owner.id, tokens, "SG").await.unwrap();
    core.cooperation.assign_operator(SHOP, operator.id).await.unwrap();

    Harness {
        store,
        api,
        core,
        ingress,
        workers: Some(workers),
        platform,
        owner,
        operator,
    }
}

impl Harness {
    async fn balance(&self, kind: AccountKind, pid: PrincipalId) -> (Decimal, Decimal) {
        self.store
            .get_account(kind, pid)
            .await
            .unwrap()
            .map(|a| (a.balance, a.frozen))
            .unwrap_or_default()
    }

    /// Recharge through the audited workflow
    async fn fund(&self, kind: AccountKind, amount: &str) {
        let app = self
            .core
            .recharges
            .submit(self.owner.id, kind, d(amount), "bank slip 001")
            .await
            .unwrap();
        self.core.recharges.approve(app.id, self.platform.id, None).await.unwrap();
    }

    async fn sync_completed_order(&self, sn: &str, gross: &str) {
        self.api.push_order_page(Ok(OrderPage {
            orders: vec![UpstreamOrder {
                order_sn: sn.into(),
                order_status: "COMPLETED".into(),
                total_amount: d(gross),
                currency: "SGD".into(),
                update_time: 100,
            }],
            more: false,
            next_cursor: None,
        }));
        self.api.set_escrow(EscrowDetail {
            order_sn: sn.into(),
            seller_receive_amount: d(gross),
            commission_fee: Decimal::ZERO,
            service_fee: Decimal::ZERO,
            raw: serde_json::json!({ "order_sn": sn }),
        });
        let cancel = CancellationToken::new();
        let outcome = self.core.sync.run_pass(SHOP, SyncType::OrdersFull, &cancel).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Completed { synced: 1 });
    }

    async fn fetch_escrow(&self, sn: &str) {
        let cancel = CancellationToken::new();
        let outcome = self.core.sync.sync_escrow_for_order(SHOP, sn, &cancel).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Completed { synced: 1 });
    }

    async fn ship(&self, sn: &str, cost: &str, self_funded: bool) {
        self.core
            .shipments
            .record(SHOP, sn, Some(self.operator.id), d(cost), Decimal::ZERO, "TN-1", self_funded)
            .await
            .unwrap();
    }
}

/// Chain and balance checks over every account this harness touches
async fn assert_journal_consistent(h: &Harness, accounts: &[(AccountKind, PrincipalId)]) {
    for &(kind, pid) in accounts {
        let journal: Vec<JournalEntry> = h.store.journal_of(kind, pid);
        let mut frozen = Decimal::ZERO;
        for pair in journal.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before, "chain broken for {}:{}", kind, pid);
        }
        for e in &journal {
            assert_eq!(e.balance_before + e.amount, e.balance_after);
            frozen += e.frozen_delta;
            assert!(frozen <= e.balance_after, "frozen exceeds balance for {}:{}", kind, pid);
        }
        if let Some(last) = journal.last() {
            let account = h.store.get_account(kind, pid).await.unwrap().unwrap();
            assert_eq!(account.balance, last.balance_after);
            assert_eq!(account.frozen, frozen);
        }
    }
}

#[tokio::test]
async fn test_overdraw_rejected_and_balance_unchanged() {
    let h = harness().await;
    let pid = h.owner.id;
    h.core
        .poster
        .post(AccountKind::Prepayment, pid, TxType::Recharge, d("50.00"), "seed", AuditStatus::Approved)
        .await
        .unwrap();

    let err = h
        .core
        .poster
        .post(AccountKind::Prepayment, pid, TxType::Withdraw, d("-60.00"), "overdraw", AuditStatus::Paid)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance));

    assert_eq!(h.balance(AccountKind::Prepayment, pid).await.0, d("50"));
    assert_eq!(h.store.journal_of(AccountKind::Prepayment, pid).len(), 1);
}

#[tokio::test]
async fn test_profitable_order_settles_through_sync() {
    let h = harness().await;
    h.fund(AccountKind::Prepayment, "100").await;
    h.sync_completed_order("ORD-1", "100.00").await;
    h.ship("ORD-1", "30.00", false).await;
    h.fetch_escrow("ORD-1").await;

    let before = h.store.journal_len();
    let outcome = h.core.settlement.settle(SHOP, "ORD-1").await.unwrap();
    let SettleOutcome::Completed(s) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(s.net, d("70.0000"));
    assert_eq!(s.platform_share, d("3.5000"));
    assert_eq!(s.operator_share, d("31.5000"));
    assert_eq!(s.shop_owner_share, d("35.0000"));
    assert_eq!(s.platform_share + s.operator_share + s.shop_owner_share, s.net);
    assert_eq!(h.store.journal_len() - before, 4);

    assert_eq!(h.balance(AccountKind::Operator, h.operator.id).await.0, d("31.5"));
    assert_eq!(h.balance(AccountKind::ShopOwnerCommission, h.owner.id).await.0, d("35"));
    assert_eq!(h.balance(AccountKind::PlatformCommission, PLATFORM_PRINCIPAL_ID).await.0, d("3.5"));
    assert_eq!(h.balance(AccountKind::Prepayment, h.owner.id).await.0, d("70"));

    let shipment = h.core.shipments.get(SHOP, "ORD-1").await.unwrap();
    assert_eq!(shipment.status, ShipmentStatus::Settled);

    assert_journal_consistent(
        &h,
        &[
            (AccountKind::Operator, h.operator.id),
            (AccountKind::ShopOwnerCommission, h.owner.id),
            (AccountKind::PlatformCommission, PLATFORM_PRINCIPAL_ID),
            (AccountKind::Prepayment, h.owner.id),
        ],
    )
    .await;
}

#[tokio::test]
async fn test_loss_lands_on_platform_only() {
    let h = harness().await;
    h.fund(AccountKind::Prepayment, "100").await;
    h.sync_completed_order("ORD-L", "20.00").await;
    h.ship("ORD-L", "30.00", false).await;
    h.fetch_escrow("ORD-L").await;

    let SettleOutcome::Completed(s) = h.core.settlement.settle(SHOP, "ORD-L").await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(s.net, d("-10.0000"));
    assert_eq!(s.platform_share, d("-10.0000"));
    assert!(s.operator_share.is_zero() && s.shop_owner_share.is_zero());

    let platform = h.store.journal_of(AccountKind::PlatformCommission, PLATFORM_PRINCIPAL_ID);
    assert_eq!(platform.len(), 1);
    assert_eq!(platform[0].amount, d("-10"));
    assert!(h.store.journal_of(AccountKind::Operator, h.operator.id).is_empty());
    assert!(h.store.journal_of(AccountKind::ShopOwnerCommission, h.owner.id).is_empty());

    // goods cost still leaves the owner's prepayment
    let prepayment = h.store.journal_of(AccountKind::Prepayment, h.owner.id);
    let debit = prepayment.last().unwrap();
    assert_eq!(debit.tx_type, TxType::SettleOut);
    assert_eq!(debit.amount, d("-30"));
    assert_eq!(h.balance(AccountKind::Prepayment, h.owner.id).await.0, d("70"));
}

#[tokio::test]
async fn test_concurrent_settles_complete_once() {
    let h = harness().await;
    h.fund(AccountKind::Prepayment, "100").await;
    h.sync_completed_order("ORD-C", "100.00").await;
    h.ship("ORD-C", "30.00", false).await;
    h.fetch_escrow("ORD-C").await;

    let a = h.core.settlement.clone();
    let b = h.core.settlement.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.settle(SHOP, "ORD-C").await }),
        tokio::spawn(async move { b.settle(SHOP, "ORD-C").await }),
    );
    let outcomes = [ra.unwrap().unwrap(), rb.unwrap().unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SettleOutcome::Completed(_)))
        .count();
    assert_eq!(completed, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        SettleOutcome::Completed(_) | SettleOutcome::AlreadySettling | SettleOutcome::AlreadyCompleted
    )));

    let row = h.store.get_settlement(SHOP, "ORD-C").await.unwrap().unwrap();
    assert_eq!(row.status, SettlementStatus::Completed);
    assert_eq!(h.balance(AccountKind::Operator, h.operator.id).await.0, d("31.5"));
}

#[tokio::test]
async fn test_ten_failures_pause_the_shop() {
    let h = harness().await;
    h.api
        .set_orders_failure(Some(LedgerError::UpstreamTransient("error_busy".into())));
    let cancel = CancellationToken::new();
    for _ in 0..10 {
        assert!(h.core.sync.run_pass(SHOP, SyncType::OrdersFull, &cancel).await.is_err());
    }

    let record = h.store.get_sync_record(SHOP, SyncType::OrdersFull).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Paused);
    assert_eq!(record.consecutive_fail_count, 10);
    assert!(record.last_error.is_some());

    let calls = h.api.list_orders_calls();
    let outcome = h.core.sync.run_pass(SHOP, SyncType::OrdersFull, &cancel).await.unwrap();
    assert_eq!(outcome, SyncOutcome::NotEnabled);
    assert_eq!(h.api.list_orders_calls(), calls);

    // other kinds keep running
    let income = h.store.get_sync_record(SHOP, SyncType::FinanceIncome).await.unwrap().unwrap();
    assert_eq!(income.status, SyncStatus::Enabled);

    h.api.set_orders_failure(None);
    h.core.sync.reset(SHOP, SyncType::OrdersFull).await.unwrap();
    let outcome = h.core.sync.run_pass(SHOP, SyncType::OrdersFull, &cancel).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { synced: 0 });
}

#[tokio::test]
async fn test_withdraw_paid_leaves_freeze_then_withdraw() {
    let h = harness().await;
    h.fund(AccountKind::Prepayment, "100.00").await;
    let card = h
        .core
        .directory
        .add_collection_account(h.owner.id, "bank", "6222 0000", "Owner")
        .await
        .unwrap();

    let app = h
        .core
        .withdraws
        .submit(h.owner.id, AccountKind::Prepayment, d("50.00"), card.id, "month end")
        .await
        .unwrap();
    assert_eq!(h.balance(AccountKind::Prepayment, h.owner.id).await, (d("100"), d("50")));

    h.core.withdraws.approve(app.id, h.platform.id, Some("ok")).await.unwrap();
    let paid = h.core.withdraws.confirm_paid(app.id, h.platform.id).await.unwrap();
    assert_eq!(paid.status, WithdrawStatus::Paid);
    assert_eq!(h.balance(AccountKind::Prepayment, h.owner.id).await, (d("50"), d("0")));

    let journal = h.store.journal_of(AccountKind::Prepayment, h.owner.id);
    let types: Vec<TxType> = journal.iter().map(|e| e.tx_type).collect();
    assert_eq!(types, vec![TxType::Recharge, TxType::Freeze, TxType::Withdraw]);
    assert_eq!(journal[1].tx_no, paid.freeze_tx_no);
    assert_eq!(Some(&journal[2].tx_no), paid.settle_tx_no.as_ref());

    // double audit after payment is refused
    let err = h.core.withdraws.reject(app.id, h.platform.id, None).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyAudited(_)));

    assert_journal_consistent(&h, &[(AccountKind::Prepayment, h.owner.id)]).await;
}

#[tokio::test]
async fn test_cancel_after_settlement_flags_instead_of_reversing() {
    let mut h = harness().await;
    h.fund(AccountKind::Prepayment, "100").await;
    h.sync_completed_order("ORD-X", "100.00").await;
    h.ship("ORD-X", "30.00", false).await;
    h.fetch_escrow("ORD-X").await;
    h.core.settlement.settle(SHOP, "ORD-X").await.unwrap();
    let journal = h.store.journal_len();

    let cancel = CancellationToken::new();
    let handles = h.workers.take().unwrap().spawn(&cancel);

    let body = serde_json::json!({
        "code": 5,
        "shop_id": SHOP,
        "timestamp": 1_700_000_000,
        "data": { "ordersn": "ORD-X", "cancel_reason": "buyer" }
    });
    let ack = h.ingress.accept(body.to_string().as_bytes(), None).unwrap();
    assert_eq!(ack.code, 0);

    let mut flagged = false;
    for _ in 0..100 {
        let row = h.store.get_settlement(SHOP, "ORD-X").await.unwrap().unwrap();
        if row.needs_adjustment {
            flagged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(flagged);
    assert_eq!(h.store.journal_len(), journal);
    let row = h.store.get_settlement(SHOP, "ORD-X").await.unwrap().unwrap();
    assert_eq!(row.status, SettlementStatus::Completed);
}

#[tokio::test]
async fn test_workers_settle_after_completion_webhook() {
    let mut h = harness().await;
    h.fund(AccountKind::Prepayment, "100").await;
    // order known but not yet completed
    h.api.push_order_page(Ok(OrderPage {
        orders: vec![UpstreamOrder {
            order_sn: "ORD-W".into(),
            order_status: "SHIPPED".into(),
            total_amount: d("100"),
            currency: "SGD".into(),
            update_time: 100,
        }],
        more: false,
        next_cursor: None,
    }));
    let cancel = CancellationToken::new();
    h.core.sync.run_pass(SHOP, SyncType::OrdersFull, &cancel).await.unwrap();
    h.ship("ORD-W", "30.00", false).await;
    h.api.set_escrow(EscrowDetail {
        order_sn: "ORD-W".into(),
        seller_receive_amount: d("100"),
        commission_fee: Decimal::ZERO,
        service_fee: Decimal::ZERO,
        raw: serde_json::json!({}),
    });

    let handles = h.workers.take().unwrap().spawn(&cancel);

    let body = serde_json::json!({
        "code": 3,
        "shop_id": SHOP,
        "timestamp": 1_700_000_001,
        "data": { "ordersn": "ORD-W", "status": "COMPLETED", "update_time": 200 }
    });
    h.ingress.accept(body.to_string().as_bytes(), None).unwrap();

    let mut settled = None;
    for _ in 0..300 {
        if let Some(row) = h.store.get_settlement(SHOP, "ORD-W").await.unwrap()
            && row.is_completed()
        {
            settled = Some(row);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    let row = settled.expect("settlement should complete");
    assert_eq!(row.operator_share, d("31.5"));
    let order = h.store.get_order(SHOP, "ORD-W").await.unwrap().unwrap();
    assert_eq!(order.status, "COMPLETED");
}
