//! Settlement Engine
//!
//! Turns a completed, shipped order with a known escrow into journal entries.
//! One settlement per `(shop_id, order_sn)`, serialized by the
//! `settlement:{shop_id}:{order_sn}` lease. All legs, the settlement row and
//! the shipment transition are committed by the store in one transaction, so
//! either every leg is visible or none is.
//!
//! Legs (zero amounts are skipped):
//!
//! | suffix | account                        | type       | amount          |
//! |--------|--------------------------------|------------|-----------------|
//! | `OP`   | operator                       | settle_in  | operator share  |
//! | `SO`   | shop owner commission          | settle_in  | owner share     |
//! | `PF`   | platform commission            | settle_in  | platform share  |
//! | `PP`   | shop owner prepayment          | settle_out | -cost           |
//!
//! The prepayment leg is omitted when the operator funded the goods.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::split::{Split, compute_split};
use crate::account::poster::{ACCOUNT_LOCK_TTL, ACCOUNT_LOCK_WAIT};
use crate::account::{
    AccountKind, AccountRegistry, AuditStatus, Posting, TxType, account_lock_name, plan_posting,
};
use crate::core_types::{PLATFORM_PRINCIPAL_ID, PrincipalId, ShopId};
use crate::error::{LedgerError, LedgerResult};
use crate::lock::{Lease, LockManager};
use crate::models::{Settlement, SettlementStatus, ShareRates, ShipmentRecord, ShipmentStatus};
use crate::shard::SHARD_COUNT;
use crate::store::Store;

pub const SETTLEMENT_LOCK_TTL: Duration = Duration::from_secs(60);

pub fn settlement_lock_name(shop_id: ShopId, order_sn: &str) -> String {
    format!("settlement:{}:{}", shop_id, order_sn)
}

/// Deterministic per-leg tx_no; a replay collides instead of double-posting
pub fn settlement_tx_no(shop_id: ShopId, order_sn: &str, leg: &str) -> String {
    format!("SE{}{}{}", shop_id, order_sn, leg)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Completed(Settlement),
    AlreadyCompleted,
    AlreadySettling,
    /// Inputs missing or not yet in the right state; retried later
    Pending(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingReport {
    pub scanned: usize,
    pub completed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Leg {
    kind: AccountKind,
    principal_id: PrincipalId,
    tx_type: TxType,
    amount: Decimal,
    suffix: &'static str,
}

/// Where the next pending sweep resumes: the shard it stopped in and the
/// last shipment id seen per shard
#[derive(Debug, Default)]
struct SweepCursor {
    shard: usize,
    after_id: [i64; SHARD_COUNT],
}

#[derive(Clone)]
pub struct SettlementEngine {
    store: Arc<dyn Store>,
    registry: AccountRegistry,
    locks: LockManager,
    default_rates: ShareRates,
    sweep: Arc<Mutex<SweepCursor>>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: AccountRegistry,
        locks: LockManager,
        default_rates: ShareRates,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            default_rates,
            sweep: Arc::new(Mutex::new(SweepCursor::default())),
        }
    }

    fn sweep_cursor(&self) -> MutexGuard<'_, SweepCursor> {
        self.sweep.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Settle one order. Safe to call repeatedly and concurrently.
    pub async fn settle(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<SettleOutcome> {
        let lock = settlement_lock_name(shop_id, order_sn);
        let Some(lease) = self.locks.try_acquire(&lock, SETTLEMENT_LOCK_TTL).await? else {
            return Ok(SettleOutcome::AlreadySettling);
        };

        let result = self.settle_locked(&lease, shop_id, order_sn).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(lock = %lock, error = %e, "Failed to release settlement lease");
        }
        result
    }

    async fn settle_locked(
        &self,
        lease: &Lease,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<SettleOutcome> {
        let existing = self.store.get_settlement(shop_id, order_sn).await?;
        if existing.as_ref().is_some_and(|s| s.is_completed()) {
            return Ok(SettleOutcome::AlreadyCompleted);
        }

        let Some(order) = self.store.get_order(shop_id, order_sn).await? else {
            return self.mark_pending(existing, shop_id, order_sn, "order not synced").await;
        };
        let Some(shipment) = self.store.get_shipment(shop_id, order_sn).await? else {
            return self.mark_pending(existing, shop_id, order_sn, "no shipment recorded").await;
        };
        let Some(escrow) = self.store.get_escrow(shop_id, order_sn).await? else {
            return self.mark_pending(existing, shop_id, order_sn, "escrow not synced").await;
        };
        if !order.is_completed() {
            let reason = format!("order status {}", order.effective_status());
            return self.mark_pending(existing, shop_id, order_sn, &reason).await;
        }
        if shipment.status != ShipmentStatus::ShippedPendingSettle {
            let reason = format!("shipment status {:?}", shipment.status);
            return self.mark_pending(existing, shop_id, order_sn, &reason).await;
        }
        let Some(owner_id) = self.store.get_shop(shop_id).await?.and_then(|s| s.owner_id) else {
            return self.mark_pending(existing, shop_id, order_sn, "shop has no owner").await;
        };

        let rates = self.rates_for(shop_id, shipment.operator_id).await?;
        let split = compute_split(
            escrow.seller_receive_amount,
            shipment.total_cost(),
            &rates,
            shipment.operator_id.is_some(),
        );

        let now = Utc::now();
        let mut settlement = Settlement {
            shop_id,
            order_sn: order_sn.to_string(),
            operator_id: shipment.operator_id,
            shop_owner_id: Some(owner_id),
            gross: split.gross,
            cost: split.cost,
            net: split.net,
            platform_share: split.platform,
            operator_share: split.operator,
            shop_owner_share: split.shop_owner,
            status: SettlementStatus::Completed,
            journal_posted: true,
            needs_adjustment: existing.as_ref().is_some_and(|s| s.needs_adjustment),
            last_error: None,
            created_at: existing.as_ref().map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
        };

        let legs = legs_for(&split, &shipment, owner_id);
        match self.post_legs(lease, &settlement, &legs, shipment.id).await {
            Ok(()) => {
                tracing::info!(
                    shop_id,
                    order_sn,
                    gross = %split.gross,
                    cost = %split.cost,
                    platform = %split.platform,
                    operator = %split.operator,
                    shop_owner = %split.shop_owner,
                    legs = legs.len(),
                    "Settlement completed"
                );
                Ok(SettleOutcome::Completed(settlement))
            }
            Err(e) if is_settlement_failure(&e) => {
                tracing::error!(shop_id, order_sn, error = %e, "Settlement failed");
                settlement.status = SettlementStatus::Failed;
                settlement.journal_posted = false;
                settlement.last_error = Some(e.to_string());
                self.store.save_open_settlement(&settlement).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn rates_for(&self, shop_id: ShopId, operator_id: Option<PrincipalId>) -> LedgerResult<ShareRates> {
        let operator_id = match operator_id {
            Some(id) => Some(id),
            None => self
                .store
                .get_active_cooperation(shop_id)
                .await?
                .map(|c| c.operator_id),
        };
        let Some(operator_id) = operator_id else {
            return Ok(self.default_rates);
        };
        Ok(self
            .store
            .get_profit_share(shop_id, operator_id)
            .await?
            .map(|c| c.rates)
            .unwrap_or(self.default_rates))
    }

    /// Lock every touched account in a fixed order, plan each leg against the
    /// fresh rows, then commit everything at once.
    async fn post_legs(
        &self,
        lease: &Lease,
        settlement: &Settlement,
        legs: &[Leg],
        shipment_id: i64,
    ) -> LedgerResult<()> {
        let mut names: Vec<String> = legs
            .iter()
            .map(|l| account_lock_name(l.kind, l.principal_id))
            .collect();
        names.sort();
        names.dedup();

        let mut held = Vec::with_capacity(names.len());
        let mut result = Ok(());
        for name in &names {
            match self
                .locks
                .acquire_with_retry(name, ACCOUNT_LOCK_TTL, ACCOUNT_LOCK_WAIT)
                .await
            {
                Ok(l) => held.push(l),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if result.is_ok() {
            result = self.commit_locked(lease, &held, settlement, legs, shipment_id).await;
        }

        for account_lease in held.into_iter().rev() {
            let name = account_lease.name().to_string();
            if let Err(e) = account_lease.release().await {
                tracing::warn!(lock = %name, error = %e, "Failed to release account lease");
            }
        }
        result
    }

    async fn commit_locked(
        &self,
        lease: &Lease,
        account_leases: &[Lease],
        settlement: &Settlement,
        legs: &[Leg],
        shipment_id: i64,
    ) -> LedgerResult<()> {
        let now = Utc::now();
        let remark = format!("settlement {}:{}", settlement.shop_id, settlement.order_sn);
        let mut postings: Vec<Posting> = Vec::with_capacity(legs.len());
        for leg in legs {
            let account = self.registry.get_or_create(leg.kind, leg.principal_id).await?;
            postings.push(plan_posting(
                &account,
                leg.tx_type,
                leg.amount,
                settlement_tx_no(settlement.shop_id, &settlement.order_sn, leg.suffix),
                &remark,
                AuditStatus::Approved,
                now,
            )?);
        }

        lease.ensure_held()?;
        for l in account_leases {
            l.ensure_held()?;
        }
        self.store
            .commit_settlement(settlement, &postings, shipment_id)
            .await
    }

    async fn mark_pending(
        &self,
        existing: Option<Settlement>,
        shop_id: ShopId,
        order_sn: &str,
        reason: &str,
    ) -> LedgerResult<SettleOutcome> {
        let now = Utc::now();
        let row = match existing {
            Some(mut s) => {
                s.status = SettlementStatus::Pending;
                s.last_error = Some(reason.to_string());
                s.updated_at = now;
                s
            }
            None => Settlement {
                shop_id,
                order_sn: order_sn.to_string(),
                operator_id: None,
                shop_owner_id: None,
                gross: Decimal::ZERO,
                cost: Decimal::ZERO,
                net: Decimal::ZERO,
                platform_share: Decimal::ZERO,
                operator_share: Decimal::ZERO,
                shop_owner_share: Decimal::ZERO,
                status: SettlementStatus::Pending,
                journal_posted: false,
                needs_adjustment: false,
                last_error: Some(reason.to_string()),
                created_at: now,
                updated_at: now,
            },
        };
        self.store.save_open_settlement(&row).await?;
        tracing::debug!(shop_id, order_sn, reason, "Settlement pending");
        Ok(SettleOutcome::Pending(reason.to_string()))
    }

    /// Scan up to `batch` shipped-but-unsettled shipments.
    ///
    /// Each call continues where the previous one stopped, walking every
    /// shard in id order before wrapping, so shipments that cannot settle
    /// yet never hide the ones behind them.
    pub async fn process_pending(&self, batch: usize) -> LedgerResult<PendingReport> {
        let mut report = PendingReport::default();
        let (mut shard, mut after_id) = {
            let cursor = self.sweep_cursor();
            (cursor.shard, cursor.after_id)
        };

        for _ in 0..SHARD_COUNT {
            let remaining = batch.saturating_sub(report.scanned);
            if remaining == 0 {
                break;
            }
            let shipments = self
                .store
                .list_shipments_by_status(
                    shard,
                    ShipmentStatus::ShippedPendingSettle,
                    after_id[shard],
                    remaining,
                )
                .await?;
            let exhausted = shipments.len() < remaining;
            for shipment in shipments {
                report.scanned += 1;
                after_id[shard] = shipment.id;
                match self.settle(shipment.shop_id, &shipment.order_sn).await {
                    Ok(SettleOutcome::Completed(_)) => report.completed += 1,
                    Ok(SettleOutcome::Pending(_)) => report.pending += 1,
                    Ok(SettleOutcome::AlreadyCompleted | SettleOutcome::AlreadySettling) => {
                        report.skipped += 1
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            shop_id = shipment.shop_id,
                            order_sn = %shipment.order_sn,
                            error = %e,
                            "Pending settlement failed"
                        );
                    }
                }
            }
            if exhausted {
                after_id[shard] = 0;
                shard = (shard + 1) % SHARD_COUNT;
            }
        }

        *self.sweep_cursor() = SweepCursor { shard, after_id };
        Ok(report)
    }
}

fn legs_for(split: &Split, shipment: &ShipmentRecord, owner_id: PrincipalId) -> Vec<Leg> {
    let mut legs = Vec::with_capacity(4);
    if let Some(operator_id) = shipment.operator_id
        && !split.operator.is_zero()
    {
        legs.push(Leg {
            kind: AccountKind::Operator,
            principal_id: operator_id,
            tx_type: TxType::SettleIn,
            amount: split.operator,
            suffix: "OP",
        });
    }
    if !split.shop_owner.is_zero() {
        legs.push(Leg {
            kind: AccountKind::ShopOwnerCommission,
            principal_id: owner_id,
            tx_type: TxType::SettleIn,
            amount: split.shop_owner,
            suffix: "SO",
        });
    }
    if !split.platform.is_zero() {
        legs.push(Leg {
            kind: AccountKind::PlatformCommission,
            principal_id: PLATFORM_PRINCIPAL_ID,
            tx_type: TxType::SettleIn,
            amount: split.platform,
            suffix: "PF",
        });
    }
    if !shipment.self_funded && split.cost > Decimal::ZERO {
        legs.push(Leg {
            kind: AccountKind::Prepayment,
            principal_id: owner_id,
            tx_type: TxType::SettleOut,
            amount: -split.cost,
            suffix: "PP",
        });
    }
    legs
}

/// Errors that leave the settlement in `failed` rather than retryable
fn is_settlement_failure(e: &LedgerError) -> bool {
    matches!(
        e,
        LedgerError::InsufficientBalance
            | LedgerError::InvalidAmount(_)
            | LedgerError::Integrity(_)
            | LedgerError::DuplicateTxNo(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::models::{Escrow, ORDER_STATUS_COMPLETED, Order, Shop, ShopStatus};
    use crate::store::{AccountStore, CommerceStore, MemoryStore};
    use crate::store::memory::FaultPoint;
    use std::str::FromStr;

    const SHOP: ShopId = 7;
    const OWNER: PrincipalId = 1_000_001;
    const OPERATOR: PrincipalId = 2_000_001;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        coord: Arc<MemoryCoordStore>,
        engine: SettlementEngine,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(MemoryCoordStore::new());
        let engine = SettlementEngine::new(
            store.clone(),
            AccountRegistry::new(store.clone()),
            LockManager::new(coord.clone()),
            ShareRates::default(),
        );
        store
            .save_shop(&Shop {
                shop_id: SHOP,
                owner_id: Some(OWNER),
                status: ShopStatus::Bound,
                tokens: None,
                region: "SG".into(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        Fixture { store, coord, engine }
    }

    async fn seed_order(store: &MemoryStore, sn: &str, status: &str, gross: Option<&str>) {
        let now = Utc::now();
        store
            .upsert_order(&Order {
                shop_id: SHOP,
                order_sn: sn.into(),
                status: status.into(),
                local_status_lock: None,
                total_amount: d("100"),
                currency: "SGD".into(),
                upstream_update_time: 1,
                first_seen_at: now,
                last_synced_at: now,
            })
            .await
            .unwrap();
        if let Some(gross) = gross {
            store
                .upsert_escrow(&Escrow {
                    shop_id: SHOP,
                    order_sn: sn.into(),
                    seller_receive_amount: d(gross),
                    commission_fee: Decimal::ZERO,
                    service_fee: Decimal::ZERO,
                    raw: serde_json::json!({}),
                    synced_at: now,
                })
                .await
                .unwrap();
        }
    }

    async fn seed_shipment(store: &MemoryStore, sn: &str, operator: Option<PrincipalId>, cost: &str, self_funded: bool) {
        let now = Utc::now();
        store
            .insert_shipment(&ShipmentRecord {
                id: 0,
                shop_id: SHOP,
                order_sn: sn.into(),
                operator_id: operator,
                goods_cost: d(cost),
                shipping_cost: Decimal::ZERO,
                tracking_no: String::new(),
                self_funded,
                status: ShipmentStatus::ShippedPendingSettle,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    async fn balance(store: &MemoryStore, kind: AccountKind, pid: PrincipalId) -> Decimal {
        store
            .get_account(kind, pid)
            .await
            .unwrap()
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    async fn fund_prepayment(store: &MemoryStore, amount: &str) {
        store.create_account_if_absent(AccountKind::Prepayment, OWNER).await.unwrap();
        let account = store.get_account(AccountKind::Prepayment, OWNER).await.unwrap().unwrap();
        let posting = plan_posting(
            &account,
            TxType::Recharge,
            d(amount),
            "RC-SEED".into(),
            "seed",
            AuditStatus::Approved,
            Utc::now(),
        )
        .unwrap();
        store.apply_posting(&posting).await.unwrap();
    }

    #[tokio::test]
    async fn test_settles_profitable_order() {
        let f = fixture().await;
        fund_prepayment(&f.store, "100").await;
        seed_order(&f.store, "A1", ORDER_STATUS_COMPLETED, Some("100.00")).await;
        seed_shipment(&f.store, "A1", Some(OPERATOR), "30.00", false).await;

        let outcome = f.engine.settle(SHOP, "A1").await.unwrap();
        let SettleOutcome::Completed(s) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(s.net, d("70"));

        assert_eq!(balance(&f.store, AccountKind::Operator, OPERATOR).await, d("31.5"));
        assert_eq!(balance(&f.store, AccountKind::ShopOwnerCommission, OWNER).await, d("35"));
        assert_eq!(balance(&f.store, AccountKind::PlatformCommission, 0).await, d("3.5"));
        assert_eq!(balance(&f.store, AccountKind::Prepayment, OWNER).await, d("70"));

        let row = f.store.get_settlement(SHOP, "A1").await.unwrap().unwrap();
        assert!(row.is_completed() && row.journal_posted);
        let shipment = f.store.get_shipment(SHOP, "A1").await.unwrap().unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Settled);

        // second run posts nothing new
        let journal = f.store.journal_len();
        assert_eq!(f.engine.settle(SHOP, "A1").await.unwrap(), SettleOutcome::AlreadyCompleted);
        assert_eq!(f.store.journal_len(), journal);
    }

    #[tokio::test]
    async fn test_loss_is_absorbed_by_platform() {
        let f = fixture().await;
        fund_prepayment(&f.store, "100").await;
        seed_order(&f.store, "L1", ORDER_STATUS_COMPLETED, Some("20.00")).await;
        seed_shipment(&f.store, "L1", Some(OPERATOR), "30.00", false).await;

        f.engine.settle(SHOP, "L1").await.unwrap();
        assert_eq!(balance(&f.store, AccountKind::PlatformCommission, 0).await, d("-10"));
        assert!(f.store.journal_of(AccountKind::Operator, OPERATOR).is_empty());
        assert!(f.store.journal_of(AccountKind::ShopOwnerCommission, OWNER).is_empty());
        assert_eq!(balance(&f.store, AccountKind::Prepayment, OWNER).await, d("70"));
    }

    #[tokio::test]
    async fn test_self_funded_skips_prepayment() {
        let f = fixture().await;
        seed_order(&f.store, "F1", ORDER_STATUS_COMPLETED, Some("100")).await;
        seed_shipment(&f.store, "F1", Some(OPERATOR), "30", true).await;

        f.engine.settle(SHOP, "F1").await.unwrap();
        assert!(f.store.journal_of(AccountKind::Prepayment, OWNER).is_empty());
        assert_eq!(balance(&f.store, AccountKind::Operator, OPERATOR).await, d("31.5"));
    }

    #[tokio::test]
    async fn test_missing_inputs_leave_it_pending() {
        let f = fixture().await;
        seed_order(&f.store, "P1", "SHIPPED", Some("100")).await;
        seed_shipment(&f.store, "P1", Some(OPERATOR), "30", true).await;

        let outcome = f.engine.settle(SHOP, "P1").await.unwrap();
        assert!(matches!(outcome, SettleOutcome::Pending(_)));
        let row = f.store.get_settlement(SHOP, "P1").await.unwrap().unwrap();
        assert_eq!(row.status, SettlementStatus::Pending);
        assert_eq!(f.store.journal_len(), 0);

        seed_order(&f.store, "P2", ORDER_STATUS_COMPLETED, None).await;
        seed_shipment(&f.store, "P2", None, "30", true).await;
        assert!(matches!(f.engine.settle(SHOP, "P2").await.unwrap(), SettleOutcome::Pending(_)));
    }

    #[tokio::test]
    async fn test_underfunded_prepayment_fails_without_partial_legs() {
        let f = fixture().await;
        fund_prepayment(&f.store, "10").await;
        seed_order(&f.store, "U1", ORDER_STATUS_COMPLETED, Some("100")).await;
        seed_shipment(&f.store, "U1", Some(OPERATOR), "30", false).await;

        let err = f.engine.settle(SHOP, "U1").await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance));
        assert_eq!(f.store.journal_len(), 1);
        let row = f.store.get_settlement(SHOP, "U1").await.unwrap().unwrap();
        assert_eq!(row.status, SettlementStatus::Failed);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn test_commit_fault_is_all_or_nothing() {
        let f = fixture().await;
        fund_prepayment(&f.store, "100").await;
        seed_order(&f.store, "X1", ORDER_STATUS_COMPLETED, Some("100")).await;
        seed_shipment(&f.store, "X1", Some(OPERATOR), "30", false).await;

        f.store.inject_fault(FaultPoint::CommitSettlement);
        assert!(f.engine.settle(SHOP, "X1").await.is_err());
        assert_eq!(f.store.journal_len(), 1);
        assert_eq!(
            f.store.get_shipment(SHOP, "X1").await.unwrap().unwrap().status,
            ShipmentStatus::ShippedPendingSettle
        );

        // retry after the fault settles exactly once
        assert!(matches!(
            f.engine.settle(SHOP, "X1").await.unwrap(),
            SettleOutcome::Completed(_)
        ));
        assert_eq!(f.store.journal_len(), 5);
    }

    #[tokio::test]
    async fn test_held_lock_reports_already_settling() {
        let f = fixture().await;
        seed_order(&f.store, "C1", ORDER_STATUS_COMPLETED, Some("100")).await;
        seed_shipment(&f.store, "C1", Some(OPERATOR), "30", true).await;
        f.coord.force_set("lock:settlement:7:C1", "other", Duration::from_secs(60));

        assert_eq!(f.engine.settle(SHOP, "C1").await.unwrap(), SettleOutcome::AlreadySettling);
        assert_eq!(f.store.journal_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_settles_post_once() {
        let f = fixture().await;
        seed_order(&f.store, "R1", ORDER_STATUS_COMPLETED, Some("100")).await;
        seed_shipment(&f.store, "R1", Some(OPERATOR), "30", true).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = f.engine.clone();
            handles.push(tokio::spawn(async move { engine.settle(SHOP, "R1").await }));
        }
        let mut completed = 0;
        for h in handles {
            if let Ok(SettleOutcome::Completed(_)) = h.await.unwrap() {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(f.store.journal_of(AccountKind::Operator, OPERATOR).len(), 1);
    }

    #[tokio::test]
    async fn test_process_pending_scans_shards() {
        let f = fixture().await;
        seed_order(&f.store, "S1", ORDER_STATUS_COMPLETED, Some("50")).await;
        seed_shipment(&f.store, "S1", None, "10", true).await;
        seed_order(&f.store, "S2", "SHIPPED", Some("50")).await;
        seed_shipment(&f.store, "S2", None, "10", true).await;

        let report = f.engine.process_pending(100).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.pending, 1);
        // self-shipped: owner takes the operator share too
        assert_eq!(balance(&f.store, AccountKind::ShopOwnerCommission, OWNER).await, d("38"));
    }

    #[tokio::test]
    async fn test_pending_sweep_moves_past_unsettleable_rows() {
        let f = fixture().await;
        seed_order(&f.store, "W1", "SHIPPED", None).await;
        seed_shipment(&f.store, "W1", None, "10", true).await;
        seed_order(&f.store, "W2", "SHIPPED", None).await;
        seed_shipment(&f.store, "W2", None, "10", true).await;
        seed_order(&f.store, "READY", ORDER_STATUS_COMPLETED, Some("50")).await;
        seed_shipment(&f.store, "READY", None, "10", true).await;

        let first = f.engine.process_pending(2).await.unwrap();
        assert_eq!((first.scanned, first.pending), (2, 2));
        assert!(f.store.get_settlement(SHOP, "READY").await.unwrap().is_none());

        let second = f.engine.process_pending(2).await.unwrap();
        assert_eq!(second.completed, 1);
        assert!(f.store.get_settlement(SHOP, "READY").await.unwrap().unwrap().is_completed());

        // after wrapping, the waiting rows come round again
        let third = f.engine.process_pending(2).await.unwrap();
        assert_eq!((third.scanned, third.pending), (2, 2));
    }
}
