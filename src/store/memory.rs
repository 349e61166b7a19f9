//! In-process store
//!
//! A single mutex guards the whole state so multi-row writes are trivially
//! atomic. Used by the test suites and by the binary when no `postgres_url`
//! is configured.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use super::{
    AccountStore, CommerceStore, DirectoryStore, EventLogStore, FundsChange, StoreHealth, SyncStore,
    WorkflowStore,
};
use crate::account::{Account, AccountKind, JournalEntry, JournalFilter, Posting};
use crate::core_types::{PrincipalId, PrincipalStatus, ShopId};
use crate::error::{LedgerError, LedgerResult};
use crate::funding::{
    AuditStamp, RechargeApplication, RechargeStatus, WithdrawApplication, WithdrawStatus,
};
use crate::models::{
    CollectionAccount, Cooperation, CooperationStatus, Escrow, Order, Principal,
    ProfitShareConfig, Settlement, SettlementStatus, ShipmentRecord, ShipmentStatus, Shop,
    WalletTransaction,
};
use crate::shard::{self, SHARD_COUNT};
use crate::sync::{SyncRecord, SyncStatus, SyncType};
use crate::webhook::EventLogEntry;

/// Operations that can be forced to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    InsertWithdraw,
    CommitFunds,
    CommitSettlement,
    ApplyPosting,
    UpsertOrder,
    Ping,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    accounts: HashMap<(AccountKind, PrincipalId), Account>,
    journal: Vec<Vec<JournalEntry>>,
    tx_nos: HashSet<String>,
    principals: HashMap<PrincipalId, Principal>,
    collection_accounts: HashMap<i64, CollectionAccount>,
    shops: HashMap<ShopId, Shop>,
    cooperations: Vec<Cooperation>,
    profit_shares: HashMap<(ShopId, PrincipalId), ProfitShareConfig>,
    orders: HashMap<(ShopId, String), Order>,
    shipments: Vec<ShipmentRecord>,
    escrows: HashMap<(ShopId, String), Escrow>,
    wallet: HashMap<(ShopId, i64), WalletTransaction>,
    settlements: HashMap<(ShopId, String), Settlement>,
    sync_records: HashMap<(ShopId, SyncType), SyncRecord>,
    withdraws: BTreeMap<i64, WithdrawApplication>,
    recharges: BTreeMap<i64, RechargeApplication>,
    event_logs: Vec<EventLogEntry>,
    faults: HashSet<FaultPoint>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_fault(&mut self, point: FaultPoint) -> LedgerResult<()> {
        if self.faults.remove(&point) {
            return Err(LedgerError::Database(format!("injected fault: {:?}", point)));
        }
        Ok(())
    }

    /// Validate a posting against the current row without mutating anything
    fn check_posting(&self, posting: &Posting) -> LedgerResult<()> {
        let e = &posting.entry;
        let account = self
            .accounts
            .get(&(e.kind, e.principal_id))
            .ok_or_else(|| LedgerError::not_found("account", format!("{}:{}", e.kind, e.principal_id)))?;
        if account.balance != e.balance_before || account.frozen != posting.frozen_before {
            return Err(LedgerError::Integrity(format!(
                "stale posting {}: stored balance {} frozen {}, expected {} / {}",
                e.tx_no, account.balance, account.frozen, e.balance_before, posting.frozen_before
            )));
        }
        if self.tx_nos.contains(&e.tx_no) {
            return Err(LedgerError::DuplicateTxNo(e.tx_no.clone()));
        }
        Ok(())
    }

    fn write_posting(&mut self, posting: &Posting) {
        let e = &posting.entry;
        if let Some(account) = self.accounts.get_mut(&(e.kind, e.principal_id)) {
            *account = posting.apply_to(account);
        }
        self.tx_nos.insert(e.tx_no.clone());
        self.journal[shard::index(e.principal_id)].push(e.clone());
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let inner = Inner {
            journal: vec![Vec::new(); SHARD_COUNT],
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Force the next call at `point` to fail with a database error
    pub fn inject_fault(&self, point: FaultPoint) {
        self.lock().faults.insert(point);
    }

    /// Every journal entry of one account, in insertion order
    pub fn journal_of(&self, kind: AccountKind, principal_id: PrincipalId) -> Vec<JournalEntry> {
        self.lock().journal[shard::index(principal_id)]
            .iter()
            .filter(|e| e.kind == kind && e.principal_id == principal_id)
            .cloned()
            .collect()
    }

    /// Total journal entries across all shards
    pub fn journal_len(&self) -> usize {
        self.lock().journal.iter().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in tests; keep serving.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<Option<Account>> {
        Ok(self.lock().accounts.get(&(kind, principal_id)).cloned())
    }

    async fn create_account_if_absent(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<()> {
        self.lock()
            .accounts
            .entry((kind, principal_id))
            .or_insert_with(|| Account::zero(kind, principal_id));
        Ok(())
    }

    async fn list_accounts(&self, principal_id: PrincipalId) -> LedgerResult<Vec<Account>> {
        let inner = self.lock();
        let mut rows: Vec<Account> = inner
            .accounts
            .values()
            .filter(|a| a.principal_id == principal_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.kind);
        Ok(rows)
    }

    async fn apply_posting(&self, posting: &Posting) -> LedgerResult<()> {
        let mut inner = self.lock();
        inner.take_fault(FaultPoint::ApplyPosting)?;
        inner.check_posting(posting)?;
        inner.write_posting(posting);
        Ok(())
    }

    async fn list_journal_shard(
        &self,
        shard: usize,
        filter: &JournalFilter,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<JournalEntry>> {
        let inner = self.lock();
        let Some(entries) = inner.journal.get(shard) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn insert_principal(&self, principal: &Principal) -> LedgerResult<()> {
        let mut inner = self.lock();
        if inner.principals.contains_key(&principal.id) {
            return Err(LedgerError::Integrity(format!(
                "principal id {} already issued",
                principal.id
            )));
        }
        inner.principals.insert(principal.id, principal.clone());
        Ok(())
    }

    async fn get_principal(&self, id: PrincipalId) -> LedgerResult<Option<Principal>> {
        Ok(self.lock().principals.get(&id).cloned())
    }

    async fn set_principal_status(
        &self,
        id: PrincipalId,
        status: PrincipalStatus,
    ) -> LedgerResult<bool> {
        Ok(match self.lock().principals.get_mut(&id) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        })
    }

    async fn insert_collection_account(&self, account: &CollectionAccount) -> LedgerResult<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut row = account.clone();
        row.id = id;
        inner.collection_accounts.insert(id, row);
        Ok(id)
    }

    async fn get_collection_account(&self, id: i64) -> LedgerResult<Option<CollectionAccount>> {
        Ok(self.lock().collection_accounts.get(&id).cloned())
    }
}

#[async_trait]
impl CommerceStore for MemoryStore {
    async fn get_shop(&self, shop_id: ShopId) -> LedgerResult<Option<Shop>> {
        Ok(self.lock().shops.get(&shop_id).cloned())
    }

    async fn save_shop(&self, shop: &Shop) -> LedgerResult<()> {
        self.lock().shops.insert(shop.shop_id, shop.clone());
        Ok(())
    }

    async fn get_active_cooperation(&self, shop_id: ShopId) -> LedgerResult<Option<Cooperation>> {
        Ok(self
            .lock()
            .cooperations
            .iter()
            .find(|c| c.shop_id == shop_id && c.status == CooperationStatus::Active)
            .cloned())
    }

    async fn insert_cooperation(&self, coop: &Cooperation) -> LedgerResult<i64> {
        let mut inner = self.lock();
        if inner
            .cooperations
            .iter()
            .any(|c| c.shop_id == coop.shop_id && c.status == CooperationStatus::Active)
        {
            return Err(LedgerError::Conflict(format!(
                "shop {} already has an active operator",
                coop.shop_id
            )));
        }
        let id = inner.next_id();
        let mut row = coop.clone();
        row.id = id;
        inner.cooperations.push(row);
        Ok(id)
    }

    async fn release_cooperation(&self, shop_id: ShopId) -> LedgerResult<bool> {
        let mut inner = self.lock();
        let mut released = false;
        for c in inner
            .cooperations
            .iter_mut()
            .filter(|c| c.shop_id == shop_id && c.status == CooperationStatus::Active)
        {
            c.status = CooperationStatus::Released;
            c.updated_at = chrono::Utc::now();
            released = true;
        }
        Ok(released)
    }

    async fn save_profit_share(&self, config: &ProfitShareConfig) -> LedgerResult<()> {
        self.lock()
            .profit_shares
            .insert((config.shop_id, config.operator_id), config.clone());
        Ok(())
    }

    async fn get_profit_share(
        &self,
        shop_id: ShopId,
        operator_id: PrincipalId,
    ) -> LedgerResult<Option<ProfitShareConfig>> {
        Ok(self.lock().profit_shares.get(&(shop_id, operator_id)).cloned())
    }

    async fn upsert_order(&self, order: &Order) -> LedgerResult<()> {
        let mut inner = self.lock();
        inner.take_fault(FaultPoint::UpsertOrder)?;
        let key = (order.shop_id, order.order_sn.clone());
        match inner.orders.get_mut(&key) {
            Some(existing) => {
                let first_seen_at = existing.first_seen_at;
                *existing = order.clone();
                existing.first_seen_at = first_seen_at;
            }
            None => {
                inner.orders.insert(key, order.clone());
            }
        }
        Ok(())
    }

    async fn get_order(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Order>> {
        Ok(self
            .lock()
            .orders
            .get(&(shop_id, order_sn.to_string()))
            .cloned())
    }

    async fn list_orders_missing_escrow(
        &self,
        shop_id: ShopId,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> LedgerResult<Vec<Order>> {
        let inner = self.lock();
        let mut rows: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.shop_id == shop_id && o.is_completed())
            .filter(|o| !inner.escrows.contains_key(&(o.shop_id, o.order_sn.clone())))
            .filter(|o| after.is_none_or(|(ts, sn)| (o.upstream_update_time, o.order_sn.as_str()) > (ts, sn)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.upstream_update_time, &a.order_sn).cmp(&(b.upstream_update_time, &b.order_sn))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_shipment(&self, shipment: &ShipmentRecord) -> LedgerResult<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut row = shipment.clone();
        row.id = id;
        inner.shipments.push(row);
        Ok(id)
    }

    async fn get_shipment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<ShipmentRecord>> {
        Ok(self
            .lock()
            .shipments
            .iter()
            .rev()
            .find(|s| s.shop_id == shop_id && s.order_sn == order_sn)
            .cloned())
    }

    async fn update_shipment_tracking(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        tracking_no: &str,
    ) -> LedgerResult<bool> {
        let mut inner = self.lock();
        Ok(
            match inner
                .shipments
                .iter_mut()
                .find(|s| s.shop_id == shop_id && s.id == shipment_id)
            {
                Some(s) => {
                    s.tracking_no = tracking_no.to_string();
                    s.updated_at = chrono::Utc::now();
                    true
                }
                None => false,
            },
        )
    }

    async fn update_shipment_status(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        from: ShipmentStatus,
        to: ShipmentStatus,
    ) -> LedgerResult<bool> {
        let mut inner = self.lock();
        Ok(
            match inner
                .shipments
                .iter_mut()
                .find(|s| s.shop_id == shop_id && s.id == shipment_id && s.status == from)
            {
                Some(s) => {
                    s.status = to;
                    s.updated_at = chrono::Utc::now();
                    true
                }
                None => false,
            },
        )
    }

    async fn list_shipments_by_status(
        &self,
        shard: usize,
        status: ShipmentStatus,
        after_id: i64,
        limit: usize,
    ) -> LedgerResult<Vec<ShipmentRecord>> {
        Ok(self
            .lock()
            .shipments
            .iter()
            .filter(|s| shard::index(s.shop_id) == shard && s.status == status && s.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_escrow(&self, escrow: &Escrow) -> LedgerResult<()> {
        self.lock()
            .escrows
            .insert((escrow.shop_id, escrow.order_sn.clone()), escrow.clone());
        Ok(())
    }

    async fn get_escrow(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Escrow>> {
        Ok(self
            .lock()
            .escrows
            .get(&(shop_id, order_sn.to_string()))
            .cloned())
    }

    async fn upsert_wallet_transaction(&self, tx: &WalletTransaction) -> LedgerResult<()> {
        self.lock()
            .wallet
            .insert((tx.shop_id, tx.transaction_id), tx.clone());
        Ok(())
    }

    async fn get_settlement(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<Settlement>> {
        Ok(self
            .lock()
            .settlements
            .get(&(shop_id, order_sn.to_string()))
            .cloned())
    }

    async fn save_open_settlement(&self, settlement: &Settlement) -> LedgerResult<()> {
        let mut inner = self.lock();
        let key = (settlement.shop_id, settlement.order_sn.clone());
        if inner.settlements.get(&key).is_some_and(|s| s.is_completed()) {
            return Ok(());
        }
        inner.settlements.insert(key, settlement.clone());
        Ok(())
    }

    async fn commit_settlement(
        &self,
        settlement: &Settlement,
        postings: &[Posting],
        shipment_id: i64,
    ) -> LedgerResult<()> {
        let mut inner = self.lock();
        inner.take_fault(FaultPoint::CommitSettlement)?;

        let key = (settlement.shop_id, settlement.order_sn.clone());
        if inner.settlements.get(&key).is_some_and(|s| s.is_completed()) {
            return Err(LedgerError::Conflict(format!(
                "settlement {}:{} already completed",
                settlement.shop_id, settlement.order_sn
            )));
        }
        let shipment_idx = inner
            .shipments
            .iter()
            .position(|s| {
                s.id == shipment_id
                    && s.shop_id == settlement.shop_id
                    && s.status == ShipmentStatus::ShippedPendingSettle
            })
            .ok_or_else(|| {
                LedgerError::Conflict(format!("shipment {} is not pending settlement", shipment_id))
            })?;
        for posting in postings {
            inner.check_posting(posting)?;
        }

        for posting in postings {
            inner.write_posting(posting);
        }
        let mut row = settlement.clone();
        row.status = SettlementStatus::Completed;
        row.journal_posted = true;
        inner.settlements.insert(key, row);
        let shipment = &mut inner.shipments[shipment_idx];
        shipment.status = ShipmentStatus::Settled;
        shipment.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn flag_settlement_adjustment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<bool> {
        let mut inner = self.lock();
        Ok(
            match inner.settlements.get_mut(&(shop_id, order_sn.to_string())) {
                Some(s) => {
                    s.needs_adjustment = true;
                    s.updated_at = chrono::Utc::now();
                    true
                }
                None => false,
            },
        )
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_sync_record(
        &self,
        shop_id: ShopId,
        sync_type: SyncType,
    ) -> LedgerResult<Option<SyncRecord>> {
        Ok(self.lock().sync_records.get(&(shop_id, sync_type)).cloned())
    }

    async fn save_sync_record(&self, record: &SyncRecord) -> LedgerResult<()> {
        self.lock()
            .sync_records
            .insert((record.shop_id, record.sync_type), record.clone());
        Ok(())
    }

    async fn list_sync_records(
        &self,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> LedgerResult<Vec<SyncRecord>> {
        let mut rows: Vec<SyncRecord> = self
            .lock()
            .sync_records
            .values()
            .filter(|r| r.sync_type == sync_type && r.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.shop_id);
        Ok(rows)
    }
}

fn stamp_withdraw(app: &mut WithdrawApplication, to: WithdrawStatus, stamp: &AuditStamp) {
    app.status = to;
    app.auditor_id = Some(stamp.auditor_id);
    if stamp.remark.is_some() {
        app.audit_remark = stamp.remark.clone();
    }
    if stamp.tx_no.is_some() {
        app.settle_tx_no = stamp.tx_no.clone();
    }
    app.updated_at = chrono::Utc::now();
}

fn stamp_recharge(app: &mut RechargeApplication, to: RechargeStatus, stamp: &AuditStamp) {
    app.status = to;
    app.auditor_id = Some(stamp.auditor_id);
    if stamp.remark.is_some() {
        app.audit_remark = stamp.remark.clone();
    }
    if stamp.tx_no.is_some() {
        app.tx_no = stamp.tx_no.clone();
    }
    app.updated_at = chrono::Utc::now();
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn commit_funds(
        &self,
        posting: &Posting,
        change: FundsChange<'_>,
    ) -> LedgerResult<Option<i64>> {
        let mut inner = self.lock();
        match change {
            FundsChange::OpenWithdraw(_) => inner.take_fault(FaultPoint::InsertWithdraw)?,
            FundsChange::Withdraw { id, from, .. } => {
                if !inner.withdraws.get(&id).is_some_and(|a| a.status == from) {
                    return Ok(None);
                }
                inner.take_fault(FaultPoint::CommitFunds)?;
            }
            FundsChange::Recharge { id, from, .. } => {
                if !inner.recharges.get(&id).is_some_and(|a| a.status == from) {
                    return Ok(None);
                }
                inner.take_fault(FaultPoint::CommitFunds)?;
            }
        }
        inner.check_posting(posting)?;

        let id = match change {
            FundsChange::OpenWithdraw(app) => {
                let id = inner.next_id();
                let mut row = app.clone();
                row.id = id;
                row.freeze_tx_no = posting.entry.tx_no.clone();
                inner.withdraws.insert(id, row);
                id
            }
            FundsChange::Withdraw { id, to, stamp, .. } => {
                if let Some(app) = inner.withdraws.get_mut(&id) {
                    stamp_withdraw(app, to, stamp);
                }
                id
            }
            FundsChange::Recharge { id, to, stamp, .. } => {
                if let Some(app) = inner.recharges.get_mut(&id) {
                    stamp_recharge(app, to, stamp);
                }
                id
            }
        };
        inner.write_posting(posting);
        Ok(Some(id))
    }

    async fn get_withdraw(&self, id: i64) -> LedgerResult<Option<WithdrawApplication>> {
        Ok(self.lock().withdraws.get(&id).cloned())
    }

    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool> {
        let mut inner = self.lock();
        let Some(app) = inner.withdraws.get_mut(&id) else {
            return Ok(false);
        };
        if app.status != from {
            return Ok(false);
        }
        stamp_withdraw(app, to, stamp);
        Ok(true)
    }

    async fn list_withdraws(
        &self,
        status: Option<WithdrawStatus>,
        limit: usize,
    ) -> LedgerResult<Vec<WithdrawApplication>> {
        Ok(self
            .lock()
            .withdraws
            .values()
            .rev()
            .filter(|a| status.is_none_or(|s| a.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_recharge(&self, app: &RechargeApplication) -> LedgerResult<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut row = app.clone();
        row.id = id;
        inner.recharges.insert(id, row);
        Ok(id)
    }

    async fn get_recharge(&self, id: i64) -> LedgerResult<Option<RechargeApplication>> {
        Ok(self.lock().recharges.get(&id).cloned())
    }

    async fn transition_recharge(
        &self,
        id: i64,
        from: RechargeStatus,
        to: RechargeStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool> {
        let mut inner = self.lock();
        let Some(app) = inner.recharges.get_mut(&id) else {
            return Ok(false);
        };
        if app.status != from {
            return Ok(false);
        }
        stamp_recharge(app, to, stamp);
        Ok(true)
    }
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn ping(&self) -> LedgerResult<()> {
        self.lock().take_fault(FaultPoint::Ping)
    }
}

#[async_trait]
impl EventLogStore for MemoryStore {
    async fn insert_event_log(&self, entry: &EventLogEntry) -> LedgerResult<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let mut row = entry.clone();
        row.id = id;
        inner.event_logs.push(row);
        Ok(id)
    }

    async fn list_event_logs(
        &self,
        shop_id: Option<ShopId>,
        limit: usize,
    ) -> LedgerResult<Vec<EventLogEntry>> {
        Ok(self
            .lock()
            .event_logs
            .iter()
            .rev()
            .filter(|e| shop_id.is_none_or(|s| e.shop_id == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
