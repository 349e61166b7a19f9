//! Storage seams
//!
//! The core talks to persistence only through these traits. `PgStore` is the
//! production implementation; `MemoryStore` backs tests and the development
//! mode that runs without PostgreSQL.
//!
//! Multi-row writes (`apply_posting`, `commit_settlement`, `commit_funds`) are
//! single storage transactions. Both re-check every posting's `balance_before` and
//! `frozen_before` against the stored account row and fail with `Integrity`
//! on mismatch, so a journal entry can never be written against a stale
//! balance.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::account::{Account, AccountKind, JournalEntry, JournalFilter, Posting};
use crate::core_types::{PrincipalId, PrincipalStatus, ShopId};
use crate::error::LedgerResult;
use crate::funding::{
    AuditStamp, RechargeApplication, RechargeStatus, WithdrawApplication, WithdrawStatus,
};
use crate::models::{
    CollectionAccount, Cooperation, Escrow, Order, Principal, ProfitShareConfig, Settlement,
    ShipmentRecord, ShipmentStatus, Shop, WalletTransaction,
};
use crate::sync::{SyncRecord, SyncStatus, SyncType};
use crate::webhook::EventLogEntry;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<Option<Account>>;

    /// Insert a zero row; no-op if the row already exists
    async fn create_account_if_absent(
        &self,
        kind: AccountKind,
        principal_id: PrincipalId,
    ) -> LedgerResult<()>;

    async fn list_accounts(&self, principal_id: PrincipalId) -> LedgerResult<Vec<Account>>;

    /// Insert the journal entry and update the account row atomically
    async fn apply_posting(&self, posting: &Posting) -> LedgerResult<()>;

    /// Entries of one shard matching `filter`, newest first
    async fn list_journal_shard(
        &self,
        shard: usize,
        filter: &JournalFilter,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<JournalEntry>>;
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn insert_principal(&self, principal: &Principal) -> LedgerResult<()>;
    async fn get_principal(&self, id: PrincipalId) -> LedgerResult<Option<Principal>>;
    async fn set_principal_status(
        &self,
        id: PrincipalId,
        status: PrincipalStatus,
    ) -> LedgerResult<bool>;

    /// Returns the new collection account id
    async fn insert_collection_account(&self, account: &CollectionAccount) -> LedgerResult<i64>;
    async fn get_collection_account(&self, id: i64) -> LedgerResult<Option<CollectionAccount>>;
}

#[async_trait]
pub trait CommerceStore: Send + Sync {
    // --- shops ---
    async fn get_shop(&self, shop_id: ShopId) -> LedgerResult<Option<Shop>>;
    async fn save_shop(&self, shop: &Shop) -> LedgerResult<()>;

    // --- cooperation / profit share ---
    async fn get_active_cooperation(&self, shop_id: ShopId) -> LedgerResult<Option<Cooperation>>;
    /// Returns the new cooperation id
    async fn insert_cooperation(&self, coop: &Cooperation) -> LedgerResult<i64>;
    async fn release_cooperation(&self, shop_id: ShopId) -> LedgerResult<bool>;
    async fn save_profit_share(&self, config: &ProfitShareConfig) -> LedgerResult<()>;
    async fn get_profit_share(
        &self,
        shop_id: ShopId,
        operator_id: PrincipalId,
    ) -> LedgerResult<Option<ProfitShareConfig>>;

    // --- orders ---
    async fn upsert_order(&self, order: &Order) -> LedgerResult<()>;
    async fn get_order(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Order>>;
    /// Completed orders of a shop that have no escrow row yet, in
    /// `(upstream_update_time, order_sn)` order strictly after `after`
    async fn list_orders_missing_escrow(
        &self,
        shop_id: ShopId,
        after: Option<(i64, &str)>,
        limit: usize,
    ) -> LedgerResult<Vec<Order>>;

    // --- shipments ---
    /// Returns the new shipment id
    async fn insert_shipment(&self, shipment: &ShipmentRecord) -> LedgerResult<i64>;
    /// Most recent shipment for an order
    async fn get_shipment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<ShipmentRecord>>;
    async fn update_shipment_tracking(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        tracking_no: &str,
    ) -> LedgerResult<bool>;
    /// Compare-and-set on shipment status
    async fn update_shipment_status(
        &self,
        shop_id: ShopId,
        shipment_id: i64,
        from: ShipmentStatus,
        to: ShipmentStatus,
    ) -> LedgerResult<bool>;
    /// Shipments of one shard in `status` with `id > after_id`, by id
    async fn list_shipments_by_status(
        &self,
        shard: usize,
        status: ShipmentStatus,
        after_id: i64,
        limit: usize,
    ) -> LedgerResult<Vec<ShipmentRecord>>;

    // --- escrow / income ---
    async fn upsert_escrow(&self, escrow: &Escrow) -> LedgerResult<()>;
    async fn get_escrow(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<Option<Escrow>>;
    async fn upsert_wallet_transaction(&self, tx: &WalletTransaction) -> LedgerResult<()>;

    // --- settlements ---
    async fn get_settlement(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<Option<Settlement>>;
    /// Upsert a non-completed settlement row. Never overwrites a completed row.
    async fn save_open_settlement(&self, settlement: &Settlement) -> LedgerResult<()>;
    /// One transaction: completed settlement row, every posting, shipment -> settled
    async fn commit_settlement(
        &self,
        settlement: &Settlement,
        postings: &[Posting],
        shipment_id: i64,
    ) -> LedgerResult<()>;
    async fn flag_settlement_adjustment(
        &self,
        shop_id: ShopId,
        order_sn: &str,
    ) -> LedgerResult<bool>;
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_sync_record(
        &self,
        shop_id: ShopId,
        sync_type: SyncType,
    ) -> LedgerResult<Option<SyncRecord>>;
    async fn save_sync_record(&self, record: &SyncRecord) -> LedgerResult<()>;
    async fn list_sync_records(
        &self,
        sync_type: SyncType,
        status: SyncStatus,
    ) -> LedgerResult<Vec<SyncRecord>>;
}

/// Application row change that commits with a balance posting
#[derive(Debug, Clone, Copy)]
pub enum FundsChange<'a> {
    /// New withdraw application; `freeze_tx_no` is taken from the posting
    OpenWithdraw(&'a WithdrawApplication),
    Withdraw {
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
        stamp: &'a AuditStamp,
    },
    Recharge {
        id: i64,
        from: RechargeStatus,
        to: RechargeStatus,
        stamp: &'a AuditStamp,
    },
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Apply `posting` together with `change` in one transaction.
    ///
    /// Returns the application id, or `None` when a status transition lost
    /// its compare-and-set. Nothing is written in that case.
    async fn commit_funds(
        &self,
        posting: &Posting,
        change: FundsChange<'_>,
    ) -> LedgerResult<Option<i64>>;
    async fn get_withdraw(&self, id: i64) -> LedgerResult<Option<WithdrawApplication>>;
    /// Compare-and-set status transition; false if `from` no longer matches
    async fn transition_withdraw(
        &self,
        id: i64,
        from: WithdrawStatus,
        to: WithdrawStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool>;
    async fn list_withdraws(
        &self,
        status: Option<WithdrawStatus>,
        limit: usize,
    ) -> LedgerResult<Vec<WithdrawApplication>>;

    async fn insert_recharge(&self, app: &RechargeApplication) -> LedgerResult<i64>;
    async fn get_recharge(&self, id: i64) -> LedgerResult<Option<RechargeApplication>>;
    async fn transition_recharge(
        &self,
        id: i64,
        from: RechargeStatus,
        to: RechargeStatus,
        stamp: &AuditStamp,
    ) -> LedgerResult<bool>;
}

#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn insert_event_log(&self, entry: &EventLogEntry) -> LedgerResult<i64>;
    async fn list_event_logs(
        &self,
        shop_id: Option<ShopId>,
        limit: usize,
    ) -> LedgerResult<Vec<EventLogEntry>>;
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Round-trip to the backing store
    async fn ping(&self) -> LedgerResult<()>;
}

/// Everything the core needs from persistence
pub trait Store:
    AccountStore
    + DirectoryStore
    + CommerceStore
    + SyncStore
    + WorkflowStore
    + EventLogStore
    + StoreHealth
{
}

impl<T> Store for T where
    T: AccountStore
        + DirectoryStore
        + CommerceStore
        + SyncStore
        + WorkflowStore
        + EventLogStore
        + StoreHealth
{
}
