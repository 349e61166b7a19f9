//! Sync Coordinator
//!
//! One pass = one (shop, kind) pull under `sync:{kind}:{shop}`. The pass
//! reads the sync record, refreshes the shop token when it is close to
//! expiry, pages the upstream API from the stored cursor and upserts every
//! row into its shard. The page marker is persisted after each fully stored
//! page, so a pass that dies mid-way resumes on the same page; the time
//! cursor only moves when the pass completes.
//!
//! Failure accounting goes through [`SyncRecord`]: transient upstream errors
//! are retried with backoff inside the pass, a pass that still fails bumps
//! `consecutive_fail_count`, and the tenth consecutive failure pauses the
//! record. Terminal upstream errors pause it at once.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::state::{SyncRecord, SyncType};
use crate::config::{SYNC_FAIL_THRESHOLD, SyncConfig};
use crate::core_types::ShopId;
use crate::error::{LedgerError, LedgerResult};
use crate::lock::{Lease, LockManager};
use crate::models::{Escrow, Order, ShipmentStatus, ShopStatus, WalletTransaction};
use crate::money::round_money;
use crate::settlement::SettleRequest;
use crate::shop::ShopService;
use crate::store::Store;
use crate::upstream::{MarketplaceApi, UpstreamOrder};

pub const SYNC_LOCK_TTL: Duration = Duration::from_secs(300);
pub const ESCROW_ORDER_LOCK_TTL: Duration = Duration::from_secs(60);
/// Refresh the access token when it expires sooner than this
pub const TOKEN_REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(10);
/// First pass of a new shop looks back this far
const INITIAL_LOOKBACK_SECS: i64 = 15 * 24 * 3600;
const ESCROW_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscrowFetch {
    Stored,
    NotReleased,
    /// Another worker holds the order lock
    Busy,
}

fn escrow_key(update_time: i64, order_sn: &str) -> String {
    format!("{}:{}", update_time, order_sn)
}

fn parse_escrow_key(marker: &str) -> Option<(i64, String)> {
    let (ts, sn) = marker.split_once(':')?;
    Some((ts.parse().ok()?, sn.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { synced: i64 },
    /// Another pass holds the lock
    AlreadySyncing,
    /// Record is paused, disabled or missing
    NotEnabled,
}

pub struct SyncCoordinator {
    store: Arc<dyn Store>,
    api: Arc<dyn MarketplaceApi>,
    locks: LockManager,
    shops: ShopService,
    config: SyncConfig,
    retry: RetryPolicy,
    settle_tx: Option<mpsc::Sender<SettleRequest>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        api: Arc<dyn MarketplaceApi>,
        locks: LockManager,
        shops: ShopService,
        config: SyncConfig,
    ) -> Self {
        let retry = RetryPolicy::with_attempts(config.max_retries);
        Self {
            store,
            api,
            locks,
            shops,
            config,
            retry,
            settle_tx: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Escrow arrivals for shipped orders are forwarded here for settlement
    pub fn with_settlement_trigger(mut self, tx: mpsc::Sender<SettleRequest>) -> Self {
        self.settle_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one pass of `sync_type` for `shop_id`
    pub async fn run_pass(
        &self,
        shop_id: ShopId,
        sync_type: SyncType,
        cancel: &CancellationToken,
    ) -> LedgerResult<SyncOutcome> {
        let lock = sync_type.lock_name(shop_id);
        let Some(lease) = self.locks.try_acquire(&lock, SYNC_LOCK_TTL).await? else {
            tracing::debug!(shop_id, sync_type = %sync_type, "Sync already running");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        let result = self.run_locked(&lease, shop_id, sync_type, cancel).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(lock = %lock, error = %e, "Failed to release sync lease");
        }
        result
    }

    async fn run_locked(
        &self,
        lease: &Lease,
        shop_id: ShopId,
        sync_type: SyncType,
        cancel: &CancellationToken,
    ) -> LedgerResult<SyncOutcome> {
        let Some(mut record) = self.store.get_sync_record(shop_id, sync_type).await? else {
            return Ok(SyncOutcome::NotEnabled);
        };
        if !record.is_enabled() {
            tracing::debug!(shop_id, sync_type = %sync_type, status = ?record.status, "Sync record not enabled");
            return Ok(SyncOutcome::NotEnabled);
        }

        match self.execute(lease, &mut record, cancel).await {
            Ok(synced) => {
                record.record_success(synced);
                self.store.save_sync_record(&record).await?;
                tracing::info!(
                    shop_id,
                    sync_type = %sync_type,
                    synced,
                    total = record.total_synced_count,
                    "Sync pass completed"
                );
                Ok(SyncOutcome::Completed { synced })
            }
            Err(LedgerError::Cancelled) => {
                tracing::info!(shop_id, sync_type = %sync_type, "Sync pass cancelled");
                Err(LedgerError::Cancelled)
            }
            Err(e) => Err(self.record_failure(&mut record, e).await),
        }
    }

    /// Persist a failed pass; returns the error to surface
    async fn record_failure(&self, record: &mut SyncRecord, error: LedgerError) -> LedgerError {
        let message = error.to_string();
        let surfaced = if matches!(error, LedgerError::UpstreamTerminal(_)) {
            record.pause(&message, SYNC_FAIL_THRESHOLD);
            tracing::warn!(shop_id = record.shop_id, sync_type = %record.sync_type, error = %message, "Sync paused on terminal upstream error");
            error
        } else if record.record_failure(&message, SYNC_FAIL_THRESHOLD) {
            tracing::warn!(
                shop_id = record.shop_id,
                sync_type = %record.sync_type,
                failures = record.consecutive_fail_count,
                error = %message,
                "Sync paused after consecutive failures"
            );
            LedgerError::UpstreamTerminal(format!(
                "paused after {} consecutive failures: {}",
                record.consecutive_fail_count, message
            ))
        } else {
            tracing::warn!(
                shop_id = record.shop_id,
                sync_type = %record.sync_type,
                failures = record.consecutive_fail_count,
                error = %message,
                "Sync pass failed"
            );
            error
        };
        if let Err(e) = self.store.save_sync_record(record).await {
            tracing::error!(shop_id = record.shop_id, error = %e, "Failed to persist sync failure");
        }
        surfaced
    }

    async fn execute(
        &self,
        lease: &Lease,
        record: &mut SyncRecord,
        cancel: &CancellationToken,
    ) -> LedgerResult<i64> {
        let token = self.access_token(record.shop_id, cancel).await?;
        match record.sync_type {
            SyncType::OrdersFull => self.sync_orders(lease, record, &token, cancel).await,
            SyncType::FinanceIncome => self.sync_income(lease, record, &token, cancel).await,
            SyncType::EscrowDetail => self.sync_escrows(lease, record, &token, cancel).await,
        }
    }

    /// Current access token, refreshed when inside the expiry window
    async fn access_token(&self, shop_id: ShopId, cancel: &CancellationToken) -> LedgerResult<String> {
        let shop = self.shops.get(shop_id).await?;
        if shop.status != ShopStatus::Bound {
            return Err(LedgerError::UpstreamTerminal(format!(
                "shop {} is not bound ({:?})",
                shop_id, shop.status
            )));
        }
        let Some(tokens) = shop.tokens else {
            return Err(LedgerError::UpstreamTerminal(format!("shop {} has no token", shop_id)));
        };
        if tokens.expire_at - Utc::now() > TOKEN_REFRESH_WINDOW {
            return Ok(tokens.access_token);
        }

        let refreshed = self
            .retry
            .run("refresh_token", cancel, || {
                self.api.refresh_token(shop_id, &tokens.refresh_token)
            })
            .await;
        match refreshed {
            Ok(pair) => {
                let access = pair.access_token.clone();
                self.shops.update_tokens(shop_id, pair).await?;
                tracing::info!(shop_id, "Access token refreshed");
                Ok(access)
            }
            Err(LedgerError::UpstreamTerminal(reason)) => {
                self.shops.mark_token_expired(shop_id, &reason).await?;
                Err(LedgerError::UpstreamTerminal(reason))
            }
            Err(e) => Err(e),
        }
    }

    fn window(record: &mut SyncRecord) -> (i64, i64) {
        record.open_window(Utc::now().timestamp(), INITIAL_LOOKBACK_SECS)
    }

    async fn sync_orders(
        &self,
        lease: &Lease,
        record: &mut SyncRecord,
        token: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<i64> {
        let shop_id = record.shop_id;
        let (time_from, time_to) = Self::window(record);
        let page_size = self.config.orders_page_size();
        let mut cursor = record.page_marker.clone();
        let mut synced = 0i64;

        loop {
            lease.ensure_held()?;
            let page = self
                .retry
                .run("list_orders", cancel, || {
                    self.api
                        .list_orders(shop_id, token, time_from, time_to, cursor.as_deref(), page_size)
                })
                .await?;

            let mut orders = page.orders;
            orders.sort_by_key(|o| o.update_time);
            for upstream in orders {
                if self.store_order(shop_id, upstream).await? {
                    synced += 1;
                }
            }

            match page.next_cursor {
                Some(next) if page.more => {
                    record.page_marker = Some(next.clone());
                    self.store.save_sync_record(record).await?;
                    cursor = Some(next);
                }
                _ => break,
            }
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
        }

        record.close_window();
        Ok(synced)
    }

    /// Upsert unless the stored row already reflects a newer upstream update
    async fn store_order(&self, shop_id: ShopId, upstream: UpstreamOrder) -> LedgerResult<bool> {
        let now = Utc::now();
        let existing = self.store.get_order(shop_id, &upstream.order_sn).await?;
        if existing
            .as_ref()
            .is_some_and(|o| o.upstream_update_time > upstream.update_time)
        {
            return Ok(false);
        }
        let order = Order {
            shop_id,
            order_sn: upstream.order_sn,
            status: upstream.order_status,
            local_status_lock: existing.as_ref().and_then(|o| o.local_status_lock.clone()),
            total_amount: round_money(upstream.total_amount),
            currency: upstream.currency,
            upstream_update_time: upstream.update_time,
            first_seen_at: existing.as_ref().map_or(now, |o| o.first_seen_at),
            last_synced_at: now,
        };
        self.store.upsert_order(&order).await?;
        Ok(true)
    }

    async fn sync_income(
        &self,
        lease: &Lease,
        record: &mut SyncRecord,
        token: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<i64> {
        let shop_id = record.shop_id;
        let (time_from, time_to) = Self::window(record);
        let page_size = self.config.income_page_size();
        let mut page_no: u32 = record
            .page_marker
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or(1);
        let mut synced = 0i64;

        loop {
            lease.ensure_held()?;
            let page = self
                .retry
                .run("list_wallet_transactions", cancel, || {
                    self.api
                        .list_wallet_transactions(shop_id, token, time_from, time_to, page_no, page_size)
                })
                .await?;

            let now = Utc::now();
            for tx in page.transactions {
                let row = WalletTransaction {
                    shop_id,
                    transaction_id: tx.transaction_id,
                    order_sn: tx.order_sn,
                    transaction_type: tx.transaction_type,
                    amount: round_money(tx.amount),
                    create_time: tx.create_time,
                    synced_at: now,
                };
                self.store.upsert_wallet_transaction(&row).await?;
                synced += 1;
            }

            if !page.more {
                break;
            }
            page_no += 1;
            record.page_marker = Some(page_no.to_string());
            self.store.save_sync_record(record).await?;
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
        }

        record.close_window();
        Ok(synced)
    }

    /// Escrow pass: completed orders that have no escrow yet.
    ///
    /// Orders are walked in `(update_time, order_sn)` order from the key
    /// stored in `page_marker`, so orders whose escrow stays unreleased do
    /// not hide newer ones. The walk wraps once a short page is read.
    async fn sync_escrows(
        &self,
        lease: &Lease,
        record: &mut SyncRecord,
        token: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<i64> {
        let shop_id = record.shop_id;
        let after = record.page_marker.as_deref().and_then(parse_escrow_key);
        let orders = self
            .store
            .list_orders_missing_escrow(shop_id, after.as_ref().map(|(ts, sn)| (*ts, sn.as_str())), ESCROW_BATCH)
            .await?;
        let wrapped = orders.len() < ESCROW_BATCH;
        let mut synced = 0i64;
        for order in orders {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            lease.ensure_held()?;
            match self.fetch_escrow(shop_id, &order.order_sn, token, cancel).await? {
                EscrowFetch::Stored => synced += 1,
                EscrowFetch::NotReleased => {
                    tracing::debug!(shop_id, order_sn = %order.order_sn, "Escrow not released yet");
                }
                EscrowFetch::Busy => {}
            }
            record.page_marker = Some(escrow_key(order.upstream_update_time, &order.order_sn));
        }
        if wrapped {
            record.page_marker = None;
        }
        Ok(synced)
    }

    /// On-demand escrow fetch for one order (webhook trigger)
    pub async fn sync_escrow_for_order(
        &self,
        shop_id: ShopId,
        order_sn: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<SyncOutcome> {
        let enabled = self
            .store
            .get_sync_record(shop_id, SyncType::EscrowDetail)
            .await?
            .is_some_and(|r| r.is_enabled());
        if !enabled {
            return Ok(SyncOutcome::NotEnabled);
        }
        let token = self.access_token(shop_id, cancel).await?;
        Ok(match self.fetch_escrow(shop_id, order_sn, &token, cancel).await? {
            EscrowFetch::Stored => SyncOutcome::Completed { synced: 1 },
            EscrowFetch::NotReleased => SyncOutcome::Completed { synced: 0 },
            EscrowFetch::Busy => SyncOutcome::AlreadySyncing,
        })
    }

    /// Fetch and store one escrow under `sync:escrow:{shop}:{order}`
    async fn fetch_escrow(
        &self,
        shop_id: ShopId,
        order_sn: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<EscrowFetch> {
        let lock = format!("sync:escrow:{}:{}", shop_id, order_sn);
        let Some(lease) = self.locks.try_acquire(&lock, ESCROW_ORDER_LOCK_TTL).await? else {
            return Ok(EscrowFetch::Busy);
        };
        let result = self.fetch_escrow_locked(&lease, shop_id, order_sn, token, cancel).await;
        if let Err(e) = lease.release().await {
            tracing::warn!(lock = %lock, error = %e, "Failed to release escrow lease");
        }
        result
    }

    async fn fetch_escrow_locked(
        &self,
        lease: &Lease,
        shop_id: ShopId,
        order_sn: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<EscrowFetch> {
        let detail = self
            .retry
            .run("get_escrow_detail", cancel, || {
                self.api.get_escrow_detail(shop_id, token, order_sn)
            })
            .await?;
        let Some(detail) = detail else {
            return Ok(EscrowFetch::NotReleased);
        };
        lease.ensure_held()?;

        let escrow = Escrow {
            shop_id,
            order_sn: order_sn.to_string(),
            seller_receive_amount: round_money(detail.seller_receive_amount),
            commission_fee: round_money(detail.commission_fee),
            service_fee: round_money(detail.service_fee),
            raw: detail.raw,
            synced_at: Utc::now(),
        };
        self.store.upsert_escrow(&escrow).await?;
        tracing::info!(shop_id, order_sn, amount = %escrow.seller_receive_amount, "Escrow stored");

        self.trigger_settlement(shop_id, order_sn).await?;
        Ok(EscrowFetch::Stored)
    }

    /// Escrow for an order that already shipped: hand it to settlement
    async fn trigger_settlement(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<()> {
        let Some(tx) = &self.settle_tx else {
            return Ok(());
        };
        let shipped = self
            .store
            .get_shipment(shop_id, order_sn)
            .await?
            .is_some_and(|s| s.status == ShipmentStatus::ShippedPendingSettle);
        if !shipped {
            return Ok(());
        }
        let request = SettleRequest {
            shop_id,
            order_sn: order_sn.to_string(),
        };
        // Full queue: the periodic pending scan settles it instead
        if let Err(e) = tx.try_send(request) {
            tracing::warn!(shop_id, order_sn, error = %e, "Settlement trigger dropped");
        }
        Ok(())
    }

    /// Operator action: paused -> enabled
    pub async fn reset(&self, shop_id: ShopId, sync_type: SyncType) -> LedgerResult<SyncRecord> {
        let mut record = self
            .store
            .get_sync_record(shop_id, sync_type)
            .await?
            .ok_or_else(|| LedgerError::not_found("sync record", format!("{}:{}", shop_id, sync_type)))?;
        if !record.reset() {
            return Err(LedgerError::Conflict(format!(
                "sync record {}:{} is not paused",
                shop_id, sync_type
            )));
        }
        self.store.save_sync_record(&record).await?;
        tracing::info!(shop_id, sync_type = %sync_type, "Sync record reset");
        Ok(record)
    }

    /// One pass of `sync_type` for every enabled shop. Returns passes completed.
    pub async fn run_all(&self, sync_type: SyncType, cancel: &CancellationToken) -> LedgerResult<usize> {
        let records = self
            .store
            .list_sync_records(sync_type, super::SyncStatus::Enabled)
            .await?;
        let mut completed = 0;
        for record in records {
            if cancel.is_cancelled() {
                break;
            }
            match self.run_pass(record.shop_id, sync_type, cancel).await {
                Ok(SyncOutcome::Completed { .. }) => completed += 1,
                Ok(_) => {}
                Err(LedgerError::Cancelled) => break,
                Err(e) => {
                    tracing::error!(shop_id = record.shop_id, sync_type = %sync_type, error = %e, "Sync pass failed");
                }
            }
        }
        Ok(completed)
    }
}
