//! Scripted marketplace for tests and offline runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::MarketplaceApi;
use super::types::{EscrowDetail, OrderPage, UpstreamOrder, WalletPage};
use crate::core_types::ShopId;
use crate::error::{LedgerError, LedgerResult};
use crate::models::TokenPair;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Replays queued responses. Empty queues yield empty pages; a sticky
/// failure makes every order-list call fail until cleared.
#[derive(Default)]
pub struct MockMarketplace {
    order_pages: Mutex<VecDeque<LedgerResult<OrderPage>>>,
    orders_failure: Mutex<Option<LedgerError>>,
    wallet_pages: Mutex<VecDeque<LedgerResult<WalletPage>>>,
    escrows: Mutex<HashMap<String, EscrowDetail>>,
    escrow_errors: Mutex<VecDeque<LedgerError>>,
    refresh_results: Mutex<VecDeque<LedgerResult<TokenPair>>>,
    tracking: Mutex<HashMap<String, String>>,
    /// Cursor argument of every `list_orders` call
    seen_cursors: Mutex<Vec<Option<String>>>,
    list_orders_calls: AtomicUsize,
    wallet_calls: AtomicUsize,
    escrow_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_order_page(&self, page: LedgerResult<OrderPage>) {
        guard(&self.order_pages).push_back(page);
    }

    pub fn set_orders_failure(&self, failure: Option<LedgerError>) {
        *guard(&self.orders_failure) = failure;
    }

    pub fn push_wallet_page(&self, page: LedgerResult<WalletPage>) {
        guard(&self.wallet_pages).push_back(page);
    }

    pub fn set_escrow(&self, escrow: EscrowDetail) {
        guard(&self.escrows).insert(escrow.order_sn.clone(), escrow);
    }

    pub fn push_escrow_error(&self, error: LedgerError) {
        guard(&self.escrow_errors).push_back(error);
    }

    pub fn push_refresh_result(&self, result: LedgerResult<TokenPair>) {
        guard(&self.refresh_results).push_back(result);
    }

    pub fn set_tracking(&self, order_sn: &str, tracking_no: &str) {
        guard(&self.tracking).insert(order_sn.to_string(), tracking_no.to_string());
    }

    pub fn seen_cursors(&self) -> Vec<Option<String>> {
        guard(&self.seen_cursors).clone()
    }

    pub fn list_orders_calls(&self) -> usize {
        self.list_orders_calls.load(Ordering::SeqCst)
    }

    pub fn wallet_calls(&self) -> usize {
        self.wallet_calls.load(Ordering::SeqCst)
    }

    pub fn escrow_calls(&self) -> usize {
        self.escrow_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn fresh_tokens() -> TokenPair {
        TokenPair {
            access_token: format!("at-{}", uuid::Uuid::new_v4()),
            refresh_token: format!("rt-{}", uuid::Uuid::new_v4()),
            expire_at: Utc::now() + chrono::Duration::hours(4),
        }
    }
}

#[async_trait]
impl MarketplaceApi for MockMarketplace {
    async fn get_access_token(&self, _shop_id: ShopId, code: &str) -> LedgerResult<TokenPair> {
        if code.is_empty() {
            return Err(LedgerError::UpstreamTerminal("error_auth: empty code".into()));
        }
        Ok(Self::fresh_tokens())
    }

    async fn refresh_token(&self, _shop_id: ShopId, _refresh_token: &str) -> LedgerResult<TokenPair> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        guard(&self.refresh_results)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::fresh_tokens()))
    }

    async fn list_orders(
        &self,
        _shop_id: ShopId,
        _access_token: &str,
        _time_from: i64,
        _time_to: i64,
        cursor: Option<&str>,
        _page_size: u32,
    ) -> LedgerResult<OrderPage> {
        self.list_orders_calls.fetch_add(1, Ordering::SeqCst);
        guard(&self.seen_cursors).push(cursor.map(str::to_string));
        if let Some(e) = guard(&self.orders_failure).clone() {
            return Err(e);
        }
        guard(&self.order_pages)
            .pop_front()
            .unwrap_or_else(|| Ok(OrderPage::default()))
    }

    async fn get_order_details(
        &self,
        _shop_id: ShopId,
        _access_token: &str,
        _order_sns: &[String],
    ) -> LedgerResult<Vec<UpstreamOrder>> {
        Ok(Vec::new())
    }

    async fn get_escrow_detail(
        &self,
        _shop_id: ShopId,
        _access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<Option<EscrowDetail>> {
        self.escrow_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = guard(&self.escrow_errors).pop_front() {
            return Err(e);
        }
        Ok(guard(&self.escrows).get(order_sn).cloned())
    }

    async fn list_wallet_transactions(
        &self,
        _shop_id: ShopId,
        _access_token: &str,
        _time_from: i64,
        _time_to: i64,
        _page_no: u32,
        _page_size: u32,
    ) -> LedgerResult<WalletPage> {
        self.wallet_calls.fetch_add(1, Ordering::SeqCst);
        guard(&self.wallet_pages)
            .pop_front()
            .unwrap_or_else(|| Ok(WalletPage::default()))
    }

    async fn get_tracking_number(
        &self,
        _shop_id: ShopId,
        _access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<String> {
        guard(&self.tracking)
            .get(order_sn)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("tracking number", order_sn))
    }
}
