//! Upstream Marketplace
//!
//! The ledger pulls orders, escrow details and wallet movements from the
//! marketplace partner API. Calls go through [`MarketplaceApi`] so sync can
//! run against the HTTP client in production and a scripted mock in tests.
//!
//! Errors are pre-classified: `UpstreamTransient` is retried with backoff,
//! `UpstreamTerminal` (revoked or expired credentials) pauses the shop.

pub mod client;
pub mod mock;
pub mod types;

use async_trait::async_trait;

use crate::core_types::ShopId;
use crate::error::LedgerResult;
use crate::models::TokenPair;

pub use client::{HttpMarketplaceClient, classify_error, sign};
pub use mock::MockMarketplace;
pub use types::{EscrowDetail, OrderPage, UpstreamOrder, UpstreamWalletTransaction, WalletPage};

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// Exchange an authorization code from the shop-auth redirect
    async fn get_access_token(&self, shop_id: ShopId, code: &str) -> LedgerResult<TokenPair>;

    async fn refresh_token(&self, shop_id: ShopId, refresh_token: &str) -> LedgerResult<TokenPair>;

    /// Orders updated in `[time_from, time_to]`, one page
    async fn list_orders(
        &self,
        shop_id: ShopId,
        access_token: &str,
        time_from: i64,
        time_to: i64,
        cursor: Option<&str>,
        page_size: u32,
    ) -> LedgerResult<OrderPage>;

    async fn get_order_details(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sns: &[String],
    ) -> LedgerResult<Vec<UpstreamOrder>>;

    /// `None` while the marketplace has not released the escrow yet
    async fn get_escrow_detail(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<Option<EscrowDetail>>;

    /// Wallet movements created in `[time_from, time_to]`; pages start at 1
    async fn list_wallet_transactions(
        &self,
        shop_id: ShopId,
        access_token: &str,
        time_from: i64,
        time_to: i64,
        page_no: u32,
        page_size: u32,
    ) -> LedgerResult<WalletPage>;

    async fn get_tracking_number(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<String>;
}
