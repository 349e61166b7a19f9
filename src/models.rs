//! Principals, shops and the order-side records the ledger settles against.
//!
//! Everything here is addressed by id; there are no back-pointers between
//! shops, principals and accounts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{OrderSn, PrincipalId, PrincipalStatus, Role, ShopId};
use crate::money::checked_rate;

pub const ORDER_STATUS_COMPLETED: &str = "COMPLETED";
pub const ORDER_STATUS_CANCELLED: &str = "CANCELLED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub role: Role,
    pub username: String,
    pub status: PrincipalStatus,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn is_active(&self) -> bool {
        self.status == PrincipalStatus::Active
    }
}

/// Payee bank card or wallet a withdrawal is paid to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionAccount {
    pub id: i64,
    pub principal_id: PrincipalId,
    pub channel: String,
    pub account_no: String,
    pub holder_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopStatus {
    Unbound = 0,
    Bound = 1,
    TokenExpired = 2,
    Deleted = 3,
}

impl From<i16> for ShopStatus {
    fn from(v: i16) -> Self {
        match v {
            1 => ShopStatus::Bound,
            2 => ShopStatus::TokenExpired,
            3 => ShopStatus::Deleted,
            _ => ShopStatus::Unbound,
        }
    }
}

/// Opaque upstream credentials held per shop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub shop_id: ShopId,
    pub owner_id: Option<PrincipalId>,
    pub status: ShopStatus,
    #[serde(skip_serializing)]
    pub tokens: Option<TokenPair>,
    pub region: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooperationStatus {
    Released = 0,
    Active = 1,
}

impl From<i16> for CooperationStatus {
    fn from(v: i16) -> Self {
        match v {
            1 => CooperationStatus::Active,
            _ => CooperationStatus::Released,
        }
    }
}

/// Shop to fulfilment-operator relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cooperation {
    pub id: i64,
    pub shop_id: ShopId,
    pub operator_id: PrincipalId,
    pub status: CooperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Three percentages that sum to exactly 100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRates {
    pub platform: Decimal,
    pub operator: Decimal,
    pub shop_owner: Decimal,
}

impl ShareRates {
    pub fn new(platform: Decimal, operator: Decimal, shop_owner: Decimal) -> Result<Self, String> {
        let rates = Self {
            platform: checked_rate(platform).map_err(|e| e.to_string())?,
            operator: checked_rate(operator).map_err(|e| e.to_string())?,
            shop_owner: checked_rate(shop_owner).map_err(|e| e.to_string())?,
        };
        let sum = rates.platform + rates.operator + rates.shop_owner;
        if sum != Decimal::ONE_HUNDRED {
            return Err(format!("rates must sum to 100, got {}", sum));
        }
        Ok(rates)
    }
}

impl Default for ShareRates {
    fn default() -> Self {
        Self {
            platform: Decimal::from(5),
            operator: Decimal::from(45),
            shop_owner: Decimal::from(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitShareConfig {
    pub shop_id: ShopId,
    pub operator_id: PrincipalId,
    pub rates: ShareRates,
    pub updated_at: DateTime<Utc>,
}

/// Upstream order, lifted verbatim plus local augmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
    pub status: String,
    /// When set, upstream status changes are recorded but not applied
    pub local_status_lock: Option<String>,
    pub total_amount: Decimal,
    pub currency: String,
    pub upstream_update_time: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl Order {
    /// Status that settlement and reporting should act on
    pub fn effective_status(&self) -> &str {
        self.local_status_lock.as_deref().unwrap_or(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.effective_status() == ORDER_STATUS_COMPLETED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    ShippedPendingSettle = 1,
    Settled = 2,
    Cancelled = 3,
}

impl ShipmentStatus {
    pub fn from_id(v: i16) -> Option<Self> {
        match v {
            1 => Some(ShipmentStatus::ShippedPendingSettle),
            2 => Some(ShipmentStatus::Settled),
            3 => Some(ShipmentStatus::Cancelled),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub id: i64,
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
    /// `None` when the shop owner shipped it personally
    pub operator_id: Option<PrincipalId>,
    pub goods_cost: Decimal,
    pub shipping_cost: Decimal,
    pub tracking_no: String,
    /// Operator paid the goods out of pocket; no prepayment debit on settle
    pub self_funded: bool,
    pub status: ShipmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ShipmentRecord {
    pub fn total_cost(&self) -> Decimal {
        self.goods_cost + self.shipping_cost
    }
}

/// Marketplace's authoritative income breakdown for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
    pub seller_receive_amount: Decimal,
    pub commission_fee: Decimal,
    pub service_fee: Decimal,
    pub raw: serde_json::Value,
    pub synced_at: DateTime<Utc>,
}

/// Shop wallet movement pulled by the income sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub shop_id: ShopId,
    pub transaction_id: i64,
    pub order_sn: Option<OrderSn>,
    pub transaction_type: String,
    pub amount: Decimal,
    pub create_time: i64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending = 0,
    Completed = 1,
    Failed = 2,
}

impl From<i16> for SettlementStatus {
    fn from(v: i16) -> Self {
        match v {
            1 => SettlementStatus::Completed,
            2 => SettlementStatus::Failed,
            _ => SettlementStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub shop_id: ShopId,
    pub order_sn: OrderSn,
    pub operator_id: Option<PrincipalId>,
    pub shop_owner_id: Option<PrincipalId>,
    pub gross: Decimal,
    pub cost: Decimal,
    pub net: Decimal,
    pub platform_share: Decimal,
    pub operator_share: Decimal,
    pub shop_owner_share: Decimal,
    pub status: SettlementStatus,
    pub journal_posted: bool,
    /// Raised when the order was cancelled after completion
    pub needs_adjustment: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    pub fn is_completed(&self) -> bool {
        self.status == SettlementStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_share_rates_must_sum_to_100() {
        let d = |s: &str| Decimal::from_str(s).unwrap();
        assert!(ShareRates::new(d("5"), d("45"), d("50")).is_ok());
        assert!(ShareRates::new(d("10.25"), d("40.25"), d("49.50")).is_ok());
        assert!(ShareRates::new(d("5"), d("45"), d("49.99")).is_err());
        assert!(ShareRates::new(d("5.001"), d("45"), d("49.999")).is_err());
        assert!(ShareRates::new(d("-5"), d("55"), d("50")).is_err());
    }

    #[test]
    fn test_local_status_lock_overrides() {
        let now = Utc::now();
        let mut order = Order {
            shop_id: 1,
            order_sn: "A1".into(),
            status: "SHIPPED".into(),
            local_status_lock: None,
            total_amount: Decimal::ZERO,
            currency: "USD".into(),
            upstream_update_time: 0,
            first_seen_at: now,
            last_synced_at: now,
        };
        assert!(!order.is_completed());
        order.local_status_lock = Some(ORDER_STATUS_COMPLETED.into());
        assert!(order.is_completed());
    }
}
