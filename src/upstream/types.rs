use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order as reported by the marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOrder {
    pub order_sn: String,
    pub order_status: String,
    #[serde(default)]
    pub total_amount: Decimal,
    #[serde(default)]
    pub currency: String,
    pub update_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPage {
    pub orders: Vec<UpstreamOrder>,
    pub more: bool,
    /// Opaque marker for the next page, when `more`
    pub next_cursor: Option<String>,
}

/// Per-order income breakdown after marketplace fees
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowDetail {
    pub order_sn: String,
    pub seller_receive_amount: Decimal,
    pub commission_fee: Decimal,
    pub service_fee: Decimal,
    /// Full upstream body, kept verbatim
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamWalletTransaction {
    pub transaction_id: i64,
    #[serde(default)]
    pub order_sn: Option<String>,
    #[serde(default)]
    pub transaction_type: String,
    pub amount: Decimal,
    pub create_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletPage {
    pub transactions: Vec<UpstreamWalletTransaction>,
    pub more: bool,
}
