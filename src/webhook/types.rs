use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_types::ShopId;

/// Inbound push payload, bit-exact with the marketplace format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub code: i32,
    pub shop_id: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Acknowledgement body returned to the marketplace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub code: i32,
    pub message: String,
}

impl WebhookAck {
    pub fn received() -> Self {
        Self {
            code: 0,
            message: "received".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    ShopAuth,
    OrderStatus,
    TrackingUpdate,
    OrderCancel,
    BannedItem,
    PromotionUpdate,
    ReservedStock,
}

impl EventCode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(EventCode::ShopAuth),
            3 => Some(EventCode::OrderStatus),
            4 => Some(EventCode::TrackingUpdate),
            5 => Some(EventCode::OrderCancel),
            6 => Some(EventCode::BannedItem),
            7 => Some(EventCode::PromotionUpdate),
            8 => Some(EventCode::ReservedStock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCode::ShopAuth => "shop_auth",
            EventCode::OrderStatus => "order_status",
            EventCode::TrackingUpdate => "tracking_update",
            EventCode::OrderCancel => "order_cancel",
            EventCode::BannedItem => "banned_item",
            EventCode::PromotionUpdate => "promotion_update",
            EventCode::ReservedStock => "reserved_stock",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Closed DTOs per event kind. Unknown fields are dropped here and only
// survive in the event-log `raw` column.

#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatusData {
    pub ordersn: String,
    pub status: String,
    #[serde(default)]
    pub update_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingData {
    pub ordersn: String,
    pub tracking_no: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderCancelData {
    pub ordersn: String,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopAuthData {
    #[serde(default)]
    pub success: Option<i32>,
    #[serde(default)]
    pub extra: Option<String>,
}

/// Extract the order serial when the event carries one
pub fn order_sn_of(data: &serde_json::Value) -> Option<String> {
    data.get("ordersn")
        .or_else(|| data.get("order_sn"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// How an event was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Recorded,
    Duplicate,
    Ignored,
    Flagged,
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Recorded => "recorded",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Flagged => "flagged",
            EventOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub shop_id: ShopId,
    pub code: i32,
    pub order_sn: Option<String>,
    pub upstream_timestamp: i64,
    pub outcome: EventOutcome,
    pub detail: Option<String>,
    pub raw: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decodes_with_unknown_fields() {
        let raw = r#"{"code":3,"shop_id":123,"timestamp":1700000000,
            "data":{"ordersn":"A1","status":"COMPLETED","extra_field":{"x":1}}}"#;
        let payload: WebhookPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(EventCode::from_code(payload.code), Some(EventCode::OrderStatus));
        let data: OrderStatusData = serde_json::from_value(payload.data.clone()).unwrap();
        assert_eq!(data.ordersn, "A1");
        assert_eq!(order_sn_of(&payload.data).as_deref(), Some("A1"));
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(EventCode::from_code(2), None);
        assert_eq!(EventCode::from_code(99), None);
    }

    #[test]
    fn test_ack_body() {
        let body = serde_json::to_string(&WebhookAck::received()).unwrap();
        assert_eq!(body, r#"{"code":0,"message":"received"}"#);
    }
}
