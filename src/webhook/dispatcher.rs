//! Webhook Dispatcher
//!
//! Drains the ingress queue. Each event is deduplicated on
//! `(shop_id, code, order_sn, timestamp)` through a `set_nx` marker that
//! expires after the dedupe window, handled by kind, and logged with its
//! outcome whatever that outcome is. A failed event releases its marker so
//! the upstream redelivery is handled again.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ingress::InboundEvent;
use super::types::{
    EventCode, EventLogEntry, EventOutcome, OrderCancelData, OrderStatusData, ShopAuthData,
    TrackingData, order_sn_of,
};
use crate::coord::CoordinationStore;
use crate::core_types::ShopId;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{ORDER_STATUS_CANCELLED, ShipmentStatus};
use crate::store::Store;
use crate::sync::EscrowRequest;

pub fn dedupe_key(shop_id: ShopId, code: i32, order_sn: Option<&str>, timestamp: i64) -> String {
    format!("webhook:{}:{}:{}:{}", shop_id, code, order_sn.unwrap_or("-"), timestamp)
}

pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    coord: Arc<dyn CoordinationStore>,
    escrow_tx: Option<mpsc::Sender<EscrowRequest>>,
    dedupe_window: Duration,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn Store>, coord: Arc<dyn CoordinationStore>, dedupe_window: Duration) -> Self {
        Self {
            store,
            coord,
            escrow_tx: None,
            dedupe_window,
        }
    }

    /// Completed orders are pushed here for an immediate escrow fetch
    pub fn with_escrow_queue(mut self, tx: mpsc::Sender<EscrowRequest>) -> Self {
        self.escrow_tx = Some(tx);
        self
    }

    pub async fn run(self, mut rx: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
        tracing::info!("Starting webhook dispatcher");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(&event).await {
                tracing::error!(shop_id = event.payload.shop_id, code = event.payload.code, error = %e, "Webhook dispatch failed");
            }
        }
        tracing::info!("Webhook dispatcher stopped");
    }

    /// Handle one event and write its log row
    pub async fn dispatch(&self, event: &InboundEvent) -> LedgerResult<EventOutcome> {
        let p = &event.payload;
        let shop_id = ShopId::try_from(p.shop_id)
            .map_err(|_| LedgerError::Validation(format!("shop_id out of range: {}", p.shop_id)))?;
        let order_sn = order_sn_of(&p.data);

        let key = dedupe_key(shop_id, p.code, order_sn.as_deref(), p.timestamp);
        let token = uuid::Uuid::new_v4().to_string();
        let (outcome, detail) = match self.coord.set_nx(&key, &token, self.dedupe_window).await {
            Ok(false) => (EventOutcome::Duplicate, None),
            Ok(true) => {
                let handled = match EventCode::from_code(p.code) {
                    None => (EventOutcome::Ignored, Some(format!("unknown code {}", p.code))),
                    Some(code) => match self.handle(shop_id, code, &p.data).await {
                        Ok(r) => r,
                        Err(e) => (EventOutcome::Failed, Some(e.to_string())),
                    },
                };
                if handled.0 == EventOutcome::Failed
                    && let Err(e) = self.coord.compare_and_delete(&key, &token).await
                {
                    tracing::warn!(key = %key, error = %e, "Failed to release webhook dedupe marker");
                }
                handled
            }
            Err(e) => (EventOutcome::Failed, Some(format!("dedupe check failed: {}", e))),
        };

        tracing::info!(
            shop_id,
            code = p.code,
            order_sn = order_sn.as_deref().unwrap_or("-"),
            outcome = outcome.as_str(),
            "Webhook handled"
        );
        let entry = EventLogEntry {
            id: 0,
            shop_id,
            code: p.code,
            order_sn,
            upstream_timestamp: p.timestamp,
            outcome,
            detail,
            raw: event.raw.clone(),
            created_at: Utc::now(),
        };
        self.store.insert_event_log(&entry).await?;
        Ok(outcome)
    }

    async fn handle(
        &self,
        shop_id: ShopId,
        code: EventCode,
        data: &serde_json::Value,
    ) -> LedgerResult<(EventOutcome, Option<String>)> {
        match code {
            EventCode::OrderStatus => self.on_order_status(shop_id, decode(data)?).await,
            EventCode::TrackingUpdate => self.on_tracking(shop_id, decode(data)?).await,
            EventCode::OrderCancel => self.on_cancel(shop_id, decode(data)?).await,
            EventCode::ShopAuth => Ok(on_shop_auth(shop_id, decode(data)?)),
            EventCode::BannedItem
            | EventCode::PromotionUpdate
            | EventCode::ReservedStock => Ok((EventOutcome::Recorded, None)),
        }
    }

    async fn on_order_status(
        &self,
        shop_id: ShopId,
        data: OrderStatusData,
    ) -> LedgerResult<(EventOutcome, Option<String>)> {
        let Some(mut order) = self.store.get_order(shop_id, &data.ordersn).await? else {
            // the next orders pass creates it
            return Ok((EventOutcome::Recorded, Some("order not synced yet".into())));
        };
        if let Some(ts) = data.update_time
            && ts < order.upstream_update_time
        {
            return Ok((EventOutcome::Ignored, Some("stale status".into())));
        }

        order.status = data.status;
        if let Some(ts) = data.update_time {
            order.upstream_update_time = ts;
        }
        order.last_synced_at = Utc::now();
        self.store.upsert_order(&order).await?;

        if order.is_completed() {
            self.request_escrow(shop_id, &order.order_sn);
        }
        let detail = order
            .local_status_lock
            .as_ref()
            .map(|lock| format!("local status lock {} kept", lock));
        Ok((EventOutcome::Applied, detail))
    }

    async fn on_tracking(&self, shop_id: ShopId, data: TrackingData) -> LedgerResult<(EventOutcome, Option<String>)> {
        match self.store.get_shipment(shop_id, &data.ordersn).await? {
            Some(s) if s.status == ShipmentStatus::ShippedPendingSettle => {
                self.store
                    .update_shipment_tracking(shop_id, s.id, &data.tracking_no)
                    .await?;
                Ok((EventOutcome::Applied, None))
            }
            _ => Ok((EventOutcome::Recorded, Some("no open shipment".into()))),
        }
    }

    /// Cancels never reverse a completed settlement; they flag it
    async fn on_cancel(&self, shop_id: ShopId, data: OrderCancelData) -> LedgerResult<(EventOutcome, Option<String>)> {
        if let Some(mut order) = self.store.get_order(shop_id, &data.ordersn).await? {
            order.status = ORDER_STATUS_CANCELLED.to_string();
            order.last_synced_at = Utc::now();
            self.store.upsert_order(&order).await?;
        }

        if let Some(s) = self.store.get_shipment(shop_id, &data.ordersn).await?
            && s.status == ShipmentStatus::ShippedPendingSettle
        {
            self.store
                .update_shipment_status(shop_id, s.id, ShipmentStatus::ShippedPendingSettle, ShipmentStatus::Cancelled)
                .await?;
        }

        let settled = self
            .store
            .get_settlement(shop_id, &data.ordersn)
            .await?
            .is_some_and(|s| s.is_completed());
        if settled && self.store.flag_settlement_adjustment(shop_id, &data.ordersn).await? {
            tracing::warn!(shop_id, order_sn = %data.ordersn, "Cancelled order was already settled, flagged for adjustment");
            return Ok((EventOutcome::Flagged, data.cancel_reason));
        }
        Ok((EventOutcome::Applied, data.cancel_reason))
    }

    fn request_escrow(&self, shop_id: ShopId, order_sn: &str) {
        let Some(tx) = &self.escrow_tx else { return };
        let request = EscrowRequest {
            shop_id,
            order_sn: order_sn.to_string(),
        };
        // escrow sweep picks it up if the queue is full
        if let Err(e) = tx.try_send(request) {
            tracing::warn!(shop_id, order_sn, error = %e, "Escrow request dropped");
        }
    }
}

/// Binding itself goes through the auth callback; the push is only recorded
fn on_shop_auth(shop_id: ShopId, data: ShopAuthData) -> (EventOutcome, Option<String>) {
    let detail = match data.success {
        Some(1) => "authorization granted".to_string(),
        Some(other) => format!("authorization result {}", other),
        None => "authorization notice".to_string(),
    };
    tracing::info!(shop_id, detail = %detail, extra = data.extra.as_deref().unwrap_or("-"), "Shop auth push");
    (EventOutcome::Recorded, Some(detail))
}

fn decode<T: serde::de::DeserializeOwned>(data: &serde_json::Value) -> LedgerResult<T> {
    serde_json::from_value(data.clone())
        .map_err(|e| LedgerError::Validation(format!("malformed event data: {}", e)))
}
