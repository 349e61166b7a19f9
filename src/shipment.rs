//! Fulfilment records the settlement engine consumes

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::core_types::{PrincipalId, Role, ShopId};
use crate::directory::PrincipalDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{ShipmentRecord, ShipmentStatus};
use crate::money::checked_money;
use crate::store::Store;

/// Zero is a valid cost; anything else must be a well-formed amount
fn checked_cost(value: Decimal) -> LedgerResult<Decimal> {
    if value.is_zero() {
        return Ok(Decimal::ZERO);
    }
    Ok(checked_money(value)?)
}

#[derive(Clone)]
pub struct ShipmentService {
    store: Arc<dyn Store>,
    directory: PrincipalDirectory,
}

impl ShipmentService {
    pub fn new(store: Arc<dyn Store>, directory: PrincipalDirectory) -> Self {
        Self { store, directory }
    }

    /// Record a shipment awaiting settlement. `operator_id = None` means the
    /// shop owner shipped it personally.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        shop_id: ShopId,
        order_sn: &str,
        operator_id: Option<PrincipalId>,
        goods_cost: Decimal,
        shipping_cost: Decimal,
        tracking_no: &str,
        self_funded: bool,
    ) -> LedgerResult<ShipmentRecord> {
        if order_sn.is_empty() {
            return Err(LedgerError::Validation("order_sn is required".into()));
        }
        let goods_cost = checked_cost(goods_cost)?;
        let shipping_cost = checked_cost(shipping_cost)?;
        if let Some(op) = operator_id {
            self.directory.require_active(op, Role::Operator).await?;
        }
        if self
            .store
            .get_shipment(shop_id, order_sn)
            .await?
            .is_some_and(|s| s.status != ShipmentStatus::Cancelled)
        {
            return Err(LedgerError::Conflict(format!(
                "order {}:{} already has a live shipment",
                shop_id, order_sn
            )));
        }

        let now = Utc::now();
        let mut shipment = ShipmentRecord {
            id: 0,
            shop_id,
            order_sn: order_sn.to_string(),
            operator_id,
            goods_cost,
            shipping_cost,
            tracking_no: tracking_no.to_string(),
            self_funded,
            status: ShipmentStatus::ShippedPendingSettle,
            created_at: now,
            updated_at: now,
        };
        shipment.id = self.store.insert_shipment(&shipment).await?;
        tracing::info!(shop_id, order_sn, shipment_id = shipment.id, "Shipment recorded");
        Ok(shipment)
    }

    pub async fn get(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<ShipmentRecord> {
        self.store
            .get_shipment(shop_id, order_sn)
            .await?
            .ok_or_else(|| LedgerError::not_found("shipment", format!("{}:{}", shop_id, order_sn)))
    }

    pub async fn update_tracking(
        &self,
        shop_id: ShopId,
        order_sn: &str,
        tracking_no: &str,
    ) -> LedgerResult<()> {
        let shipment = self.get(shop_id, order_sn).await?;
        self.store
            .update_shipment_tracking(shop_id, shipment.id, tracking_no)
            .await?;
        Ok(())
    }

    /// Pending shipment to cancelled; a settled shipment cannot be cancelled
    pub async fn cancel(&self, shop_id: ShopId, order_sn: &str) -> LedgerResult<()> {
        let shipment = self.get(shop_id, order_sn).await?;
        let changed = self
            .store
            .update_shipment_status(
                shop_id,
                shipment.id,
                ShipmentStatus::ShippedPendingSettle,
                ShipmentStatus::Cancelled,
            )
            .await?;
        if !changed {
            return Err(LedgerError::Conflict(format!(
                "shipment {} is not pending settlement",
                shipment.id
            )));
        }
        tracing::info!(shop_id, order_sn, shipment_id = shipment.id, "Shipment cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordStore;
    use crate::idgen::IdGenerator;
    use crate::store::MemoryStore;

    fn service() -> ShipmentService {
        let store = Arc::new(MemoryStore::new());
        let idgen = Arc::new(IdGenerator::new(Arc::new(MemoryCoordStore::new())));
        ShipmentService::new(store.clone(), PrincipalDirectory::new(store, idgen))
    }

    #[tokio::test]
    async fn test_record_and_cancel() {
        let svc = service();
        let s = svc
            .record(1, "A", None, Decimal::from(20), Decimal::ZERO, "", false)
            .await
            .unwrap();
        assert_eq!(s.status, ShipmentStatus::ShippedPendingSettle);
        assert_eq!(s.total_cost(), Decimal::from(20));

        let dup = svc
            .record(1, "A", None, Decimal::from(5), Decimal::ZERO, "", false)
            .await
            .unwrap_err();
        assert!(matches!(dup, LedgerError::Conflict(_)));

        svc.update_tracking(1, "A", "TRK1").await.unwrap();
        assert_eq!(svc.get(1, "A").await.unwrap().tracking_no, "TRK1");

        svc.cancel(1, "A").await.unwrap();
        assert!(matches!(svc.cancel(1, "A").await.unwrap_err(), LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_negative_cost_rejected() {
        let svc = service();
        let err = svc
            .record(1, "B", None, Decimal::from(-1), Decimal::ZERO, "", false)
            .await
            .unwrap_err();
        assert_eq!(err.business_code(), 1001);
    }
}
