//! `/operator` handlers

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use serde::Deserialize;
use std::sync::Arc;

use super::owner::ShipmentRequest;
use crate::core_types::{PrincipalId, ShopId};
use crate::deps::LedgerCore;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::auth::Claims;
use crate::gateway::response::{ApiResult, reply};
use crate::gateway::state::AppState;
use crate::models::ShipmentRecord;

async fn require_cooperation(core: &LedgerCore, shop_id: ShopId, operator_id: PrincipalId) -> LedgerResult<()> {
    match core.store.get_active_cooperation(shop_id).await? {
        Some(coop) if coop.operator_id == operator_id => Ok(()),
        _ => Err(LedgerError::Forbidden(format!(
            "operator {} does not serve shop {}",
            operator_id, shop_id
        ))),
    }
}

pub async fn record_shipment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
    Json(req): Json<ShipmentRequest>,
) -> ApiResult<ShipmentRecord> {
    let core = &state.core;
    let result = async {
        require_cooperation(core, shop_id, claims.user_id).await?;
        core.shipments
            .record(
                shop_id,
                &req.order_sn,
                Some(claims.user_id),
                req.goods_cost,
                req.shipping_cost,
                &req.tracking_no,
                req.self_funded,
            )
            .await
    }
    .await;
    reply(result)
}

#[derive(Debug, Deserialize)]
pub struct TrackingRequest {
    pub tracking_no: String,
}

pub async fn update_tracking(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path((shop_id, order_sn)): Path<(ShopId, String)>,
    Json(req): Json<TrackingRequest>,
) -> ApiResult<()> {
    let core = &state.core;
    let result = async {
        require_cooperation(core, shop_id, claims.user_id).await?;
        core.shipments.update_tracking(shop_id, &order_sn, &req.tracking_no).await
    }
    .await;
    reply(result)
}
