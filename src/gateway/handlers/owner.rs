//! `/shopower` handlers

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use super::owned_shop;
use crate::account::AccountKind;
use crate::core_types::{PrincipalId, ShopId};
use crate::error::LedgerError;
use crate::funding::RechargeApplication;
use crate::gateway::auth::Claims;
use crate::gateway::response::{ApiResult, reply};
use crate::gateway::state::AppState;
use crate::models::{Cooperation, Settlement, ShipmentRecord, Shop};

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub kind: AccountKind,
    pub amount: Decimal,
    pub proof: String,
}

pub async fn submit_recharge(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RechargeRequest>,
) -> ApiResult<RechargeApplication> {
    reply(
        state
            .core
            .recharges
            .submit(claims.user_id, req.kind, req.amount, &req.proof)
            .await,
    )
}

pub async fn get_shop(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
) -> ApiResult<Shop> {
    reply(owned_shop(&state.core, shop_id, claims.user_id).await)
}

pub async fn unbind_shop(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
) -> ApiResult<()> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.shops.unbind(shop_id).await
    }
    .await;
    reply(result)
}

#[derive(Debug, Deserialize)]
pub struct AssignOperatorRequest {
    pub operator_id: PrincipalId,
}

pub async fn assign_operator(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
    Json(req): Json<AssignOperatorRequest>,
) -> ApiResult<Cooperation> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.cooperation.assign_operator(shop_id, req.operator_id).await
    }
    .await;
    reply(result)
}

pub async fn release_operator(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
) -> ApiResult<()> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.cooperation.release_operator(shop_id).await
    }
    .await;
    reply(result)
}

#[derive(Debug, Deserialize)]
pub struct ShipmentRequest {
    pub order_sn: String,
    pub goods_cost: Decimal,
    #[serde(default)]
    pub shipping_cost: Decimal,
    #[serde(default)]
    pub tracking_no: String,
    #[serde(default)]
    pub self_funded: bool,
}

/// Owner shipped the order personally
pub async fn record_shipment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(shop_id): Path<ShopId>,
    Json(req): Json<ShipmentRequest>,
) -> ApiResult<ShipmentRecord> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.shipments
            .record(
                shop_id,
                &req.order_sn,
                None,
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

pub async fn cancel_shipment(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path((shop_id, order_sn)): Path<(ShopId, String)>,
) -> ApiResult<()> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.shipments.cancel(shop_id, &order_sn).await
    }
    .await;
    reply(result)
}

pub async fn get_settlement(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path((shop_id, order_sn)): Path<(ShopId, String)>,
) -> ApiResult<Settlement> {
    let core = &state.core;
    let result = async {
        owned_shop(core, shop_id, claims.user_id).await?;
        core.store
            .get_settlement(shop_id, &order_sn)
            .await?
            .ok_or_else(|| LedgerError::not_found("settlement", format!("{}:{}", shop_id, order_sn)))
    }
    .await;
    reply(result)
}
