use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, header},
    response::Redirect,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core_types::{PrincipalId, ShopId};
use crate::gateway::response::{ApiResponse, ApiResult, error_codes};
use crate::gateway::state::AppState;
use crate::store::StoreHealth;
use crate::webhook::WebhookAck;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: i64,
}

/// Liveness plus a storage round-trip
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthStatus> {
    if let Err(e) = state.core.store.ping().await {
        tracing::warn!(error = %e, "Storage health check failed");
        return Json(ApiResponse::error(error_codes::SERVICE_UNAVAILABLE, "storage unavailable"));
    }
    Json(ApiResponse::success(HealthStatus {
        status: "ok",
        timestamp: chrono::Utc::now().timestamp_millis(),
    }))
}

/// Marketplace push ingress. Always answers with the marketplace's own
/// ack shape; rejected bodies get a non-zero code.
pub async fn marketplace_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<WebhookAck> {
    let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    match state.webhook.accept(&body, authorization) {
        Ok(ack) => Json(ack),
        Err(e) => {
            tracing::warn!(error = %e, "Webhook rejected");
            Json(WebhookAck {
                code: e.business_code(),
                message: e.to_string(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthCallbackQuery {
    pub code: String,
    pub shop_id: ShopId,
    /// Owner principal id echoed back by the marketplace
    pub state: PrincipalId,
    #[serde(default)]
    pub region: Option<String>,
}

/// Exchange the authorization code, bind the shop, and send the browser back
pub async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuthCallbackQuery>,
) -> Redirect {
    let core = &state.core;
    let result = async {
        let tokens = core.api.get_access_token(q.shop_id, &q.code).await?;
        core.shops
            .bind(q.shop_id, q.state, tokens, q.region.as_deref().unwrap_or(""))
            .await
    }
    .await;

    let success = match result {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(shop_id = q.shop_id, owner_id = q.state, error = %e, "Shop authorization failed");
            false
        }
    };
    Redirect::to(&format!("{}?success={}", state.web_ui_url, success))
}
