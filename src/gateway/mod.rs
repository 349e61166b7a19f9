//! HTTP adapter
//!
//! Public routes plus three role-scoped nests, each behind
//! [`auth::jwt_role_middleware`]. Handlers only translate between JSON and
//! the core services in [`crate::deps::LedgerCore`].

pub mod auth;
pub mod handlers;
pub mod response;
pub mod state;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core_types::Role;
use handlers::{operator, owner, platform, principal, public};
use state::AppState;

/// Routes every role shares (balances, journal, withdrawals)
fn principal_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/accounts", get(principal::get_accounts))
        .route("/transactions", get(principal::list_transactions))
        .route("/collection-accounts", post(principal::add_collection_account))
        .route("/withdraws", post(principal::submit_withdraw))
        .route("/withdraws/{id}", get(principal::get_withdraw))
}

fn scoped(state: &Arc<AppState>, role: Role, routes: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    routes.layer(from_fn_with_state((state.clone(), role), auth::jwt_role_middleware))
}

pub fn router(state: Arc<AppState>) -> Router {
    let owner_routes = principal_routes()
        .route("/recharges", post(owner::submit_recharge))
        .route("/shops/{shop_id}", get(owner::get_shop))
        .route("/shops/{shop_id}/unbind", post(owner::unbind_shop))
        .route("/shops/{shop_id}/operator", post(owner::assign_operator))
        .route("/shops/{shop_id}/operator/release", post(owner::release_operator))
        .route("/shops/{shop_id}/shipments", post(owner::record_shipment))
        .route(
            "/shops/{shop_id}/shipments/{order_sn}/cancel",
            post(owner::cancel_shipment),
        )
        .route(
            "/shops/{shop_id}/settlements/{order_sn}",
            get(owner::get_settlement),
        );

    let operator_routes = principal_routes()
        .route("/shops/{shop_id}/shipments", post(operator::record_shipment))
        .route(
            "/shops/{shop_id}/shipments/{order_sn}/tracking",
            post(operator::update_tracking),
        );

    let platform_routes = Router::new()
        .route("/withdraws", get(platform::list_withdraws))
        .route("/withdraws/{id}/approve", post(platform::approve_withdraw))
        .route("/withdraws/{id}/reject", post(platform::reject_withdraw))
        .route("/withdraws/{id}/paid", post(platform::confirm_withdraw_paid))
        .route("/recharges/{id}/approve", post(platform::approve_recharge))
        .route("/recharges/{id}/reject", post(platform::reject_recharge))
        .route("/recharges/{id}/complete", post(platform::complete_recharge))
        .route("/principals", post(platform::create_principal))
        .route("/principals/{id}/disable", post(platform::disable_principal))
        .route("/profit-share", post(platform::set_profit_share))
        .route("/settlements/{shop_id}/{order_sn}", post(platform::settle_now))
        .route("/sync/{shop_id}/{sync_type}/reset", post(platform::reset_sync))
        .route("/sync/{shop_id}/{sync_type}/run", post(platform::run_sync))
        .route("/accounts", get(platform::platform_accounts))
        .route("/transactions", get(platform::list_all_transactions))
        .route("/event-logs", get(platform::list_event_logs));

    Router::new()
        .route("/health", get(public::health))
        .route("/webhook/marketplace", post(public::marketplace_webhook))
        .route("/auth/callback", get(public::auth_callback))
        .nest("/shopower", scoped(&state, Role::ShopOwner, owner_routes))
        .nest("/operator", scoped(&state, Role::Operator, operator_routes))
        .nest("/platform", scoped(&state, Role::Platform, platform_routes))
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn run_server(state: Arc<AppState>, addr: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;

    tracing::info!(addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("Gateway stopped");
    Ok(())
}
