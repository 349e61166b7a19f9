//! `/platform` handlers: audits, configuration, operations

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{AuditBody, PageQuery};
use crate::account::{Account, AccountKind, JournalEntry, JournalFilter, TxType};
use crate::core_types::{PLATFORM_PRINCIPAL_ID, PrincipalId, Role, ShopId};
use crate::error::LedgerError;
use crate::funding::{RechargeApplication, WithdrawApplication, WithdrawStatus};
use crate::gateway::auth::Claims;
use crate::gateway::response::{ApiResponse, ApiResult, error_codes, reply};
use crate::gateway::state::AppState;
use crate::models::{Principal, ProfitShareConfig, Settlement};
use crate::settlement::SettleOutcome;
use crate::sync::{SyncOutcome, SyncRecord, SyncType};
use crate::webhook::EventLogEntry;

// --- withdraws ---

#[derive(Debug, Deserialize)]
pub struct WithdrawListQuery {
    #[serde(default)]
    pub status: Option<WithdrawStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_withdraws(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WithdrawListQuery>,
) -> ApiResult<Vec<WithdrawApplication>> {
    reply(state.core.withdraws.list(q.status, q.limit.unwrap_or(100)).await)
}

pub async fn approve_withdraw(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(body): Json<AuditBody>,
) -> ApiResult<WithdrawApplication> {
    reply(state.core.withdraws.approve(id, claims.user_id, body.remark.as_deref()).await)
}

pub async fn reject_withdraw(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(body): Json<AuditBody>,
) -> ApiResult<WithdrawApplication> {
    reply(state.core.withdraws.reject(id, claims.user_id, body.remark.as_deref()).await)
}

pub async fn confirm_withdraw_paid(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> ApiResult<WithdrawApplication> {
    reply(state.core.withdraws.confirm_paid(id, claims.user_id).await)
}

// --- recharges ---

pub async fn approve_recharge(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(body): Json<AuditBody>,
) -> ApiResult<RechargeApplication> {
    reply(state.core.recharges.approve(id, claims.user_id, body.remark.as_deref()).await)
}

pub async fn reject_recharge(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(body): Json<AuditBody>,
) -> ApiResult<RechargeApplication> {
    reply(state.core.recharges.reject(id, claims.user_id, body.remark.as_deref()).await)
}

pub async fn complete_recharge(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> ApiResult<RechargeApplication> {
    reply(state.core.recharges.complete(id, claims.user_id).await)
}

// --- principals and configuration ---

#[derive(Debug, Deserialize)]
pub struct CreatePrincipalRequest {
    pub role: Role,
    pub username: String,
}

pub async fn create_principal(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePrincipalRequest>,
) -> ApiResult<Principal> {
    reply(state.core.directory.create(req.role, &req.username).await)
}

pub async fn disable_principal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<PrincipalId>,
) -> ApiResult<()> {
    reply(state.core.directory.disable(id).await)
}

#[derive(Debug, Deserialize)]
pub struct ProfitShareRequest {
    pub shop_id: ShopId,
    pub operator_id: PrincipalId,
    pub platform_rate: Decimal,
    pub operator_rate: Decimal,
    pub shop_owner_rate: Decimal,
}

pub async fn set_profit_share(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProfitShareRequest>,
) -> ApiResult<ProfitShareConfig> {
    reply(
        state
            .core
            .cooperation
            .set_profit_share(
                req.shop_id,
                req.operator_id,
                req.platform_rate,
                req.operator_rate,
                req.shop_owner_rate,
            )
            .await,
    )
}

// --- settlement ---

#[derive(Debug, Serialize)]
pub struct SettleView {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub async fn settle_now(
    State(state): State<Arc<AppState>>,
    Path((shop_id, order_sn)): Path<(ShopId, String)>,
) -> ApiResult<SettleView> {
    let view = match state.core.settlement.settle(shop_id, &order_sn).await {
        Ok(SettleOutcome::AlreadySettling) => {
            return Json(ApiResponse::error(
                error_codes::ALREADY_SETTLING,
                "settlement already in progress, try later",
            ));
        }
        Ok(SettleOutcome::Completed(s)) => Ok(SettleView {
            outcome: "completed",
            settlement: Some(s),
            reason: None,
        }),
        Ok(SettleOutcome::AlreadyCompleted) => Ok(SettleView {
            outcome: "already_completed",
            settlement: None,
            reason: None,
        }),
        Ok(SettleOutcome::Pending(reason)) => Ok(SettleView {
            outcome: "pending",
            settlement: None,
            reason: Some(reason),
        }),
        Err(e) => Err(e),
    };
    reply(view)
}

// --- sync operations ---

fn parse_sync_type(raw: &str) -> Result<SyncType, LedgerError> {
    SyncType::from_str(raw).map_err(LedgerError::Validation)
}

pub async fn reset_sync(
    State(state): State<Arc<AppState>>,
    Path((shop_id, sync_type)): Path<(ShopId, String)>,
) -> ApiResult<SyncRecord> {
    let result = match parse_sync_type(&sync_type) {
        Ok(t) => state.core.sync.reset(shop_id, t).await,
        Err(e) => Err(e),
    };
    reply(result)
}

#[derive(Debug, Serialize)]
pub struct SyncRunView {
    pub outcome: &'static str,
    pub synced: i64,
}

pub async fn run_sync(
    State(state): State<Arc<AppState>>,
    Path((shop_id, sync_type)): Path<(ShopId, String)>,
) -> ApiResult<SyncRunView> {
    let sync_type = match parse_sync_type(&sync_type) {
        Ok(t) => t,
        Err(e) => return reply(Err(e)),
    };
    let cancel = CancellationToken::new();
    let view = match state.core.sync.run_pass(shop_id, sync_type, &cancel).await {
        Ok(SyncOutcome::AlreadySyncing) => {
            return Json(ApiResponse::error(
                error_codes::ALREADY_SYNCING,
                "sync already running, try later",
            ));
        }
        Ok(SyncOutcome::Completed { synced }) => Ok(SyncRunView {
            outcome: "completed",
            synced,
        }),
        Ok(SyncOutcome::NotEnabled) => Ok(SyncRunView {
            outcome: "not_enabled",
            synced: 0,
        }),
        Err(e) => Err(e),
    };
    reply(view)
}

// --- cross-tenant reads ---

pub async fn platform_accounts(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Account>> {
    reply(state.core.registry.balances(PLATFORM_PRINCIPAL_ID).await)
}

#[derive(Debug, Deserialize)]
pub struct JournalQuery {
    #[serde(default)]
    pub kind: Option<AccountKind>,
    #[serde(default)]
    pub principal_id: Option<PrincipalId>,
    #[serde(default)]
    pub tx_type: Option<TxType>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub async fn list_all_transactions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JournalQuery>,
) -> ApiResult<Vec<JournalEntry>> {
    let (offset, limit) = PageQuery {
        page: q.page,
        page_size: q.page_size,
    }
    .window();
    let filter = JournalFilter {
        kind: q.kind,
        principal_id: q.principal_id,
        tx_type: q.tx_type,
    };
    reply(state.core.registry.list_transactions_all(&filter, offset, limit).await)
}

#[derive(Debug, Deserialize)]
pub struct EventLogQuery {
    #[serde(default)]
    pub shop_id: Option<ShopId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_event_logs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventLogQuery>,
) -> ApiResult<Vec<EventLogEntry>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    reply(state.core.store.list_event_logs(q.shop_id, limit).await)
}
