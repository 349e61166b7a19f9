//! Handlers shared by every authenticated role

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use super::PageQuery;
use crate::account::{Account, AccountKind, JournalEntry};
use crate::error::LedgerError;
use crate::funding::WithdrawApplication;
use crate::gateway::auth::Claims;
use crate::gateway::response::{ApiResult, reply};
use crate::gateway::state::AppState;
use crate::models::CollectionAccount;

pub async fn get_accounts(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Vec<Account>> {
    reply(state.core.registry.balances(claims.user_id).await)
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    #[serde(default)]
    pub kind: Option<AccountKind>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Query(q): Query<TransactionQuery>,
) -> ApiResult<Vec<JournalEntry>> {
    let (offset, limit) = PageQuery {
        page: q.page,
        page_size: q.page_size,
    }
    .window();
    reply(
        state
            .core
            .registry
            .list_transactions(q.kind, claims.user_id, offset, limit)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct CollectionAccountRequest {
    pub channel: String,
    pub account_no: String,
    #[serde(default)]
    pub holder_name: String,
}

pub async fn add_collection_account(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CollectionAccountRequest>,
) -> ApiResult<CollectionAccount> {
    reply(
        state
            .core
            .directory
            .add_collection_account(claims.user_id, &req.channel, &req.account_no, &req.holder_name)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub kind: AccountKind,
    pub amount: Decimal,
    pub collection_account_id: i64,
    #[serde(default)]
    pub remark: String,
}

pub async fn submit_withdraw(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<WithdrawApplication> {
    reply(
        state
            .core
            .withdraws
            .submit(claims.user_id, req.kind, req.amount, req.collection_account_id, &req.remark)
            .await,
    )
}

pub async fn get_withdraw(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> ApiResult<WithdrawApplication> {
    let result = state.core.withdraws.get(id).await.and_then(|app| {
        if app.principal_id == claims.user_id {
            Ok(app)
        } else {
            Err(LedgerError::not_found("withdraw application", id))
        }
    });
    reply(result)
}
