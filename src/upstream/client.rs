//! Signed partner API client (REST, no SDK)

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

use super::MarketplaceApi;
use super::types::{EscrowDetail, OrderPage, UpstreamOrder, UpstreamWalletTransaction, WalletPage};
use crate::config::UpstreamConfig;
use crate::core_types::ShopId;
use crate::error::{LedgerError, LedgerResult};
use crate::models::TokenPair;

const PATH_TOKEN_GET: &str = "/api/v2/auth/token/get";
const PATH_TOKEN_REFRESH: &str = "/api/v2/auth/access_token/get";
const PATH_ORDER_LIST: &str = "/api/v2/order/get_order_list";
const PATH_ORDER_DETAIL: &str = "/api/v2/order/get_order_detail";
const PATH_ESCROW_DETAIL: &str = "/api/v2/payment/get_escrow_detail";
const PATH_WALLET_LIST: &str = "/api/v2/payment/get_wallet_transaction_list";
const PATH_TRACKING: &str = "/api/v2/logistics/get_tracking_number";

/// `hex(HMAC_SHA256(partner_key, partner_id + path + timestamp [+ access_token + shop_id]))`
pub fn sign(
    partner_key: &str,
    partner_id: i64,
    path: &str,
    timestamp: i64,
    shop: Option<(ShopId, &str)>,
) -> LedgerResult<String> {
    let mut base = format!("{partner_id}{path}{timestamp}");
    if let Some((shop_id, access_token)) = shop {
        base.push_str(access_token);
        base.push_str(&shop_id.to_string());
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(partner_key.as_bytes())
        .map_err(|e| LedgerError::Internal(format!("HMAC key error: {e}")))?;
    mac.update(base.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Map an upstream reply to an error, or `None` on success
pub fn classify_error(http_status: u16, error: &str, message: &str) -> Option<LedgerError> {
    let detail = || format!("[{http_status}] {error}: {message}");
    if http_status == 429 {
        return Some(LedgerError::UpstreamTransient(detail()));
    }
    match error {
        "" if (200..300).contains(&http_status) => None,
        "error_auth" | "invalid_access_token" | "invalid_refresh_token" | "error_permission" => {
            Some(LedgerError::UpstreamTerminal(detail()))
        }
        _ => Some(LedgerError::UpstreamTransient(detail())),
    }
}

fn malformed(path: &str, what: &str) -> LedgerError {
    LedgerError::UpstreamTransient(format!("{path}: malformed response, missing {what}"))
}

fn decimal_at(v: &Value, key: &str) -> Option<Decimal> {
    v.get(key).and_then(|x| serde_json::from_value(x.clone()).ok())
}

fn token_pair(path: &str, body: &Value) -> LedgerResult<TokenPair> {
    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| malformed(path, "access_token"))?;
    let refresh_token = body["refresh_token"]
        .as_str()
        .ok_or_else(|| malformed(path, "refresh_token"))?;
    let expire_in = body["expire_in"].as_i64().unwrap_or(4 * 3600);
    Ok(TokenPair {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.to_string(),
        expire_at: Utc::now() + chrono::Duration::seconds(expire_in),
    })
}

/// No `order_income` block means the escrow is not released yet
fn escrow_from_response(order_sn: &str, response: &Value) -> LedgerResult<Option<EscrowDetail>> {
    let income = &response["order_income"];
    if !income.is_object() {
        return Ok(None);
    }
    let seller_receive_amount =
        decimal_at(income, "escrow_amount").ok_or_else(|| malformed(PATH_ESCROW_DETAIL, "escrow_amount"))?;
    Ok(Some(EscrowDetail {
        order_sn: order_sn.to_string(),
        seller_receive_amount,
        commission_fee: decimal_at(income, "commission_fee").unwrap_or_default(),
        service_fee: decimal_at(income, "service_fee").unwrap_or_default(),
        raw: response.clone(),
    }))
}

pub struct HttpMarketplaceClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpMarketplaceClient {
    pub fn new(config: UpstreamConfig) -> LedgerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| LedgerError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    async fn call(
        &self,
        path: &str,
        shop: Option<(ShopId, &str)>,
        query: Vec<(&'static str, String)>,
        body: Option<Value>,
    ) -> LedgerResult<Value> {
        let timestamp = Utc::now().timestamp();
        let signature = sign(&self.config.partner_key, self.config.partner_id, path, timestamp, shop)?;

        let mut params: Vec<(&str, String)> = vec![
            ("partner_id", self.config.partner_id.to_string()),
            ("timestamp", timestamp.to_string()),
            ("sign", signature),
        ];
        if let Some((shop_id, access_token)) = shop {
            params.push(("shop_id", shop_id.to_string()));
            params.push(("access_token", access_token.to_string()));
        }
        params.extend(query);

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let request = match body {
            Some(body) => self.http.post(&url).query(&params).json(&body),
            None => self.http.get(&url).query(&params),
        };
        let resp = request
            .send()
            .await
            .map_err(|e| LedgerError::UpstreamTransient(format!("{path}: {e}")))?;

        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or_default();
        let error = body["error"].as_str().unwrap_or_default();
        let message = body["message"].as_str().unwrap_or_default();
        if let Some(e) = classify_error(status, error, message) {
            tracing::debug!(path, status, error, message, "Upstream call failed");
            return Err(e);
        }
        Ok(body)
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceClient {
    async fn get_access_token(&self, shop_id: ShopId, code: &str) -> LedgerResult<TokenPair> {
        let body = serde_json::json!({
            "code": code,
            "shop_id": shop_id,
            "partner_id": self.config.partner_id,
        });
        let resp = self.call(PATH_TOKEN_GET, None, Vec::new(), Some(body)).await?;
        token_pair(PATH_TOKEN_GET, &resp)
    }

    async fn refresh_token(&self, shop_id: ShopId, refresh_token: &str) -> LedgerResult<TokenPair> {
        let body = serde_json::json!({
            "refresh_token": refresh_token,
            "shop_id": shop_id,
            "partner_id": self.config.partner_id,
        });
        let resp = self.call(PATH_TOKEN_REFRESH, None, Vec::new(), Some(body)).await?;
        token_pair(PATH_TOKEN_REFRESH, &resp)
    }

    async fn list_orders(
        &self,
        shop_id: ShopId,
        access_token: &str,
        time_from: i64,
        time_to: i64,
        cursor: Option<&str>,
        page_size: u32,
    ) -> LedgerResult<OrderPage> {
        let query = vec![
            ("time_range_field", "update_time".to_string()),
            ("time_from", time_from.to_string()),
            ("time_to", time_to.to_string()),
            ("page_size", page_size.to_string()),
            ("cursor", cursor.unwrap_or_default().to_string()),
        ];
        let resp = self
            .call(PATH_ORDER_LIST, Some((shop_id, access_token)), query, None)
            .await?;
        let response = &resp["response"];

        let order_sns: Vec<String> = response["order_list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|o| o["order_sn"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let more = response["more"].as_bool().unwrap_or(false);
        let next_cursor = response["next_cursor"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let orders = if order_sns.is_empty() {
            Vec::new()
        } else {
            self.get_order_details(shop_id, access_token, &order_sns).await?
        };
        Ok(OrderPage {
            orders,
            more,
            next_cursor,
        })
    }

    async fn get_order_details(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sns: &[String],
    ) -> LedgerResult<Vec<UpstreamOrder>> {
        let query = vec![("order_sn_list", order_sns.join(","))];
        let resp = self
            .call(PATH_ORDER_DETAIL, Some((shop_id, access_token)), query, None)
            .await?;
        let list = resp["response"]["order_list"].clone();
        serde_json::from_value(list).map_err(|e| malformed(PATH_ORDER_DETAIL, &e.to_string()))
    }

    async fn get_escrow_detail(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<Option<EscrowDetail>> {
        let query = vec![("order_sn", order_sn.to_string())];
        let resp = self
            .call(PATH_ESCROW_DETAIL, Some((shop_id, access_token)), query, None)
            .await?;
        escrow_from_response(order_sn, &resp["response"])
    }

    async fn list_wallet_transactions(
        &self,
        shop_id: ShopId,
        access_token: &str,
        time_from: i64,
        time_to: i64,
        page_no: u32,
        page_size: u32,
    ) -> LedgerResult<WalletPage> {
        let query = vec![
            ("page_no", page_no.to_string()),
            ("page_size", page_size.to_string()),
            ("create_time_from", time_from.to_string()),
            ("create_time_to", time_to.to_string()),
        ];
        let resp = self
            .call(PATH_WALLET_LIST, Some((shop_id, access_token)), query, None)
            .await?;
        let response = &resp["response"];
        let transactions: Vec<UpstreamWalletTransaction> =
            serde_json::from_value(response["transaction_list"].clone())
                .map_err(|e| malformed(PATH_WALLET_LIST, &e.to_string()))?;
        Ok(WalletPage {
            transactions,
            more: response["more"].as_bool().unwrap_or(false),
        })
    }

    async fn get_tracking_number(
        &self,
        shop_id: ShopId,
        access_token: &str,
        order_sn: &str,
    ) -> LedgerResult<String> {
        let query = vec![("order_sn", order_sn.to_string())];
        let resp = self
            .call(PATH_TRACKING, Some((shop_id, access_token)), query, None)
            .await?;
        resp["response"]["tracking_number"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| malformed(PATH_TRACKING, "tracking_number"))
    }
}
