//! HTTP surface over the in-memory core

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;

use resell_ledger::config::AppConfig;
use resell_ledger::coord::MemoryCoordStore;
use resell_ledger::core_types::{PrincipalId, Role};
use resell_ledger::deps::{Deps, LedgerCore};
use resell_ledger::gateway::{self, auth::issue_token, state::AppState};
use resell_ledger::store::MemoryStore;
use resell_ledger::store::memory::FaultPoint;
use resell_ledger::upstream::MockMarketplace;

const SECRET: &str = "gateway-test-secret";

const CONFIG: &str = r#"
log_level: info
log_dir: ./logs
log_file: test.log
use_json: false
gateway:
  host: 127.0.0.1
  port: 0
  jwt_secret: gateway-test-secret
  web_ui_url: http://ui.test/shops
upstream:
  partner_key: partner-secret
"#;

struct App {
    router: Router,
    core: Arc<LedgerCore>,
    store: Arc<MemoryStore>,
}

fn app() -> App {
    let config = AppConfig::from_yaml(CONFIG).unwrap();
    let store = Arc::new(MemoryStore::new());
    let deps = Deps {
        store: store.clone(),
        coord: Arc::new(MemoryCoordStore::new()),
        api: Arc::new(MockMarketplace::new()),
    };
    let (core, ingress, _workers) = LedgerCore::build(deps, &config).unwrap();
    let state = Arc::new(AppState::new(
        core.clone(),
        ingress,
        SECRET.to_string(),
        config.gateway.web_ui_url.clone(),
    ));
    App {
        router: gateway::router(state),
        core,
        store,
    }
}

fn token(user_id: PrincipalId, role: Role) -> String {
    issue_token(SECRET, user_id, role, 3600).unwrap()
}

async fn call(router: &Router, method: &str, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Value {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    let request = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn dec(v: &Value) -> Decimal {
    match v {
        Value::String(s) => Decimal::from_str(s).unwrap(),
        other => Decimal::from_str(&other.to_string()).unwrap(),
    }
}

fn balance_of(accounts: &Value, kind: &str) -> (Decimal, Decimal) {
    let row = accounts["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["kind"] == kind)
        .unwrap();
    (dec(&row["balance"]), dec(&row["frozen"]))
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app();
    let body = call(&app.router, "GET", "/health", None, None).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn test_health_reports_storage_outage() {
    let app = app();
    app.store.inject_fault(FaultPoint::Ping);
    let body = call(&app.router, "GET", "/health", None, None).await;
    assert_eq!(body["code"], 503);
    assert!(body.get("data").is_none());

    let body = call(&app.router, "GET", "/health", None, None).await;
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn test_role_nests_require_matching_token() {
    let app = app();
    let owner = app.core.directory.create(Role::ShopOwner, "owner").await.unwrap();

    let body = call(&app.router, "GET", "/shopower/accounts", None, None).await;
    assert_eq!(body["code"], 401);

    let body = call(&app.router, "GET", "/shopower/accounts", Some("not-a-jwt"), None).await;
    assert_eq!(body["code"], 401);

    let owner_token = token(owner.id, Role::ShopOwner);
    let body = call(&app.router, "GET", "/platform/withdraws", Some(&owner_token), None).await;
    assert_eq!(body["code"], 403);

    let body = call(&app.router, "GET", "/shopower/accounts", Some(&owner_token), None).await;
    assert_eq!(body["code"], 0);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_recharge_and_withdraw_over_http() {
    let app = app();
    let r = &app.router;
    let platform = app.core.directory.create(Role::Platform, "auditor").await.unwrap();
    let owner = app.core.directory.create(Role::ShopOwner, "owner").await.unwrap();
    let pt = token(platform.id, Role::Platform);
    let ot = token(owner.id, Role::ShopOwner);

    let recharge = call(
        r,
        "POST",
        "/shopower/recharges",
        Some(&ot),
        Some(json!({ "kind": "prepayment", "amount": "100.00", "proof": "slip-77" })),
    )
    .await;
    assert_eq!(recharge["code"], 0, "{}", recharge);
    let rid = recharge["data"]["id"].as_i64().unwrap();

    let approved = call(r, "POST", &format!("/platform/recharges/{}/approve", rid), Some(&pt), Some(json!({}))).await;
    assert_eq!(approved["code"], 0, "{}", approved);

    let accounts = call(r, "GET", "/shopower/accounts", Some(&ot), None).await;
    assert_eq!(balance_of(&accounts, "prepayment"), (Decimal::from(100), Decimal::ZERO));

    let card = call(
        r,
        "POST",
        "/shopower/collection-accounts",
        Some(&ot),
        Some(json!({ "channel": "bank", "account_no": "6222", "holder_name": "Owner" })),
    )
    .await;
    let card_id = card["data"]["id"].as_i64().unwrap();

    let withdraw = call(
        r,
        "POST",
        "/shopower/withdraws",
        Some(&ot),
        Some(json!({ "kind": "prepayment", "amount": "50.00", "collection_account_id": card_id })),
    )
    .await;
    assert_eq!(withdraw["code"], 0, "{}", withdraw);
    let wid = withdraw["data"]["id"].as_i64().unwrap();

    let accounts = call(r, "GET", "/shopower/accounts", Some(&ot), None).await;
    assert_eq!(balance_of(&accounts, "prepayment"), (Decimal::from(100), Decimal::from(50)));

    let pending = call(r, "GET", "/platform/withdraws?status=pending", Some(&pt), None).await;
    assert_eq!(pending["data"].as_array().unwrap().len(), 1);

    let body = call(r, "POST", &format!("/platform/withdraws/{}/approve", wid), Some(&pt), Some(json!({ "remark": "ok" }))).await;
    assert_eq!(body["code"], 0);
    let body = call(r, "POST", &format!("/platform/withdraws/{}/paid", wid), Some(&pt), None).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["status"], "paid");

    // a second audit is a business error inside a 200 envelope
    let body = call(r, "POST", &format!("/platform/withdraws/{}/reject", wid), Some(&pt), Some(json!({}))).await;
    assert_eq!(body["code"], 1101);

    let accounts = call(r, "GET", "/shopower/accounts", Some(&ot), None).await;
    assert_eq!(balance_of(&accounts, "prepayment"), (Decimal::from(50), Decimal::ZERO));

    let journal = call(r, "GET", "/shopower/transactions?kind=prepayment", Some(&ot), None).await;
    let types: Vec<&str> = journal["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["tx_type"].as_str().unwrap())
        .collect();
    // newest first
    assert_eq!(types, vec!["withdraw", "freeze", "recharge"]);
}

#[tokio::test]
async fn test_overdraw_is_reported_not_raised() {
    let app = app();
    let owner = app.core.directory.create(Role::ShopOwner, "owner").await.unwrap();
    let ot = token(owner.id, Role::ShopOwner);
    let card = app
        .core
        .directory
        .add_collection_account(owner.id, "bank", "1", "o")
        .await
        .unwrap();

    let body = call(
        &app.router,
        "POST",
        "/shopower/withdraws",
        Some(&ot),
        Some(json!({ "kind": "prepayment", "amount": "10", "collection_account_id": card.id })),
    )
    .await;
    assert_eq!(body["code"], 1200);
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_webhook_signature_checked() {
    let app = app();
    let payload = json!({ "code": 3, "shop_id": 9, "timestamp": 1, "data": { "ordersn": "A" } }).to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/webhook/marketplace")
        .header(header::AUTHORIZATION, "deadbeef")
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let ack: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(ack["code"], 403);

    let signature = {
        use hmac::{Hmac, Mac};
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"partner-secret").unwrap();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    };
    let request = Request::builder()
        .method("POST")
        .uri("/webhook/marketplace")
        .header(header::AUTHORIZATION, signature)
        .body(Body::from(payload))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let ack: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(ack["code"], 0);
    assert_eq!(ack["message"], "received");
}

#[tokio::test]
async fn test_auth_callback_binds_and_redirects() {
    let app = app();
    let owner = app.core.directory.create(Role::ShopOwner, "owner").await.unwrap();

    let uri = format!("/auth/callback?code=abc&shop_id=9&state={}&region=SG", owner.id);
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://ui.test/shops?success=true"
    );
    let shop = app.core.shops.get(9).await.unwrap();
    assert_eq!(shop.owner_id, Some(owner.id));

    // empty code fails the token exchange
    let uri = format!("/auth/callback?code=&shop_id=10&state={}", owner.id);
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers()[header::LOCATION],
        "http://ui.test/shops?success=false"
    );
}
