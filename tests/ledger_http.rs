#![cfg(all(feature = "http", feature = "store-sqlite"))]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use token_ledger::clock::DAY_MS;
use token_ledger::{
    ConsumptionService, LedgerHttpState, ManualClock, PaymentVerifier, Plan, PurchaseConfig,
    PurchaseStateMachine, QuotaPolicy, SqliteStore, UserConfig, router,
};
use tower::util::ServiceExt;

const KEY_SECRET: &str = "key-secret";
const WEBHOOK_SECRET: &str = "webhook-secret";
const ADMIN_TOKEN: &str = "adm";

fn verifier() -> PaymentVerifier {
    PaymentVerifier::new(KEY_SECRET).with_webhook_secret(WEBHOOK_SECRET)
}

async fn test_app() -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");

    let clock = ManualClock::new(40 * DAY_MS + 12_345);
    let consumption =
        ConsumptionService::with_clock(Arc::new(store), QuotaPolicy::default(), Arc::new(clock));
    let purchases = PurchaseStateMachine::new(consumption.clone(), verifier()).with_config(
        PurchaseConfig {
            poll_attempts: 50,
            poll_interval_ms: 10,
            claim_lease_secs: 300,
        },
    );
    let state = LedgerHttpState::new(consumption, purchases)
        .with_users([
            UserConfig::new("user-std", "tok-std", Plan::Standard),
            UserConfig::new("user-free", "tok-free", Plan::Free),
            UserConfig::new("user-prem", "tok-prem", Plan::Premium),
        ])
        .with_admin_token(ADMIN_TOKEN);
    (dir, router(state))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&body).expect("json"))
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");
    read_json(response).await
}

async fn read_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn send_webhook(app: &Router, payload: Value, signature: Option<String>) -> (StatusCode, Value) {
    let body = serde_json::to_vec(&payload).expect("json");
    let signature = signature.unwrap_or_else(|| {
        verifier()
            .sign_webhook(&body)
            .expect("webhook secret configured")
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/payment")
        .header("content-type", "application/json")
        .header("x-webhook-signature", signature)
        .body(Body::from(body))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    read_json(response).await
}

async fn record_order(app: &Router, order_id: &str, user_id: &str, tokens: u64) {
    let (status, body) = send(
        app,
        "POST",
        "/admin/purchases",
        Some(ADMIN_TOKEN),
        Some(json!({
            "order_id": order_id,
            "user_id": user_id,
            "token_amount": tokens,
            "amount_minor": tokens * 100,
            "currency": "INR",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

fn confirm_body(order_id: &str, payment_id: &str) -> Value {
    json!({
        "order_id": order_id,
        "payment_id": payment_id,
        "signature": verifier().sign(order_id, payment_id),
    })
}

fn captured_event(order_id: &str, payment_id: &str) -> Value {
    json!({
        "event": "payment.captured",
        "payload": {
            "payment": { "entity": { "id": payment_id, "order_id": order_id } }
        }
    })
}

#[tokio::test]
async fn health_is_public_and_tags_request_ids() {
    let (_dir, app) = test_app().await;
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("req-42")
    );
    let (_, body) = read_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn token_routes_require_a_known_bearer_token() {
    let (_dir, app) = test_app().await;
    let (status, body) = send(&app, "GET", "/v1/tokens", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTHENTICATION_REQUIRED");

    let (status, _) = send(&app, "GET", "/v1/tokens", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn snapshot_reports_daily_allowance() {
    let (_dir, app) = test_app().await;
    let (status, body) = send(&app, "GET", "/v1/tokens", Some("tok-std"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "standard");
    assert_eq!(body["available_tokens"], 20);
    assert_eq!(body["daily_limit"], 20);
    assert_eq!(body["total_tokens"], 20);
    assert_eq!(body["purchased_tokens"], 0);
    assert_eq!(body["unlimited"], false);
    assert_eq!(body["daily_reset_at"], "1970-02-11T00:00:00Z");
}

#[tokio::test]
async fn consume_prices_by_language_and_mode() {
    let (_dir, app) = test_app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/tokens/consume",
        Some("tok-std"),
        Some(json!({ "language": "es", "mode": "deep" })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "INSUFFICIENT_TOKENS");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/tokens/consume",
        Some("tok-std"),
        Some(json!({ "language": "en", "mode": "quick" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["cost"], 5);
    assert_eq!(body["from_daily"], 5);
    assert_eq!(body["tokens"]["available_tokens"], 15);
}

#[tokio::test]
async fn consume_rejects_bad_input_before_touching_state() {
    let (_dir, app) = test_app().await;
    for payload in [json!({}), json!({ "cost": 0 }), json!({ "mode": "turbo" })] {
        let (status, body) = send(
            &app,
            "POST",
            "/v1/tokens/consume",
            Some("tok-free"),
            Some(payload),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    let (_, body) = send(&app, "GET", "/v1/tokens", Some("tok-free"), None).await;
    assert_eq!(body["daily_tokens_used"], 0);
}

#[tokio::test]
async fn premium_consumption_is_unlimited() {
    let (_dir, app) = test_app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/tokens/consume",
        Some("tok-prem"),
        Some(json!({ "cost": 5000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens"]["unlimited"], true);
    assert_eq!(body["tokens"]["available_tokens"], 999_999_999u64);
}

#[tokio::test]
async fn confirm_credits_once_and_records_history() {
    let (_dir, app) = test_app().await;
    let (status, _) = send(
        &app,
        "POST",
        "/v1/tokens/consume",
        Some("tok-std"),
        Some(json!({ "cost": 20 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    record_order(&app, "ord_1", "user-std", 100).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["tokens_added"], 100);
    assert_eq!(body["already_completed"], false);
    assert_eq!(body["token_balance"]["purchased_tokens"], 100);
    assert_eq!(body["token_balance"]["daily_tokens_used"], 20);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_completed"], true);
    assert_eq!(body["token_balance"]["purchased_tokens"], 100);

    let (status, body) = send(&app, "GET", "/v1/purchases/history", Some("tok-std"), None).await;
    assert_eq!(status, StatusCode::OK);
    let purchases = body["purchases"].as_array().expect("array");
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0]["order_id"], "ord_1");
    assert_eq!(purchases[0]["source"], "client");

    let (status, body) = send(&app, "GET", "/admin/purchases/ord_1", Some(ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["payment_id"], "pay_1");
}

#[tokio::test]
async fn invalid_signature_never_credits() {
    let (_dir, app) = test_app().await;
    record_order(&app, "ord_1", "user-std", 100).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(json!({ "order_id": "ord_1", "payment_id": "pay_1", "signature": "00ff" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

    let (_, body) = send(&app, "GET", "/v1/tokens", Some("tok-std"), None).await;
    assert_eq!(body["purchased_tokens"], 0);

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "PURCHASE_FAILED");
}

#[tokio::test]
async fn confirm_of_someone_elses_order_is_not_found() {
    let (_dir, app) = test_app().await;
    record_order(&app, "ord_1", "user-free", 10).await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "PURCHASE_NOT_FOUND");
}

#[tokio::test]
async fn webhook_completes_and_client_sees_completion() {
    let (_dir, app) = test_app().await;
    record_order(&app, "ord_1", "user-std", 60).await;

    let (status, body) = send_webhook(
        &app,
        captured_event("ord_1", "pay_1"),
        Some("bad".to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

    let (status, body) = send_webhook(&app, captured_event("ord_1", "pay_1"), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["action"], "completed");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_completed"], true);
    assert_eq!(body["token_balance"]["purchased_tokens"], 60);

    let (_, body) = send_webhook(&app, captured_event("ord_1", "pay_1"), None).await;
    assert_eq!(body["action"], "already_completed");
}

#[tokio::test]
async fn webhook_failure_and_unknown_events() {
    let (_dir, app) = test_app().await;
    record_order(&app, "ord_1", "user-std", 60).await;

    let (status, body) = send_webhook(
        &app,
        json!({
            "event": "payment.failed",
            "payload": {
                "payment": {
                    "entity": {
                        "id": "pay_1",
                        "order_id": "ord_1",
                        "error_description": "card declined"
                    }
                }
            }
        }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "marked_failed");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/purchases/confirm",
        Some("tok-std"),
        Some(confirm_body("ord_1", "pay_1")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "PURCHASE_FAILED");

    let (status, body) = send_webhook(&app, json!({ "event": "refund.created" }), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "ignored");
}

#[tokio::test]
async fn admin_routes_require_the_admin_token() {
    let (_dir, app) = test_app().await;
    let (status, _) = send(
        &app,
        "POST",
        "/admin/purchases",
        Some("tok-std"),
        Some(json!({
            "order_id": "ord_1",
            "user_id": "user-std",
            "token_amount": 10,
            "amount_minor": 1000,
            "currency": "INR",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", "/admin/purchases/missing", Some(ADMIN_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "PURCHASE_NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_and_webhook_race_over_http_credits_once() {
    let (_dir, app) = test_app().await;
    record_order(&app, "ord_1", "user-std", 100).await;

    let mut calls = Vec::new();
    for n in 0..6 {
        let app = app.clone();
        calls.push(tokio::spawn(async move {
            if n % 2 == 0 {
                send(
                    &app,
                    "POST",
                    "/v1/purchases/confirm",
                    Some("tok-std"),
                    Some(confirm_body("ord_1", "pay_1")),
                )
                .await
            } else {
                send_webhook(&app, captured_event("ord_1", "pay_1"), None).await
            }
        }));
    }
    for result in futures_util::future::join_all(calls).await {
        let (status, body) = result.expect("join");
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let (_, body) = send(&app, "GET", "/v1/tokens", Some("tok-std"), None).await;
    assert_eq!(body["purchased_tokens"], 100);
    let (_, body) = send(&app, "GET", "/v1/purchases/history", Some("tok-std"), None).await;
    assert_eq!(body["purchases"].as_array().map(Vec::len), Some(1));
}
