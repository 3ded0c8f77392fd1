//! Checkout and payment callback tests against a mocked Stripe API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use common::TestHarness;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tally_core::{IntentStatus, PaymentIntentId};
use tally_service::handlers::webhooks::SIGNATURE_HEADER;
use tally_service::provider::signature;
use tally_service::StripeProvider;
use tally_store::Store;

const WEBHOOK_SECRET: &str = "whsec_integration";

async fn harness_with_stripe(mock: &MockServer) -> TestHarness {
    let provider = StripeProvider::new(
        "sk_test_integration",
        Some(WEBHOOK_SECRET.into()),
        "https://app.test/billing/success",
        "https://app.test/billing/cancel",
        Duration::from_secs(2),
    )
    .unwrap()
    .with_base_url(mock.uri());

    let harness = TestHarness::with_provider(Arc::new(provider));
    harness.open_account().await;
    harness
}

async fn mount_session(mock: &MockServer, session_id: &str) {
    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .and(body_string_contains("client_reference_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": session_id,
            "object": "checkout.session",
            "url": format!("https://checkout.test/{session_id}"),
        })))
        .mount(mock)
        .await;
}

async fn checkout(harness: &TestHarness, plan: &str) -> axum_test::TestResponse {
    harness
        .server
        .post("/v1/checkout")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({ "plan": plan, "billing_period": "monthly" }))
        .await
}

fn completed_event(event_id: &str, session_id: &str, intent_id: &str, amount: i64) -> String {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": {
            "object": "checkout.session",
            "id": session_id,
            "payment_status": "paid",
            "client_reference_id": intent_id,
            "amount_total": amount,
            "currency": "usd",
        }}
    })
    .to_string()
}

async fn deliver(harness: &TestHarness, body: &str) -> axum_test::TestResponse {
    let header = signature::sign(WEBHOOK_SECRET, body, Utc::now().timestamp());
    harness
        .server
        .post("/webhooks/payments")
        .add_header(SIGNATURE_HEADER, header)
        .text(body.to_string())
        .await
}

async fn plan_and_status(harness: &TestHarness) -> (String, String) {
    let body: serde_json::Value = harness
        .server
        .get("/v1/entitlements")
        .add_header("authorization", harness.user_auth_header())
        .await
        .json();
    (
        body["plan_id"].as_str().unwrap().to_string(),
        body["status"].as_str().unwrap().to_string(),
    )
}

// ============================================================================
// Hosted checkout
// ============================================================================

#[tokio::test]
async fn checkout_returns_redirect() {
    let mock = MockServer::start().await;
    mount_session(&mock, "cs_test_1").await;
    let harness = harness_with_stripe(&mock).await;

    let response = checkout(&harness, "pro").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["amount_minor"], 999);
    assert_eq!(body["currency"], "usd");
    assert_eq!(body["redirect_url"], "https://checkout.test/cs_test_1");
}

#[tokio::test]
async fn checkout_without_provider_is_unavailable() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let response = checkout(&harness, "pro").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn checkout_for_free_plan_is_rejected() {
    let mock = MockServer::start().await;
    let harness = harness_with_stripe(&mock).await;

    let response = checkout(&harness, "free").await;

    response.assert_status(StatusCode::CONFLICT);
    assert!(mock.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn provider_rejection_cancels_intent() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "invalid_request_error", "message": "Invalid currency" }
        })))
        .mount(&mock)
        .await;
    let harness = harness_with_stripe(&mock).await;

    let response = checkout(&harness, "pro").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let canceled: Vec<_> = harness
        .store
        .list_intents_with_status(IntentStatus::Canceled)
        .unwrap()
        .into_iter()
        .filter(|intent| intent.account_id == harness.test_account_id)
        .collect();
    assert_eq!(canceled.len(), 1);
}

#[tokio::test]
async fn provider_outage_leaves_intent_pending() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/checkout/sessions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock)
        .await;
    let harness = harness_with_stripe(&mock).await;

    let response = checkout(&harness, "pro").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "pending");
    assert!(body["redirect_url"].is_null());
}

// ============================================================================
// Callbacks
// ============================================================================

#[tokio::test]
async fn paid_callback_credits_and_activates() {
    let mock = MockServer::start().await;
    mount_session(&mock, "cs_test_2").await;
    let harness = harness_with_stripe(&mock).await;
    let body: serde_json::Value = checkout(&harness, "pro").await.json();
    let intent_id = body["intent_id"].as_str().unwrap().to_string();

    let response = deliver(
        &harness,
        &completed_event("evt_1", "cs_test_2", &intent_id, 999),
    )
    .await;

    response.assert_status_ok();
    let result: serde_json::Value = response.json();
    assert_eq!(result["duplicate"], false);
    assert_eq!(result["effect"]["effect"], "paid");
    assert_eq!(result["effect"]["entry"]["delta"], 1500);
    assert_eq!(harness.balance().await, 1550);
    assert_eq!(
        plan_and_status(&harness).await,
        ("pro".to_string(), "active".to_string())
    );
}

#[tokio::test]
async fn replayed_callback_credits_once() {
    let mock = MockServer::start().await;
    mount_session(&mock, "cs_test_3").await;
    let harness = harness_with_stripe(&mock).await;
    let body: serde_json::Value = checkout(&harness, "pro").await.json();
    let intent_id = body["intent_id"].as_str().unwrap().to_string();
    let event = completed_event("evt_2", "cs_test_3", &intent_id, 999);

    deliver(&harness, &event).await.assert_status_ok();
    let replay = deliver(&harness, &event).await;

    replay.assert_status_ok();
    let result: serde_json::Value = replay.json();
    assert_eq!(result["duplicate"], true);
    assert_eq!(harness.balance().await, 1550);

    // Opening grant plus one payment credit.
    assert_eq!(harness.sink.events_of_kind("ledger_entry").len(), 2);
}

#[tokio::test]
async fn callback_with_wrong_amount_is_rejected() {
    let mock = MockServer::start().await;
    mount_session(&mock, "cs_test_4").await;
    let harness = harness_with_stripe(&mock).await;
    let body: serde_json::Value = checkout(&harness, "pro").await.json();
    let intent_id = body["intent_id"].as_str().unwrap().to_string();

    let response = deliver(
        &harness,
        &completed_event("evt_3", "cs_test_4", &intent_id, 1),
    )
    .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 50);
}

#[tokio::test]
async fn callback_with_bad_signature_is_rejected() {
    let mock = MockServer::start().await;
    let harness = harness_with_stripe(&mock).await;
    let body = completed_event(
        "evt_4",
        "cs_x",
        &PaymentIntentId::generate().to_string(),
        999,
    );

    let response = harness
        .server
        .post("/webhooks/payments")
        .add_header(SIGNATURE_HEADER, "t=1,v1=deadbeef")
        .text(body)
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(harness.balance().await, 50);
}

#[tokio::test]
async fn callback_for_unknown_intent_asks_for_redelivery() {
    let mock = MockServer::start().await;
    let harness = harness_with_stripe(&mock).await;
    let body = completed_event(
        "evt_5",
        "cs_unknown",
        &PaymentIntentId::generate().to_string(),
        999,
    );

    let response = deliver(&harness, &body).await;

    response.assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Paying with credits
// ============================================================================

#[tokio::test]
async fn pay_with_credits_short_balance_changes_nothing() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.fund(2450, "seed").await;

    let response = harness
        .server
        .post("/v1/checkout/credits")
        .add_header("authorization", harness.user_auth_header())
        .json(&json!({
            "plan": "premium",
            "billing_period": "monthly",
            "purchase_id": "buy-1",
        }))
        .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["details"]["balance"], 2500);
    assert_eq!(body["error"]["details"]["required"], 2900);
    assert_eq!(harness.balance().await, 2500);
    assert_eq!(plan_and_status(&harness).await.0, "free");
}

#[tokio::test]
async fn pay_with_credits_is_idempotent() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.fund(2950, "seed").await;
    let request = json!({
        "plan": "premium",
        "billing_period": "monthly",
        "purchase_id": "buy-2",
    });

    let first: serde_json::Value = harness
        .server
        .post("/v1/checkout/credits")
        .add_header("authorization", harness.user_auth_header())
        .json(&request)
        .await
        .json();
    let second: serde_json::Value = harness
        .server
        .post("/v1/checkout/credits")
        .add_header("authorization", harness.user_auth_header())
        .json(&request)
        .await
        .json();

    assert_eq!(first["duplicate"], false);
    assert_eq!(second["duplicate"], true);
    assert_eq!(first["entry"]["id"], second["entry"]["id"]);
    assert_eq!(harness.balance().await, 100);
    assert_eq!(
        plan_and_status(&harness).await,
        ("premium".to_string(), "active".to_string())
    );
}
