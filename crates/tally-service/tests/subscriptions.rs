//! Subscription lifecycle API tests.

mod common;

use axum::http::StatusCode;
use chrono::Duration;
use common::TestHarness;
use serde_json::json;

async fn post_user(
    harness: &TestHarness,
    path: &str,
    body: serde_json::Value,
) -> axum_test::TestResponse {
    harness
        .server
        .post(path)
        .add_header("authorization", harness.user_auth_header())
        .json(&body)
        .await
}

async fn entitlements(harness: &TestHarness) -> serde_json::Value {
    let response = harness
        .server
        .get("/v1/entitlements")
        .add_header("authorization", harness.user_auth_header())
        .await;
    response.assert_status_ok();
    response.json()
}

// ============================================================================
// Trials
// ============================================================================

#[tokio::test]
async fn trial_replaces_free_plan_once() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let response = post_user(&harness, "/v1/subscription/trial", json!({ "plan": "pro" })).await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "trialing");
    assert_eq!(body["plan_id"], "pro");
    assert!(body["trial_end"].is_string());

    let again = post_user(&harness, "/v1/subscription/trial", json!({ "plan": "premium" })).await;
    again.assert_status(StatusCode::CONFLICT);
    let again: serde_json::Value = again.json();
    assert_eq!(again["error"]["code"], "invalid_transition");
}

#[tokio::test]
async fn trial_of_free_plan_is_rejected() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let response = post_user(&harness, "/v1/subscription/trial", json!({ "plan": "free" })).await;

    response.assert_status(StatusCode::CONFLICT);
}

// ============================================================================
// Plan changes
// ============================================================================

#[tokio::test]
async fn upgrade_is_immediate_and_idempotent() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.fund(1000, "topup").await;

    let body = json!({ "plan": "pro", "change_id": "chg-1" });
    let response = post_user(&harness, "/v1/subscription/change", body.clone()).await;

    response.assert_status_ok();
    let first: serde_json::Value = response.json();
    assert_eq!(first["duplicate"], false);
    assert_eq!(first["kind"], "upgrade");
    assert_eq!(first["subscription"]["plan_id"], "pro");
    assert_eq!(first["entries"].as_array().unwrap().len(), 1);
    assert_eq!(harness.balance().await, 51);

    let replay: serde_json::Value = post_user(&harness, "/v1/subscription/change", body)
        .await
        .json();
    assert_eq!(replay["duplicate"], true);
    assert_eq!(harness.balance().await, 51);
}

#[tokio::test]
async fn upgrade_without_credits_changes_nothing() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let response = post_user(
        &harness,
        "/v1/subscription/change",
        json!({ "plan": "premium", "change_id": "chg-1" }),
    )
    .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    assert_eq!(entitlements(&harness).await["plan_id"], "free");
    assert_eq!(harness.balance().await, 50);
}

#[tokio::test]
async fn downgrade_applies_at_period_end() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.fund(1000, "topup").await;
    post_user(
        &harness,
        "/v1/checkout/credits",
        json!({ "plan": "pro", "billing_period": "monthly", "purchase_id": "buy-1" }),
    )
    .await
    .assert_status_ok();

    let response = post_user(
        &harness,
        "/v1/subscription/change",
        json!({ "plan": "free", "change_id": "chg-2" }),
    )
    .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["kind"], "downgrade");
    assert_eq!(body["subscription"]["plan_id"], "pro");
    assert_eq!(body["subscription"]["pending_plan_id"], "free");

    harness.clock.advance(Duration::days(32));
    let sweep = harness
        .server
        .post("/v1/admin/sweep")
        .add_header("x-admin-key", &harness.admin_api_key)
        .await;
    sweep.assert_status_ok();
    let report: serde_json::Value = sweep.json();
    assert_eq!(report["downgrades_applied"], 1);
    assert_eq!(report["grants"], 1);

    let after = entitlements(&harness).await;
    assert_eq!(after["plan_id"], "free");
    assert!(after["pending_plan_id"].is_null());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancel_at_period_end_then_resume() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let canceled: serde_json::Value =
        post_user(&harness, "/v1/subscription/cancel", json!({})).await.json();
    assert_eq!(canceled["status"], "active");
    assert_eq!(canceled["cancel_at_period_end"], true);

    let resumed = harness
        .server
        .post("/v1/subscription/resume")
        .add_header("authorization", harness.user_auth_header())
        .await;
    resumed.assert_status_ok();
    let resumed: serde_json::Value = resumed.json();
    assert_eq!(resumed["cancel_at_period_end"], false);
}

#[tokio::test]
async fn immediate_cancel_ends_entitlements() {
    let harness = TestHarness::new();
    harness.open_account().await;

    let response = post_user(
        &harness,
        "/v1/subscription/cancel",
        json!({ "at_period_end": false }),
    )
    .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "canceled");

    let after = entitlements(&harness).await;
    assert_eq!(after["entitled"], false);
    assert_eq!(after["credit_balance"], 50);

    let again = post_user(
        &harness,
        "/v1/subscription/cancel",
        json!({ "at_period_end": false }),
    )
    .await;
    again.assert_status(StatusCode::NOT_FOUND);
}

// ============================================================================
// Sweep
// ============================================================================

#[tokio::test]
async fn sweep_grants_each_period_once() {
    let harness = TestHarness::new();
    harness.open_account().await;
    harness.clock.advance(Duration::days(31));

    for expected_grants in [1, 0] {
        let report: serde_json::Value = harness
            .server
            .post("/v1/admin/sweep")
            .add_header("x-admin-key", &harness.admin_api_key)
            .await
            .json();
        assert_eq!(report["grants"], expected_grants);
    }
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn sweep_requires_admin_key() {
    let harness = TestHarness::new();

    let response = harness.server.post("/v1/admin/sweep").await;

    response.assert_status(StatusCode::UNAUTHORIZED);
}
