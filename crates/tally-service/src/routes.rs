//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    accounts, admin, checkout, credits, entitlements, health, plans, subscriptions, usage,
    webhooks,
};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for usage endpoints.
/// Metering sits on the hot path of every chat, agent and task request.
const USAGE_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/plans` - Plan catalog
///
/// ## User (JWT auth)
/// - `POST /v1/accounts` - Open account
/// - `GET /v1/accounts/me` - Current account
/// - `GET /v1/credits/balance` - Current balance
/// - `GET /v1/credits/transactions` - Ledger history
/// - `GET /v1/entitlements` - Plan, quotas and balance
/// - `POST /v1/subscription/{trial,change,cancel,resume}` - Lifecycle
/// - `POST /v1/checkout` - Hosted checkout
/// - `POST /v1/checkout/credits` - Pay with credits
///
/// ## Service (API key auth, rate-limited)
/// - `POST /v1/usage/authorize` - Authorize and debit
/// - `POST /v1/usage/compensate` - Reverse a debit
/// - `POST /v1/usage/check` - Advisory evaluation
/// - `GET /v1/accounts/:id/entitlements` - Entitlements of any account
///
/// ## Admin (admin key auth)
/// - `POST /v1/admin/credits` - Manual adjustment
/// - `POST /v1/admin/sweep` - Run the renewal sweep
/// - `POST /v1/admin/accounts/:id/{verify,unfreeze,rebuild}` - Integrity tools
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/payments` - Payment provider callbacks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let usage_routes = Router::new()
        .route("/authorize", post(usage::authorize))
        .route("/compensate", post(usage::compensate))
        .route("/check", post(usage::check))
        .layer(ConcurrencyLimitLayer::new(USAGE_MAX_CONCURRENT_REQUESTS));

    let admin_routes = Router::new()
        .route("/credits", post(admin::adjust_credits))
        .route("/sweep", post(admin::run_sweep))
        .route("/accounts/:id/verify", post(admin::verify_account))
        .route("/accounts/:id/unfreeze", post(admin::unfreeze_account))
        .route("/accounts/:id/rebuild", post(admin::rebuild_account));

    let api_routes = Router::new()
        .route("/plans", get(plans::list_plans))
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/me", get(accounts::get_account))
        .route(
            "/accounts/:id/entitlements",
            get(entitlements::get_account_entitlements),
        )
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/entitlements", get(entitlements::get_entitlements))
        // Subscription lifecycle
        .route("/subscription/trial", post(subscriptions::start_trial))
        .route("/subscription/change", post(subscriptions::change_plan))
        .route("/subscription/cancel", post(subscriptions::cancel))
        .route("/subscription/resume", post(subscriptions::resume))
        // Payments
        .route("/checkout", post(checkout::create_checkout))
        .route("/checkout/credits", post(checkout::pay_with_credits))
        .nest("/admin", admin_routes)
        .nest("/usage", usage_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by the provider)
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
