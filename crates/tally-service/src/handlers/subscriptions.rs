//! Subscription lifecycle handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::{BillingPeriod, LedgerEntry, PlanId, Subscription};

use crate::auth::AuthUser;
use crate::engine::PlanChangeKind;
use crate::error::ApiError;
use crate::state::AppState;

/// Start trial request.
#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    /// Paid plan to trial.
    pub plan: PlanId,
    /// Billing period the trial converts to.
    #[serde(default = "default_period")]
    pub billing_period: BillingPeriod,
}

const fn default_period() -> BillingPeriod {
    BillingPeriod::Monthly
}

/// Start a trial of a paid plan.
pub async fn start_trial(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<StartTrialRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let account_id = auth.account_id;
    let subscription = state
        .engine
        .run_blocking(move |engine| engine.start_trial(account_id, body.plan, body.billing_period))
        .await?;
    Ok(Json(subscription))
}

/// Plan change request.
#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    /// Target plan.
    pub plan: PlanId,
    /// Client-chosen id making the change idempotent.
    pub change_id: String,
}

/// Plan change response.
#[derive(Debug, Serialize)]
pub struct ChangePlanResponse {
    /// Whether this change was already applied.
    pub duplicate: bool,
    /// Upgrade (immediate) or downgrade (at period end).
    pub kind: PlanChangeKind,
    /// Subscription after the change.
    pub subscription: Subscription,
    /// Proration entries.
    pub entries: Vec<LedgerEntry>,
}

/// Upgrade immediately with proration, or schedule a downgrade.
pub async fn change_plan(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChangePlanRequest>,
) -> Result<Json<ChangePlanResponse>, ApiError> {
    let account_id = auth.account_id;
    let outcome = state
        .engine
        .run_blocking(move |engine| engine.change_plan(account_id, body.plan, &body.change_id))
        .await?;
    let duplicate = outcome.is_duplicate();
    let change = outcome.into_inner();

    Ok(Json(ChangePlanResponse {
        duplicate,
        kind: change.kind,
        subscription: change.subscription,
        entries: change.entries,
    }))
}

/// Cancel request.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Keep entitlements until the window ends (default) or cancel now.
    #[serde(default = "default_at_period_end")]
    pub at_period_end: bool,
}

const fn default_at_period_end() -> bool {
    true
}

/// Cancel the live subscription.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let account_id = auth.account_id;
    let subscription = state
        .engine
        .run_blocking(move |engine| engine.cancel(account_id, body.at_period_end))
        .await?;
    Ok(Json(subscription))
}

/// Undo a scheduled cancellation.
pub async fn resume(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Subscription>, ApiError> {
    let account_id = auth.account_id;
    let subscription = state
        .engine
        .run_blocking(move |engine| engine.resume(account_id))
        .await?;
    Ok(Json(subscription))
}
