//! Usage metering handlers for collaborating services.
//!
//! Callers debit before running the metered action and compensate with the
//! returned entry id if the action fails.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, EntryId, Feature, LedgerEntry};

use crate::auth::ServiceAuth;
use crate::engine::{Authorization, QuotaUse};
use crate::error::ApiError;
use crate::state::AppState;

/// Authorize-and-debit request.
#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    /// Account to charge.
    pub account_id: AccountId,
    /// Metered feature.
    pub feature: Feature,
    /// Units requested.
    #[serde(default = "default_units")]
    pub units: u64,
    /// Caller-chosen id making the debit idempotent.
    pub reference_id: String,
}

const fn default_units() -> u64 {
    1
}

/// Authorize-and-debit response.
#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    /// Whether this reference was already charged.
    pub duplicate: bool,
    /// Debit entry id; pass it to compensate.
    pub entry_id: String,
    /// Credits charged.
    pub cost: i64,
    /// Balance after the debit.
    pub balance: i64,
    /// Quota consumed.
    pub quota: Option<QuotaUse>,
}

/// Authorize a feature and debit its cost in one step.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let reference_id = body.reference_id.clone();
    let outcome = state
        .engine
        .run_blocking(move |engine| {
            engine.authorize_and_debit(body.account_id, body.feature, body.units, &reference_id)
        })
        .await?;
    let duplicate = outcome.is_duplicate();
    let debit = outcome.into_inner();

    tracing::debug!(
        account_id = %body.account_id,
        feature = %body.feature.as_str(),
        units = body.units,
        cost = debit.cost,
        duplicate,
        service = %service.service_name,
        "Usage authorized"
    );

    Ok(Json(AuthorizeResponse {
        duplicate,
        entry_id: debit.entry.id.to_string(),
        cost: debit.cost,
        balance: debit.entry.resulting_balance,
        quota: debit.quota,
    }))
}

/// Compensation request.
#[derive(Debug, Deserialize)]
pub struct CompensateRequest {
    /// The debit to reverse.
    pub entry_id: EntryId,
}

/// Compensation response.
#[derive(Debug, Serialize)]
pub struct CompensateResponse {
    /// Whether the debit was already compensated.
    pub duplicate: bool,
    /// The refund entry.
    pub entry: LedgerEntry,
}

/// Reverse a debit whose action failed.
pub async fn compensate(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<CompensateRequest>,
) -> Result<Json<CompensateResponse>, ApiError> {
    let entry_id = body.entry_id;
    let outcome = state
        .engine
        .run_blocking(move |engine| engine.compensate(entry_id))
        .await?;
    let duplicate = outcome.is_duplicate();

    tracing::debug!(
        entry_id = %body.entry_id,
        duplicate,
        service = %service.service_name,
        "Usage compensated"
    );

    Ok(Json(CompensateResponse {
        duplicate,
        entry: outcome.into_inner(),
    }))
}

/// Advisory check request.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    /// Account.
    pub account_id: AccountId,
    /// Feature.
    pub feature: Feature,
    /// Units.
    #[serde(default = "default_units")]
    pub units: u64,
}

/// Evaluate a request without charging. Denials come back as the same
/// errors `authorize` would return.
pub async fn check(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Json(body): Json<CheckRequest>,
) -> Result<Json<Authorization>, ApiError> {
    let authorization = state
        .engine
        .run_blocking(move |engine| engine.preview(body.account_id, body.feature, body.units))
        .await?;
    Ok(Json(authorization))
}
