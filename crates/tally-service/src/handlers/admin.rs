//! Operator endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, CreditAccount, LedgerEntry};

use crate::auth::AdminAuth;
use crate::engine::{Engine, IntegrityReport, SweepReport};
use crate::error::ApiError;
use crate::state::AppState;

/// Manual adjustment request.
#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    /// Account to adjust.
    pub account_id: AccountId,
    /// Signed change in credits.
    pub delta: i64,
    /// Idempotency reference.
    pub reference_id: String,
    /// Free-form note stored in the entry metadata.
    pub note: Option<String>,
}

/// Manual adjustment response.
#[derive(Debug, Serialize)]
pub struct AdjustCreditsResponse {
    /// Whether this reference was already applied.
    pub duplicate: bool,
    /// The adjustment entry.
    pub entry: LedgerEntry,
}

/// Post a manual adjustment.
pub async fn adjust_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<AdjustCreditsRequest>,
) -> Result<Json<AdjustCreditsResponse>, ApiError> {
    if body.delta == 0 {
        return Err(ApiError::BadRequest("delta must not be zero".into()));
    }
    if body.reference_id.is_empty() {
        return Err(ApiError::BadRequest("reference_id is required".into()));
    }

    let (reference_id, admin_id, note) = (
        body.reference_id.clone(),
        admin.admin_id.clone(),
        body.note.clone(),
    );
    let outcome = state
        .engine
        .run_blocking(move |engine| {
            engine.adjust(
                body.account_id,
                body.delta,
                &reference_id,
                &admin_id,
                note.as_deref(),
            )
        })
        .await?;
    let duplicate = outcome.is_duplicate();

    tracing::info!(
        account_id = %body.account_id,
        delta = body.delta,
        admin_id = %admin.admin_id,
        duplicate,
        "Manual adjustment"
    );

    Ok(Json(AdjustCreditsResponse {
        duplicate,
        entry: outcome.into_inner(),
    }))
}

/// Run the renewal sweep now.
pub async fn run_sweep(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state.engine.run_blocking(Engine::sweep).await?;

    tracing::info!(admin_id = %admin.admin_id, ?report, "Sweep triggered by admin");
    Ok(Json(report))
}

fn parse_account(raw: &str) -> Result<AccountId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("invalid account id".into()))
}

/// Verify one account's projection against its ledger.
///
/// A mismatch freezes the account and answers 423.
pub async fn verify_account(
    State(state): State<Arc<AppState>>,
    _admin: AdminAuth,
    Path(account_id): Path<String>,
) -> Result<Json<IntegrityReport>, ApiError> {
    let account_id = parse_account(&account_id)?;
    let report = state
        .engine
        .run_blocking(move |engine| engine.verify_account(account_id))
        .await?;
    Ok(Json(report))
}

/// Lift a freeze once ledger and projection agree.
pub async fn unfreeze_account(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(account_id): Path<String>,
) -> Result<Json<CreditAccount>, ApiError> {
    let account_id = parse_account(&account_id)?;
    let account = state
        .engine
        .run_blocking(move |engine| engine.unfreeze(account_id, &admin.admin_id))
        .await?;
    Ok(Json(account))
}

/// Rebuild the cached balance from the ledger.
pub async fn rebuild_account(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(account_id): Path<String>,
) -> Result<Json<CreditAccount>, ApiError> {
    let account_id = parse_account(&account_id)?;
    let account = state
        .engine
        .run_blocking(move |engine| engine.rebuild_projection(account_id, &admin.admin_id))
        .await?;
    Ok(Json(account))
}
