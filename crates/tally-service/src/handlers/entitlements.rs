//! Entitlement handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use tally_core::AccountId;

use crate::auth::{AuthUser, ServiceAuth};
use crate::engine::Entitlements;
use crate::error::ApiError;
use crate::state::AppState;

/// The caller's plan, quotas and balance.
pub async fn get_entitlements(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Entitlements>, ApiError> {
    let account_id = auth.account_id;
    let entitlements = state
        .engine
        .run_blocking(move |engine| engine.entitlements(account_id))
        .await?;
    Ok(Json(entitlements))
}

/// Entitlements of any account, for collaborating services.
pub async fn get_account_entitlements(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Path(account_id): Path<String>,
) -> Result<Json<Entitlements>, ApiError> {
    let account_id = account_id
        .parse::<AccountId>()
        .map_err(|_| ApiError::BadRequest("invalid account id".into()))?;

    tracing::debug!(
        account_id = %account_id,
        service = %service.service_name,
        "Entitlements requested"
    );
    let entitlements = state
        .engine
        .run_blocking(move |engine| engine.entitlements(account_id))
        .await?;
    Ok(Json(entitlements))
}
