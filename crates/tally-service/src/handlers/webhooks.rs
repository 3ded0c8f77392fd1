//! Payment provider callbacks.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use tally_core::BillingError;

use crate::engine::ConfirmEffect;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the callback signature.
pub const SIGNATURE_HEADER: &str = "payment-signature";

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
    /// Whether the event had already been applied.
    pub duplicate: bool,
    /// What the event did.
    pub effect: ConfirmEffect,
}

/// Verify and apply a payment provider callback.
///
/// Verification failures are 400s. Engine failures (unknown intent,
/// frozen account) are returned as errors so the provider redelivers.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let provider = state.provider()?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = provider.verify_callback(&body, signature).map_err(|e| {
        tracing::warn!(provider = provider.name(), error = %e, "Rejected payment callback");
        ApiError::from(BillingError::from(e))
    })?;

    let verified = event.clone();
    let outcome = state
        .engine
        .run_blocking(move |engine| engine.confirm(&verified))
        .await?;
    let duplicate = outcome.is_duplicate();

    tracing::info!(
        event_id = %event.event_id,
        kind = ?event.kind,
        duplicate,
        "Payment callback processed"
    );

    Ok(Json(WebhookResponse {
        received: true,
        duplicate,
        effect: outcome.into_inner(),
    }))
}
