//! Checkout handlers: hosted provider checkout and paying with credits.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::{BillingPeriod, IntentStatus, LedgerEntry, PlanId, Subscription};

use crate::auth::AuthUser;
use crate::checkout::{start_checkout, CheckoutOutcome};
use crate::error::ApiError;
use crate::state::AppState;

/// Checkout request.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Plan to buy.
    pub plan: PlanId,
    /// Billing period.
    pub billing_period: BillingPeriod,
}

/// Checkout response. `redirect_url` is absent when the provider did not
/// answer in time; the intent then resolves through callback or polling.
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    /// Payment intent id.
    pub intent_id: String,
    /// Intent status.
    pub status: IntentStatus,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Currency.
    pub currency: String,
    /// Hosted checkout URL.
    pub redirect_url: Option<String>,
}

/// Create a payment intent and open a hosted checkout for it.
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let provider = state.provider()?.clone();
    let account_id = auth.account_id;
    let intent = state
        .engine
        .run_blocking(move |engine| engine.create_intent(account_id, body.plan, body.billing_period))
        .await?;

    let outcome = start_checkout(&state.engine, provider.as_ref(), state.checkout, &intent).await?;
    let redirect_url = match &outcome {
        CheckoutOutcome::Redirect { redirect_url, .. } => Some(redirect_url.clone()),
        CheckoutOutcome::Pending { .. } => None,
    };
    let intent = outcome.intent();

    Ok(Json(CheckoutResponse {
        intent_id: intent.id.to_string(),
        status: intent.status,
        amount_minor: intent.amount_minor,
        currency: intent.currency.clone(),
        redirect_url,
    }))
}

/// Pay-with-credits request.
#[derive(Debug, Deserialize)]
pub struct CreditCheckoutRequest {
    /// Plan to buy.
    pub plan: PlanId,
    /// Billing period.
    pub billing_period: BillingPeriod,
    /// Client-chosen id making the purchase idempotent.
    pub purchase_id: String,
}

/// Pay-with-credits response.
#[derive(Debug, Serialize)]
pub struct CreditCheckoutResponse {
    /// Whether this purchase was already applied.
    pub duplicate: bool,
    /// The debit.
    pub entry: LedgerEntry,
    /// The activated subscription.
    pub subscription: Option<Subscription>,
}

/// Buy a plan with the caller's credit balance.
pub async fn pay_with_credits(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreditCheckoutRequest>,
) -> Result<Json<CreditCheckoutResponse>, ApiError> {
    let account_id = auth.account_id;
    let outcome = state
        .engine
        .run_blocking(move |engine| {
            engine.pay_with_credits(
                account_id,
                body.plan,
                body.billing_period,
                &body.purchase_id,
            )
        })
        .await?;
    let duplicate = outcome.is_duplicate();
    let purchase = outcome.into_inner();

    Ok(Json(CreditCheckoutResponse {
        duplicate,
        entry: purchase.entry,
        subscription: purchase.subscription,
    }))
}
