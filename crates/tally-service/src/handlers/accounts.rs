//! Account handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use tally_core::{CreditAccount, Subscription};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Account response.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// Account id.
    pub account_id: String,
    /// Current credit balance.
    pub balance: i64,
    /// Credits ever added.
    pub lifetime_credited: i64,
    /// Credits ever removed.
    pub lifetime_debited: i64,
    /// Most unused credits that survive a period boundary.
    pub rollover_cap: i64,
    /// Last credit period that received its grant.
    pub last_replenished_period: Option<String>,
    /// Whether ledger writes are frozen.
    pub frozen: bool,
    /// Current subscription record.
    pub subscription: Option<Subscription>,
    /// Created timestamp.
    pub created_at: String,
}

impl AccountResponse {
    fn new(account: &CreditAccount, subscription: Option<Subscription>) -> Self {
        Self {
            account_id: account.account_id.to_string(),
            balance: account.balance,
            lifetime_credited: account.lifetime_credited,
            lifetime_debited: account.lifetime_debited,
            rollover_cap: account.rollover_cap,
            last_replenished_period: account.last_replenished_period.clone(),
            frozen: account.is_frozen(),
            subscription,
            created_at: account.created_at.to_rfc3339(),
        }
    }
}

/// Create account response.
#[derive(Debug, Serialize)]
pub struct CreateAccountResponse {
    /// Whether the account already existed.
    pub duplicate: bool,
    /// The account.
    #[serde(flatten)]
    pub account: AccountResponse,
}

/// Open the caller's account: free plan plus the first monthly grant.
///
/// Calling it again returns the existing account.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<CreateAccountResponse>, ApiError> {
    let account_id = auth.account_id;
    let (outcome, subscription) = state
        .engine
        .run_blocking(move |engine| {
            let outcome = engine.open_account(account_id)?;
            let subscription = engine.store().current_subscription(&account_id)?;
            Ok((outcome, subscription))
        })
        .await?;
    let duplicate = outcome.is_duplicate();
    let account = outcome.into_inner();

    if !duplicate {
        tracing::info!(account_id = %account_id, "Account created");
    }

    Ok(Json(CreateAccountResponse {
        duplicate,
        account: AccountResponse::new(&account, subscription),
    }))
}

/// Get the caller's account.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let account_id = auth.account_id;
    let (account, subscription) = state
        .engine
        .run_blocking(move |engine| {
            let account = engine.account(account_id)?;
            let subscription = engine.store().current_subscription(&account_id)?;
            Ok((account, subscription))
        })
        .await?;

    Ok(Json(AccountResponse::new(&account, subscription)))
}
