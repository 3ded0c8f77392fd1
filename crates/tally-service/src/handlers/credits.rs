//! Credit balance and ledger history handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use tally_core::LedgerEntry;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Default page size for transaction listings.
const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page a caller may request.
const MAX_PAGE_SIZE: usize = 200;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Account id.
    pub account_id: String,
    /// Current balance.
    pub balance: i64,
    /// Whether ledger writes are frozen.
    pub frozen: bool,
}

/// Get the caller's balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account_id = auth.account_id;
    let account = state
        .engine
        .run_blocking(move |engine| engine.account(account_id))
        .await?;

    Ok(Json(BalanceResponse {
        account_id: account.account_id.to_string(),
        balance: account.balance,
        frozen: account.is_frozen(),
    }))
}

/// Transaction listing query.
#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Opaque token from a previous page.
    pub page_token: Option<String>,
}

/// A page of ledger entries, newest first.
#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    /// Entries.
    pub transactions: Vec<LedgerEntry>,
    /// Token for the next (older) page, absent on the last page.
    pub next_page_token: Option<String>,
}

/// List the caller's ledger entries.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let before = query
        .page_token
        .as_deref()
        .map(str::parse::<u64>)
        .transpose()
        .map_err(|_| ApiError::BadRequest("invalid page_token".into()))?;

    let account_id = auth.account_id;
    let transactions = state
        .engine
        .run_blocking(move |engine| engine.transactions(account_id, before, limit))
        .await?;
    let next_page_token = match transactions.last() {
        Some(last) if transactions.len() == limit && last.sequence > 0 => {
            Some(last.sequence.to_string())
        }
        _ => None,
    };

    Ok(Json(TransactionsResponse {
        transactions,
        next_page_token,
    }))
}
