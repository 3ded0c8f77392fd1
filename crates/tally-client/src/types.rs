//! Request and response types for the tally client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{
    AccountId, EntryId, Feature, LedgerEntry, PlanId, Resource, SubscriptionStatus,
};

/// Authorize-and-debit request.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    /// Account to charge.
    pub account_id: AccountId,
    /// Metered feature.
    pub feature: Feature,
    /// Units consumed.
    pub units: u64,
    /// Caller-chosen id making the debit idempotent.
    pub reference_id: String,
}

/// Quota consumed by a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuotaUse {
    /// Counted resource.
    pub resource: Resource,
    /// Counter key.
    pub period_key: String,
    /// Units used before the request.
    pub used: u64,
    /// Plan limit, `None` when unlimited.
    pub limit: Option<u64>,
}

/// Authorize-and-debit response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    /// Whether the reference had already been charged.
    pub duplicate: bool,
    /// The debit entry; pass it to compensate on failure.
    pub entry_id: String,
    /// Credits charged.
    pub cost: i64,
    /// Balance after the debit.
    pub balance: i64,
    /// Quota the debit consumed.
    pub quota: Option<QuotaUse>,
}

/// Compensation request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompensateRequest<'a> {
    pub entry_id: &'a str,
}

/// Compensation response.
#[derive(Debug, Clone, Deserialize)]
pub struct CompensateResponse {
    /// Whether the debit had already been compensated.
    pub duplicate: bool,
    /// The refund entry.
    pub entry: LedgerEntry,
}

impl CompensateResponse {
    /// Id of the refund entry.
    #[must_use]
    pub const fn entry_id(&self) -> EntryId {
        self.entry.id
    }
}

/// Advisory check request.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckRequest {
    pub account_id: AccountId,
    pub feature: Feature,
    pub units: u64,
}

/// A positive advisory decision.
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    /// Account.
    pub account_id: AccountId,
    /// Feature.
    pub feature: Feature,
    /// Units.
    pub units: u64,
    /// Plan granting the feature.
    pub plan_id: PlanId,
    /// Subscription status.
    pub status: SubscriptionStatus,
    /// Credits the request would cost.
    pub cost: i64,
    /// Balance at decision time.
    pub balance: i64,
    /// Quota the request would consume.
    pub quota: Option<QuotaUse>,
}

/// Usage of one quota resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuotaStatus {
    /// Resource.
    pub resource: Resource,
    /// Plan limit, `None` when unlimited.
    pub limit: Option<u64>,
    /// Units used in the current counter period.
    pub used: u64,
    /// Counter key.
    pub period_key: String,
}

/// What an account may currently do.
#[derive(Debug, Clone, Deserialize)]
pub struct Entitlements {
    /// Account.
    pub account_id: AccountId,
    /// Effective plan.
    pub plan_id: PlanId,
    /// Plan display name.
    pub plan_name: String,
    /// Status of the current subscription record.
    pub status: Option<SubscriptionStatus>,
    /// Whether metered features are usable.
    pub entitled: bool,
    /// Credit balance.
    pub credit_balance: i64,
    /// Monthly allowance of the plan.
    pub monthly_credit_allowance: i64,
    /// Included features.
    pub features: Vec<Feature>,
    /// Quota usage.
    pub quotas: Vec<QuotaStatus>,
    /// End of the billing window.
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether the subscription ends at the window end.
    pub cancel_at_period_end: bool,
    /// Deferred downgrade target.
    pub pending_plan_id: Option<PlanId>,
    /// Whether writes are frozen.
    pub frozen: bool,
}

impl Entitlements {
    /// Whether the plan includes `feature`.
    #[must_use]
    pub fn includes(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Result of [`crate::TallyClient::metered`].
#[derive(Debug, Clone)]
pub enum Metered<T> {
    /// The action ran and its debit stands.
    Ran {
        /// The debit.
        debit: AuthorizeResponse,
        /// What the action returned.
        output: T,
    },
    /// The reference was already charged; the action was not run again.
    AlreadyCharged(AuthorizeResponse),
}
