//! Payment intents.
//!
//! An intent is created before the checkout redirect and finalized exactly
//! once. `succeeded` is final; a late success may still supersede an earlier
//! `failed` or `canceled` because the money was captured.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{AccountId, PaymentIntentId};
use crate::plan::{BillingPeriod, PlanId};

/// Payment intent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Created, checkout not started.
    Created,
    /// Checkout started, awaiting the provider.
    Pending,
    /// Payment captured and credited.
    Succeeded,
    /// Provider reported a failure.
    Failed,
    /// Abandoned, expired or rejected before payment.
    Canceled,
}

impl IntentStatus {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether the intent is still waiting on the provider.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Created | Self::Pending)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to pay for a plan through the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent id; also the idempotency reference of the resulting credit.
    pub id: PaymentIntentId,
    /// Paying account.
    pub account_id: AccountId,
    /// Plan being purchased.
    pub plan_id: PlanId,
    /// Billing cadence being purchased.
    pub billing_period: BillingPeriod,
    /// Price in minor units.
    pub amount_minor: i64,
    /// ISO currency code, lowercase.
    pub currency: String,
    /// Provider-side checkout/session id.
    pub provider_reference: Option<String>,
    /// Status.
    pub status: IntentStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// When the intent reached a final status.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl PaymentIntent {
    /// A new intent in `created`.
    #[must_use]
    pub fn new(
        account_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
        amount_minor: i64,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentIntentId::generate(),
            account_id,
            plan_id,
            billing_period,
            amount_minor,
            currency: currency.into(),
            provider_reference: None,
            status: IntentStatus::Created,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    /// Move to a new status, stamping timestamps.
    pub fn set_status(&mut self, status: IntentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        if !status.is_open() {
            self.finalized_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizing_stamps_time() {
        let now = Utc::now();
        let mut intent = PaymentIntent::new(
            AccountId::generate(),
            PlanId::Pro,
            BillingPeriod::Monthly,
            999,
            "usd",
            now,
        );
        assert_eq!(intent.status, IntentStatus::Created);

        intent.set_status(IntentStatus::Pending, now);
        assert!(intent.finalized_at.is_none());

        intent.set_status(IntentStatus::Succeeded, now);
        assert_eq!(intent.finalized_at, Some(now));
        assert!(!intent.status.is_open());
    }
}
