//! Error taxonomy for tally.
//!
//! Three families matter to callers:
//!
//! - **Denials** (`InsufficientCredits`, `QuotaExceeded`, `SubscriptionInactive`,
//!   `PlanLimitExceeded`) are structured answers that a UI renders as an
//!   upgrade prompt.
//! - **Replays** (`DuplicateOperation`) are absorbed; most engine operations
//!   report them through [`Outcome::Duplicate`](crate::Outcome) instead.
//! - **Faults** (`IntegrityViolation`, `InvalidTransition`, storage errors)
//!   indicate a bug or corrupted state.

use crate::ids::{AccountId, IdError};
use crate::subscription::SubscriptionStatus;

/// Result type for tally operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in tally operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// The balance cannot cover the debit.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Amount the operation needs.
        required: i64,
    },

    /// A non-credit quota would be exceeded.
    #[error("quota exceeded for {resource}: used={used}, requested={requested}, limit={limit}")]
    QuotaExceeded {
        /// The limited resource, or the feature name when the plan lacks it.
        resource: String,
        /// Plan limit (0 when the plan lacks the feature).
        limit: u64,
        /// Units already consumed in the period.
        used: u64,
        /// Units requested.
        requested: u64,
    },

    /// There is no subscription in an entitled state.
    #[error("subscription inactive: {status:?}")]
    SubscriptionInactive {
        /// Status of the latest subscription, `None` if the owner has none.
        status: Option<SubscriptionStatus>,
    },

    /// The operation was already applied under the same idempotency key.
    #[error("duplicate operation: {reference_id}")]
    DuplicateOperation {
        /// The replayed reference id.
        reference_id: String,
    },

    /// A credit would push the balance past the configured ceiling.
    #[error("plan limit exceeded: ceiling={ceiling}, attempted={attempted}")]
    PlanLimitExceeded {
        /// Configured maximum balance.
        ceiling: i64,
        /// Balance the credit would have produced.
        attempted: i64,
    },

    /// The cached balance disagrees with the ledger, or the account is frozen.
    #[error("integrity violation on {account_id}: cached={cached}, ledger={ledger}")]
    IntegrityViolation {
        /// Affected account.
        account_id: AccountId,
        /// Cached projection.
        cached: i64,
        /// Sum of ledger deltas.
        ledger: i64,
    },

    /// The payment provider failed in a way that may succeed on retry.
    #[error("payment provider error: {0}")]
    ProviderError(String),

    /// The state machine does not allow the requested change.
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted event or target.
        event: String,
    },

    /// Account not found.
    #[error("account not found: {account_id}")]
    AccountNotFound {
        /// The missing account.
        account_id: AccountId,
    },

    /// Account already exists.
    #[error("account already exists: {account_id}")]
    AccountAlreadyExists {
        /// The existing account.
        account_id: AccountId,
    },

    /// No subscription record for the owner.
    #[error("subscription not found for {account_id}")]
    SubscriptionNotFound {
        /// The owner.
        account_id: AccountId,
    },

    /// Plan id is not in the catalog.
    #[error("plan not found: {plan}")]
    PlanNotFound {
        /// The unknown plan id.
        plan: String,
    },

    /// Ledger entry not found.
    #[error("ledger entry not found: {entry_id}")]
    EntryNotFound {
        /// The missing entry id.
        entry_id: String,
    },

    /// Payment intent not found.
    #[error("payment intent not found: {reference}")]
    IntentNotFound {
        /// Intent id or provider reference used for the lookup.
        reference: String,
    },

    /// Amount is zero, negative, or overflows.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A provider callback does not match what we expect.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl BillingError {
    /// Whether this is a structured denial rather than a fault.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredits { .. }
                | Self::QuotaExceeded { .. }
                | Self::SubscriptionInactive { .. }
                | Self::PlanLimitExceeded { .. }
        )
    }

    /// Whether the caller may retry the same request unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderError(_))
    }

    /// Build an `InvalidTransition` from displayable parts.
    pub fn invalid_transition(from: impl ToString, event: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_are_classified() {
        assert!(BillingError::InsufficientCredits {
            balance: 1,
            required: 2
        }
        .is_denial());
        assert!(BillingError::SubscriptionInactive { status: None }.is_denial());
        assert!(!BillingError::Storage("x".into()).is_denial());
        assert!(BillingError::ProviderError("timeout".into()).is_retryable());
    }
}
