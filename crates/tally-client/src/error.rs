//! Client error types.

use tally_core::{Resource, SubscriptionStatus};

/// Errors that can occur when calling the tally service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response not covered below.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The balance does not cover the request.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Credits the request would cost.
        required: i64,
    },

    /// A non-credit limit denies the request.
    #[error("quota exceeded for {resource}: {used}/{limit:?}")]
    QuotaExceeded {
        /// Limited resource.
        resource: Resource,
        /// Plan limit.
        limit: Option<u64>,
        /// Units already used.
        used: u64,
    },

    /// No entitled subscription.
    #[error("subscription inactive: {status:?}")]
    SubscriptionInactive {
        /// Status of the current record, if any.
        status: Option<SubscriptionStatus>,
    },

    /// The account is frozen pending reconciliation.
    #[error("account frozen pending reconciliation")]
    AccountFrozen,

    /// Account or entry not found.
    #[error("not found: {message}")]
    NotFound {
        /// Server message.
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether this is an entitlement denial rather than a transport or
    /// server fault.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredits { .. }
                | Self::QuotaExceeded { .. }
                | Self::SubscriptionInactive { .. }
        )
    }
}

/// Failure of [`crate::TallyClient::metered`].
#[derive(Debug, thiserror::Error)]
pub enum MeteredError<E> {
    /// The debit was refused or could not be made; the action did not run.
    #[error(transparent)]
    Denied(ClientError),

    /// The action failed. `compensation` holds the error if the refund
    /// could not be posted either.
    #[error("metered action failed")]
    Action {
        /// Action error.
        error: E,
        /// Error from the compensating call, if it failed.
        compensation: Option<ClientError>,
    },
}
