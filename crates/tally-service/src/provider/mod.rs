//! Payment provider adapter.
//!
//! The provider hosts checkout, signs its callbacks and can be polled for
//! the status of a session. Everything it tells us is normalized into a
//! [`ProviderEvent`] before it reaches the engine.

pub mod signature;
pub mod stripe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_core::{AccountId, BillingError, PaymentIntent, PaymentIntentId};

pub use stripe::StripeProvider;

/// Error type for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider rejected the request.
    #[error("provider API error ({status}): {error_type} - {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Provider error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Provider error code.
        code: Option<String>,
    },

    /// The call did not finish within the configured bound.
    #[error("provider call timed out")]
    Timeout,

    /// Callback signature missing, malformed or wrong.
    #[error("invalid callback signature: {0}")]
    InvalidSignature(String),

    /// Callback or response body could not be understood.
    #[error("invalid provider payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Whether the same call may succeed if repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout => true,
            Self::InvalidSignature(_)
            | Self::InvalidPayload(_)
            | Self::Serialization(_)
            | Self::Configuration(_) => false,
        }
    }
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidSignature(_) | ProviderError::InvalidPayload(_) => {
                Self::InvalidPayload(err.to_string())
            }
            other => Self::ProviderError(other.to_string()),
        }
    }
}

/// A hosted checkout created for an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Provider-side session id, stored on the intent.
    pub provider_reference: String,
    /// Where to send the user.
    pub redirect_url: String,
}

/// Normalized callback kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEventKind {
    /// The checkout was paid.
    CheckoutSucceeded,
    /// The payment was declined.
    CheckoutFailed,
    /// The session expired unpaid.
    CheckoutExpired,
    /// A renewal charge failed.
    RenewalFailed,
    /// A payment method was saved for the customer.
    PaymentMethodAttached,
    /// Anything else; acknowledged and ignored.
    Other(String),
}

impl ProviderEventKind {
    /// Map a provider-neutral event type name.
    #[must_use]
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.succeeded" => Self::CheckoutSucceeded,
            "checkout.failed" => Self::CheckoutFailed,
            "checkout.expired" => Self::CheckoutExpired,
            "renewal.failed" => Self::RenewalFailed,
            "payment_method.attached" => Self::PaymentMethodAttached,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A verified provider callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Provider event id.
    pub event_id: String,
    /// What happened.
    pub kind: ProviderEventKind,
    /// Checkout session id, when the event concerns one.
    pub provider_reference: Option<String>,
    /// Our intent id, echoed back by the provider.
    pub intent_id: Option<PaymentIntentId>,
    /// Account, for events not tied to an intent.
    pub account_id: Option<AccountId>,
    /// Captured amount in minor units.
    pub amount_minor: Option<i64>,
    /// Currency of `amount_minor`.
    pub currency: Option<String>,
}

/// Where a checkout session stands according to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Still waiting for the customer.
    Open,
    /// Paid.
    Paid,
    /// Declined.
    Failed,
    /// Expired unpaid.
    Expired,
}

/// Result of polling a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPaymentStatus {
    /// Session state.
    pub state: PaymentState,
    /// Amount in minor units.
    pub amount_minor: Option<i64>,
    /// Currency.
    pub currency: Option<String>,
    /// Our intent id, if the provider echoes it.
    pub intent_id: Option<PaymentIntentId>,
}

impl ProviderPaymentStatus {
    /// Turn a terminal poll result into the event a callback would have
    /// delivered. `None` while the session is open.
    #[must_use]
    pub fn into_event(self, provider_reference: &str) -> Option<ProviderEvent> {
        let kind = match self.state {
            PaymentState::Open => return None,
            PaymentState::Paid => ProviderEventKind::CheckoutSucceeded,
            PaymentState::Failed => ProviderEventKind::CheckoutFailed,
            PaymentState::Expired => ProviderEventKind::CheckoutExpired,
        };
        Some(ProviderEvent {
            event_id: format!("poll:{provider_reference}"),
            kind,
            provider_reference: Some(provider_reference.to_string()),
            intent_id: self.intent_id,
            account_id: None,
            amount_minor: self.amount_minor,
            currency: self.currency,
        })
    }
}

/// Adapter over a hosted-checkout payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Create a hosted checkout for `intent`.
    async fn create_checkout(&self, intent: &PaymentIntent)
        -> Result<CheckoutSession, ProviderError>;

    /// Authenticate and parse a callback body.
    fn verify_callback(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<ProviderEvent, ProviderError>;

    /// Ask the provider where a session stands.
    async fn fetch_status(
        &self,
        provider_reference: &str,
    ) -> Result<ProviderPaymentStatus, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_event_names() {
        assert_eq!(
            ProviderEventKind::from_type("checkout.succeeded"),
            ProviderEventKind::CheckoutSucceeded
        );
        assert_eq!(
            ProviderEventKind::from_type("customer.created"),
            ProviderEventKind::Other("customer.created".into())
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(ProviderError::Timeout.is_retryable());
        let server = ProviderError::Api {
            status: 503,
            error_type: "api_error".into(),
            message: "down".into(),
            code: None,
        };
        assert!(server.is_retryable());
        let card = ProviderError::Api {
            status: 402,
            error_type: "card_error".into(),
            message: "declined".into(),
            code: Some("card_declined".into()),
        };
        assert!(!card.is_retryable());
        assert!(matches!(
            BillingError::from(ProviderError::InvalidSignature("bad".into())),
            BillingError::InvalidPayload(_)
        ));
    }

    #[test]
    fn open_poll_has_no_event() {
        let status = ProviderPaymentStatus {
            state: PaymentState::Open,
            amount_minor: None,
            currency: None,
            intent_id: None,
        };
        assert!(status.into_event("cs_1").is_none());
    }
}
