//! Stripe-style hosted checkout adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tally_core::{AccountId, PaymentIntent, PaymentIntentId};

use super::signature::{self, DEFAULT_TOLERANCE_SECS};
use super::{
    CheckoutSession, PaymentProvider, PaymentState, ProviderError, ProviderEvent,
    ProviderEventKind, ProviderPaymentStatus,
};

/// Stripe API base URL.
pub const BASE_URL: &str = "https://api.stripe.com/v1";

/// Checkout session as returned by the API.
#[derive(Debug, Clone, Deserialize)]
struct StripeSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Payment provider backed by Stripe Checkout.
#[derive(Debug, Clone)]
pub struct StripeProvider {
    client: Client,
    api_key: String,
    webhook_secret: Option<String>,
    base_url: String,
    success_url: String,
    cancel_url: String,
    tolerance_secs: i64,
}

impl StripeProvider {
    /// Create a provider.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Secret API key (`sk_test_...` or `sk_live_...`)
    /// * `webhook_secret` - Callback signing secret; callbacks are rejected without it
    /// * `timeout` - Per-request HTTP timeout
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(
        api_key: impl Into<String>,
        webhook_secret: Option<String>,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            webhook_secret,
            base_url: BASE_URL.to_string(),
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        })
    }

    /// Point the client at another API root (tests, proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Change the accepted signature age.
    #[must_use]
    pub const fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<StripeErrorResponse, _> = response.json().await;

        match error_body {
            Ok(stripe_error) => Err(ProviderError::Api {
                status: status.as_u16(),
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(ProviderError::Api {
                status: status.as_u16(),
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_checkout(
        &self,
        intent: &PaymentIntent,
    ) -> Result<CheckoutSession, ProviderError> {
        let intent_id = intent.id.to_string();
        let params = vec![
            ("mode", "payment".to_string()),
            ("success_url", self.success_url.clone()),
            ("cancel_url", self.cancel_url.clone()),
            ("client_reference_id", intent_id.clone()),
            ("line_items[0][price_data][currency]", intent.currency.clone()),
            (
                "line_items[0][price_data][product_data][name]",
                format!("{} ({})", intent.plan_id, intent.billing_period.as_str()),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                intent.amount_minor.to_string(),
            ),
            ("line_items[0][quantity]", "1".to_string()),
            ("metadata[intent_id]", intent_id.clone()),
            ("metadata[account_id]", intent.account_id.to_string()),
            ("metadata[plan_id]", intent.plan_id.to_string()),
            (
                "metadata[billing_period]",
                intent.billing_period.as_str().to_string(),
            ),
        ];

        tracing::debug!(
            intent_id = %intent.id,
            account_id = %intent.account_id,
            amount_minor = intent.amount_minor,
            "Creating checkout session"
        );

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .header("Idempotency-Key", &intent_id)
            .form(&params)
            .send()
            .await?;

        let session: StripeSession = self.handle_response(response).await?;
        let redirect_url = session.url.ok_or_else(|| {
            ProviderError::InvalidPayload(format!("session {} has no url", session.id))
        })?;

        Ok(CheckoutSession {
            provider_reference: session.id,
            redirect_url,
        })
    }

    fn verify_callback(
        &self,
        payload: &str,
        signature_header: Option<&str>,
    ) -> Result<ProviderEvent, ProviderError> {
        let secret = self
            .webhook_secret
            .as_ref()
            .ok_or_else(|| ProviderError::Configuration("webhook secret not configured".into()))?;
        let header =
            signature_header.ok_or_else(|| ProviderError::InvalidSignature("missing header".into()))?;

        signature::verify(
            secret,
            payload,
            header,
            chrono::Utc::now().timestamp(),
            self.tolerance_secs,
        )?;

        let event: StripeEvent = serde_json::from_str(payload)?;
        Ok(normalize(event))
    }

    async fn fetch_status(
        &self,
        provider_reference: &str,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let response = self
            .client
            .get(format!(
                "{}/checkout/sessions/{}",
                self.base_url, provider_reference
            ))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await?;

        let session: StripeSession = self.handle_response(response).await?;
        let state = match (
            session.status.as_deref(),
            session.payment_status.as_deref(),
        ) {
            (_, Some("paid" | "no_payment_required")) => PaymentState::Paid,
            (Some("expired"), _) => PaymentState::Expired,
            _ => PaymentState::Open,
        };

        Ok(ProviderPaymentStatus {
            state,
            intent_id: intent_id_of(session.client_reference_id.as_deref(), &session.metadata),
            amount_minor: session.amount_total,
            currency: session.currency,
        })
    }
}

/// Map a Stripe event onto the neutral model.
fn normalize(event: StripeEvent) -> ProviderEvent {
    let object = &event.data.object;
    let text = |field: &str| object.get(field).and_then(|v| v.as_str()).map(String::from);
    let metadata = object.get("metadata").cloned().unwrap_or_default();
    let paid = text("payment_status").as_deref() == Some("paid");

    let kind = match event.event_type.as_str() {
        "checkout.session.completed" if paid => ProviderEventKind::CheckoutSucceeded,
        "checkout.session.async_payment_succeeded" => ProviderEventKind::CheckoutSucceeded,
        "checkout.session.async_payment_failed" => ProviderEventKind::CheckoutFailed,
        "checkout.session.expired" => ProviderEventKind::CheckoutExpired,
        "invoice.payment_failed" => ProviderEventKind::RenewalFailed,
        "setup_intent.succeeded" => ProviderEventKind::PaymentMethodAttached,
        other => ProviderEventKind::from_type(other),
    };

    let is_session = object.get("object").and_then(|v| v.as_str()) == Some("checkout.session");
    let account_id = metadata
        .get("account_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<AccountId>().ok());

    ProviderEvent {
        event_id: event.id,
        provider_reference: if is_session { text("id") } else { None },
        intent_id: intent_id_of(text("client_reference_id").as_deref(), &metadata),
        account_id,
        amount_minor: object.get("amount_total").and_then(serde_json::Value::as_i64),
        currency: text("currency"),
        kind,
    }
}

fn intent_id_of(
    client_reference_id: Option<&str>,
    metadata: &serde_json::Value,
) -> Option<PaymentIntentId> {
    client_reference_id
        .or_else(|| metadata.get("intent_id").and_then(|v| v.as_str()))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> StripeProvider {
        StripeProvider::new(
            "sk_test_xxx",
            Some("whsec_test".into()),
            "https://app.test/ok",
            "https://app.test/cancel",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn signed(payload: &serde_json::Value) -> (String, String) {
        let body = payload.to_string();
        let header = signature::sign("whsec_test", &body, chrono::Utc::now().timestamp());
        (body, header)
    }

    #[test]
    fn paid_session_is_success() {
        let intent_id = PaymentIntentId::generate();
        let account_id = AccountId::generate();
        let (body, header) = signed(&json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "object": "checkout.session",
                "id": "cs_1",
                "payment_status": "paid",
                "client_reference_id": intent_id.to_string(),
                "amount_total": 999,
                "currency": "usd",
                "metadata": { "account_id": account_id.to_string() }
            }}
        }));

        let event = provider().verify_callback(&body, Some(&header)).unwrap();
        assert_eq!(event.kind, ProviderEventKind::CheckoutSucceeded);
        assert_eq!(event.provider_reference.as_deref(), Some("cs_1"));
        assert_eq!(event.intent_id, Some(intent_id));
        assert_eq!(event.account_id, Some(account_id));
        assert_eq!(event.amount_minor, Some(999));
    }

    #[test]
    fn unpaid_completion_is_not_success() {
        let (body, header) = signed(&json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": { "object": { "object": "checkout.session", "id": "cs_2", "payment_status": "unpaid" } }
        }));

        let event = provider().verify_callback(&body, Some(&header)).unwrap();
        assert!(matches!(event.kind, ProviderEventKind::Other(_)));
    }

    #[test]
    fn missing_signature_is_rejected() {
        let result = provider().verify_callback("{}", None);
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[test]
    fn without_secret_callbacks_fail_closed() {
        let provider = StripeProvider::new("sk", None, "a", "b", Duration::from_secs(1)).unwrap();
        let header = signature::sign("whsec_test", "{}", chrono::Utc::now().timestamp());
        assert!(matches!(
            provider.verify_callback("{}", Some(&header)),
            Err(ProviderError::Configuration(_))
        ));
    }
}
