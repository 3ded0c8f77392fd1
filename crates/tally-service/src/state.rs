//! Application state.

use std::sync::Arc;
use std::time::Duration;

use tally_store::Store;

use crate::audit::{AuditSink, FanoutSink, TracingSink, WebhookSink};
use crate::checkout::CheckoutPolicy;
use crate::config::ServiceConfig;
use crate::engine::Engine;
use crate::error::ApiError;
use crate::provider::{PaymentProvider, StripeProvider};

/// Delivery timeout for audit webhook calls.
const AUDIT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The ledger engine.
    pub engine: Arc<Engine>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Payment provider (optional).
    pub provider: Option<Arc<dyn PaymentProvider>>,

    /// Bounds for checkout creation.
    pub checkout: CheckoutPolicy,
}

impl AppState {
    /// Create a new application state. Must be called inside a tokio
    /// runtime when an audit webhook is configured.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let sink = build_audit_sink(&config);
        let engine = Arc::new(Engine::new(store, config.engine.clone(), sink));

        // Create payment provider if configured
        let provider = config.payment_api_key.as_ref().and_then(|key| {
            let created = StripeProvider::new(
                key,
                config.payment_webhook_secret.clone(),
                config.checkout_success_url(),
                config.checkout_cancel_url(),
                Duration::from_millis(config.provider_timeout_ms),
            );
            match created {
                Ok(provider) => {
                    let provider = match &config.payment_api_base_url {
                        Some(url) => provider.with_base_url(url),
                        None => provider,
                    }
                    .with_tolerance_secs(config.webhook_tolerance_secs);
                    if config.payment_webhook_secret.is_none() {
                        tracing::warn!(
                            "Payment webhook secret not configured - callbacks will be rejected"
                        );
                    }
                    tracing::info!(provider = provider.name(), "Payment integration enabled");
                    Some(Arc::new(provider) as Arc<dyn PaymentProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create payment provider");
                    None
                }
            }
        });

        if provider.is_none() {
            tracing::warn!("Payment provider not configured - checkout will not be available");
        }

        let checkout = CheckoutPolicy::from_config(&config);
        Self {
            engine,
            config,
            provider,
            checkout,
        }
    }

    /// Assemble state from prebuilt parts.
    #[must_use]
    pub fn with_parts(
        engine: Arc<Engine>,
        config: ServiceConfig,
        provider: Option<Arc<dyn PaymentProvider>>,
    ) -> Self {
        let checkout = CheckoutPolicy::from_config(&config);
        Self {
            engine,
            config,
            provider,
            checkout,
        }
    }

    /// Check if a payment provider is configured.
    #[must_use]
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// The payment provider, or 503 when none is configured.
    pub fn provider(&self) -> Result<&Arc<dyn PaymentProvider>, ApiError> {
        self.provider
            .as_ref()
            .ok_or_else(|| ApiError::ServiceUnavailable("payments not configured".into()))
    }
}

fn build_audit_sink(config: &ServiceConfig) -> Arc<dyn AuditSink> {
    let Some(url) = &config.audit_webhook_url else {
        tracing::warn!("Audit webhook not configured - audit events go to the log only");
        return Arc::new(TracingSink);
    };

    if config.audit_webhook_secret.is_none() {
        tracing::warn!("Audit webhook secret not configured - deliveries will be unsigned");
    }
    tracing::info!(url = %url, "Audit webhook enabled");

    Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(WebhookSink::spawn(
                url.clone(),
                config.audit_webhook_secret.clone(),
                AUDIT_WEBHOOK_TIMEOUT,
            ))),
    )
}
