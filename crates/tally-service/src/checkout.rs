//! Hosted checkout orchestration.
//!
//! The intent is marked pending before the provider is called, so a crash
//! or timeout mid-call leaves a pending intent that the poller or a later
//! callback resolves. Only a definite rejection cancels it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tally_core::{BillingError, PaymentIntent, Result};

use crate::config::ServiceConfig;
use crate::engine::Engine;
use crate::provider::{PaymentProvider, ProviderError};

/// Initial backoff between retried provider calls (doubles each attempt).
const INITIAL_BACKOFF_MS: u64 = 100;

/// Backoff ceiling.
const MAX_BACKOFF_MS: u64 = 5000;

/// Bounds applied to checkout creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutPolicy {
    /// Bound on a single provider call.
    pub timeout: Duration,
    /// Attempts after the first for retryable errors.
    pub max_retries: u32,
    /// First backoff.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl CheckoutPolicy {
    /// Policy from service configuration.
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.provider_timeout_ms),
            max_retries: config.provider_max_retries,
            ..Self::default()
        }
    }
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Send the user to the provider.
    Redirect {
        /// The pending intent, now carrying the provider reference.
        intent: PaymentIntent,
        /// Hosted checkout URL.
        redirect_url: String,
    },
    /// The provider did not answer in time; the intent stays pending and
    /// will be reconciled later.
    Pending {
        /// The pending intent.
        intent: PaymentIntent,
    },
}

impl CheckoutOutcome {
    /// The intent in either case.
    #[must_use]
    pub const fn intent(&self) -> &PaymentIntent {
        match self {
            Self::Redirect { intent, .. } | Self::Pending { intent } => intent,
        }
    }
}

/// Open a hosted checkout for `intent`.
///
/// # Errors
///
/// - `InvalidTransition` if the intent is already final.
/// - `ProviderError` / `InvalidPayload` if the provider definitively
///   rejected the request; the intent is canceled first.
pub async fn start_checkout(
    engine: &Arc<Engine>,
    provider: &dyn PaymentProvider,
    policy: CheckoutPolicy,
    intent: &PaymentIntent,
) -> Result<CheckoutOutcome> {
    let intent_id = intent.id;
    let intent = engine
        .run_blocking(move |engine| engine.begin_checkout(intent_id))
        .await?;
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        let result = tokio::time::timeout(policy.timeout, provider.create_checkout(&intent))
            .await
            .unwrap_or(Err(ProviderError::Timeout));

        match result {
            Ok(session) => {
                let reference = session.provider_reference.clone();
                let intent = engine
                    .run_blocking(move |engine| {
                        engine.attach_provider_reference(intent_id, &reference)
                    })
                    .await?;
                tracing::info!(
                    intent_id = %intent.id,
                    provider = provider.name(),
                    provider_reference = %session.provider_reference,
                    "Checkout session created"
                );
                return Ok(CheckoutOutcome::Redirect {
                    intent,
                    redirect_url: session.redirect_url,
                });
            }
            Err(ProviderError::Timeout) => {
                tracing::warn!(
                    intent_id = %intent.id,
                    provider = provider.name(),
                    timeout_ms = u64::try_from(policy.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Checkout creation timed out, intent left pending"
                );
                return Ok(CheckoutOutcome::Pending { intent });
            }
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt > policy.max_retries {
                    tracing::warn!(
                        intent_id = %intent.id,
                        attempt,
                        error = %e,
                        "Checkout creation failed after max retries, intent left pending"
                    );
                    return Ok(CheckoutOutcome::Pending { intent });
                }

                tracing::debug!(
                    intent_id = %intent.id,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Checkout creation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) => {
                tracing::error!(
                    intent_id = %intent.id,
                    provider = provider.name(),
                    error = %e,
                    "Provider rejected checkout"
                );
                engine
                    .run_blocking(move |engine| engine.cancel_intent(intent_id))
                    .await?;
                return Err(BillingError::from(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::fixture;
    use crate::provider::{CheckoutSession, ProviderEvent, ProviderPaymentStatus};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tally_core::{AccountId, BillingPeriod, IntentStatus, PlanId};

    enum Step {
        Ok,
        Unavailable,
        Rejected,
        Hang,
    }

    struct ScriptedProvider {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PaymentProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn create_checkout(
            &self,
            intent: &PaymentIntent,
        ) -> std::result::Result<CheckoutSession, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Ok);
            match step {
                Step::Ok => Ok(CheckoutSession {
                    provider_reference: format!("cs_{}", intent.id),
                    redirect_url: "https://pay.test/session".into(),
                }),
                Step::Unavailable => Err(ProviderError::Api {
                    status: 503,
                    error_type: "api_error".into(),
                    message: "unavailable".into(),
                    code: None,
                }),
                Step::Rejected => Err(ProviderError::Api {
                    status: 400,
                    error_type: "invalid_request_error".into(),
                    message: "bad currency".into(),
                    code: None,
                }),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("timeout fires first")
                }
            }
        }

        fn verify_callback(
            &self,
            _payload: &str,
            _signature: Option<&str>,
        ) -> std::result::Result<ProviderEvent, ProviderError> {
            Err(ProviderError::Configuration("not used".into()))
        }

        async fn fetch_status(
            &self,
            _provider_reference: &str,
        ) -> std::result::Result<ProviderPaymentStatus, ProviderError> {
            Err(ProviderError::Configuration("not used".into()))
        }
    }

    fn intent_for(engine: &Engine) -> PaymentIntent {
        let account = AccountId::generate();
        engine.open_account(account).unwrap();
        engine
            .create_intent(account, PlanId::Pro, BillingPeriod::Monthly)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_attaches_reference() {
        let fx = fixture();
        let intent = intent_for(&fx.engine);
        let provider = ScriptedProvider::new(vec![Step::Ok]);

        let outcome = start_checkout(&fx.engine, &provider, CheckoutPolicy::default(), &intent)
            .await
            .unwrap();

        let CheckoutOutcome::Redirect { intent, redirect_url } = outcome else {
            panic!("expected redirect");
        };
        assert_eq!(redirect_url, "https://pay.test/session");
        assert_eq!(intent.status, IntentStatus::Pending);
        assert!(intent.provider_reference.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_are_retried() {
        let fx = fixture();
        let intent = intent_for(&fx.engine);
        let provider = ScriptedProvider::new(vec![Step::Unavailable, Step::Unavailable, Step::Ok]);

        let outcome = start_checkout(&fx.engine, &provider, CheckoutPolicy::default(), &intent)
            .await
            .unwrap();

        assert!(matches!(outcome, CheckoutOutcome::Redirect { .. }));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_intent_pending() {
        let fx = fixture();
        let intent = intent_for(&fx.engine);
        let provider = ScriptedProvider::new(vec![
            Step::Unavailable,
            Step::Unavailable,
            Step::Unavailable,
            Step::Unavailable,
        ]);

        let outcome = start_checkout(&fx.engine, &provider, CheckoutPolicy::default(), &intent)
            .await
            .unwrap();

        assert!(matches!(outcome, CheckoutOutcome::Pending { .. }));
        assert_eq!(provider.calls(), 4);
        assert_eq!(fx.engine.intent(intent.id).unwrap().status, IntentStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_intent_pending() {
        let fx = fixture();
        let intent = intent_for(&fx.engine);
        let provider = ScriptedProvider::new(vec![Step::Hang]);

        let outcome = start_checkout(&fx.engine, &provider, CheckoutPolicy::default(), &intent)
            .await
            .unwrap();

        assert!(matches!(outcome, CheckoutOutcome::Pending { .. }));
        assert_eq!(provider.calls(), 1);
        assert!(fx.engine.intent(intent.id).unwrap().provider_reference.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_cancels_intent() {
        let fx = fixture();
        let intent = intent_for(&fx.engine);
        let provider = ScriptedProvider::new(vec![Step::Rejected]);

        let err = start_checkout(&fx.engine, &provider, CheckoutPolicy::default(), &intent)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ProviderError(_)));
        assert_eq!(
            fx.engine.intent(intent.id).unwrap().status,
            IntentStatus::Canceled
        );
    }

    #[test]
    fn policy_follows_config() {
        let config = ServiceConfig {
            provider_timeout_ms: 2500,
            provider_max_retries: 1,
            ..ServiceConfig::default()
        };
        let policy = CheckoutPolicy::from_config(&config);
        assert_eq!(policy.timeout, Duration::from_millis(2500));
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.max_backoff, Duration::from_millis(MAX_BACKOFF_MS));
    }
}
