//! Tally HTTP client implementation.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_core::{AccountId, Feature, Resource, SubscriptionStatus};

use crate::error::{ClientError, MeteredError};
use crate::types::{
    ApiErrorResponse, Authorization, AuthorizeRequest, AuthorizeResponse, CheckRequest,
    CompensateRequest, CompensateResponse, Entitlements, Metered,
};

/// Tally API client for service-to-service calls.
#[derive(Debug, Clone)]
pub struct TallyClient {
    client: Client,
    base_url: String,
    api_key: String,
    service_name: String,
}

impl TallyClient {
    /// Create a client with default options.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the tally service (e.g., `"http://tally:8080"`)
    /// * `api_key` - Service API key
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a client with custom options.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            service_name: options.service_name,
        })
    }

    /// Authorize a feature and debit its cost.
    ///
    /// Idempotent on `reference_id`: a replay returns the original debit with
    /// `duplicate` set.
    ///
    /// # Errors
    ///
    /// Denials come back as `SubscriptionInactive`, `QuotaExceeded` or
    /// `InsufficientCredits`; a frozen account as `AccountFrozen`.
    pub async fn authorize(
        &self,
        account_id: AccountId,
        feature: Feature,
        units: u64,
        reference_id: impl Into<String>,
    ) -> Result<AuthorizeResponse, ClientError> {
        let request = AuthorizeRequest {
            account_id,
            feature,
            units,
            reference_id: reference_id.into(),
        };
        let response: AuthorizeResponse = self.post("/v1/usage/authorize", &request).await?;

        tracing::debug!(
            account_id = %account_id,
            feature = %feature,
            cost = response.cost,
            duplicate = response.duplicate,
            "Usage authorized"
        );
        Ok(response)
    }

    /// Reverse a debit after the metered action failed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown entry, or a transport/server error.
    pub async fn compensate(&self, entry_id: &str) -> Result<CompensateResponse, ClientError> {
        self.post("/v1/usage/compensate", &CompensateRequest { entry_id })
            .await
    }

    /// Evaluate a request without charging.
    ///
    /// # Errors
    ///
    /// Returns the same denials as [`TallyClient::authorize`].
    pub async fn check(
        &self,
        account_id: AccountId,
        feature: Feature,
        units: u64,
    ) -> Result<Authorization, ClientError> {
        self.post(
            "/v1/usage/check",
            &CheckRequest {
                account_id,
                feature,
                units,
            },
        )
        .await
    }

    /// Plan, quotas and balance of an account.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown account.
    pub async fn entitlements(&self, account_id: AccountId) -> Result<Entitlements, ClientError> {
        let url = format!("{}/v1/accounts/{account_id}/entitlements", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Authorize and debit, run `action`, and compensate if it fails.
    ///
    /// A duplicate `reference_id` returns [`Metered::AlreadyCharged`] without
    /// running the action.
    ///
    /// # Errors
    ///
    /// `MeteredError::Denied` if the debit was refused, `MeteredError::Action`
    /// if the action failed.
    pub async fn metered<T, E, F, Fut>(
        &self,
        account_id: AccountId,
        feature: Feature,
        units: u64,
        reference_id: &str,
        action: F,
    ) -> Result<Metered<T>, MeteredError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let debit = self
            .authorize(account_id, feature, units, reference_id)
            .await
            .map_err(MeteredError::Denied)?;
        if debit.duplicate {
            return Ok(Metered::AlreadyCharged(debit));
        }

        match action().await {
            Ok(output) => Ok(Metered::Ran { debit, output }),
            Err(error) => {
                tracing::warn!(
                    account_id = %account_id,
                    entry_id = %debit.entry_id,
                    error = %error,
                    "Metered action failed, compensating"
                );
                let compensation = self.compensate(&debit.entry_id).await.err();
                if let Some(e) = &compensation {
                    tracing::error!(
                        account_id = %account_id,
                        entry_id = %debit.entry_id,
                        error = %e,
                        "Compensation failed; debit left standing"
                    );
                }
                Err(MeteredError::Action {
                    error,
                    compensation,
                })
            }
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("x-service-name", &self.service_name)
            .json(body)
            .send()
            .await?;

        handle_response(response).await
    }
}

/// Decode a success body or map the error body onto a typed error.
async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response.json().await?);
    }

    let Ok(api_error) = response.json::<ApiErrorResponse>().await else {
        return Err(ClientError::Api {
            code: "unknown".to_string(),
            message: format!("HTTP {status}"),
            status: status.as_u16(),
        });
    };

    let details = api_error.error.details.unwrap_or_default();
    let int = |field: &str| details.get(field).and_then(serde_json::Value::as_i64);
    let count = |field: &str| details.get(field).and_then(serde_json::Value::as_u64);

    let err = match api_error.error.code.as_str() {
        "insufficient_credits" => ClientError::InsufficientCredits {
            balance: int("balance").unwrap_or(0),
            required: int("required").unwrap_or(0),
        },
        "quota_exceeded" => {
            let resource = details
                .get("resource")
                .cloned()
                .map(serde_json::from_value::<Resource>)
                .transpose()?;
            match resource {
                Some(resource) => ClientError::QuotaExceeded {
                    resource,
                    limit: count("limit"),
                    used: count("used").unwrap_or(0),
                },
                None => ClientError::Api {
                    code: api_error.error.code,
                    message: api_error.error.message,
                    status: status.as_u16(),
                },
            }
        }
        "subscription_inactive" => ClientError::SubscriptionInactive {
            status: details
                .get("status")
                .cloned()
                .map(serde_json::from_value::<Option<SubscriptionStatus>>)
                .transpose()?
                .flatten(),
        },
        "integrity_violation" => ClientError::AccountFrozen,
        "not_found" => ClientError::NotFound {
            message: api_error.error.message,
        },
        _ => ClientError::Api {
            code: api_error.error.code,
            message: api_error.error.message,
            status: status.as_u16(),
        },
    };
    Err(err)
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 10).
    pub timeout_seconds: u64,
    /// Service name sent with each request.
    pub service_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            service_name: "unknown".to_string(),
        }
    }
}

impl ClientOptions {
    /// Create options with a service name.
    #[must_use]
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }
}
