//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tally_core::BillingError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Engine error, mapped per kind.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Feature not configured on this deployment.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::Billing(err) => {
                let (status, code, details) = billing_parts(err);
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "An internal error occurred".to_string()
                } else {
                    err.to_string()
                };
                (status, code, message, details)
            }
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Status, code and structured details for an engine error.
fn billing_parts(err: &BillingError) -> (StatusCode, &'static str, Option<serde_json::Value>) {
    match err {
        BillingError::InsufficientCredits { balance, required } => (
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            Some(json!({ "balance": balance, "required": required })),
        ),
        BillingError::QuotaExceeded {
            resource,
            limit,
            used,
            requested,
        } => (
            StatusCode::FORBIDDEN,
            "quota_exceeded",
            Some(json!({
                "resource": resource,
                "limit": limit,
                "used": used,
                "requested": requested,
            })),
        ),
        BillingError::SubscriptionInactive { status } => (
            StatusCode::FORBIDDEN,
            "subscription_inactive",
            Some(json!({ "status": status })),
        ),
        BillingError::DuplicateOperation { reference_id } => (
            StatusCode::CONFLICT,
            "duplicate_operation",
            Some(json!({ "reference_id": reference_id })),
        ),
        BillingError::InvalidTransition { from, event } => (
            StatusCode::CONFLICT,
            "invalid_transition",
            Some(json!({ "from": from, "event": event })),
        ),
        BillingError::PlanLimitExceeded { ceiling, attempted } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "plan_limit_exceeded",
            Some(json!({ "ceiling": ceiling, "attempted": attempted })),
        ),
        BillingError::IntegrityViolation {
            account_id,
            cached,
            ledger,
        } => {
            tracing::error!(
                account_id = %account_id,
                cached,
                ledger,
                "Request refused: account frozen"
            );
            (StatusCode::LOCKED, "integrity_violation", None)
        }
        BillingError::ProviderError(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "provider_error", None)
        }
        BillingError::AccountNotFound { .. }
        | BillingError::SubscriptionNotFound { .. }
        | BillingError::PlanNotFound { .. }
        | BillingError::EntryNotFound { .. }
        | BillingError::IntentNotFound { .. } => (StatusCode::NOT_FOUND, "not_found", None),
        BillingError::AccountAlreadyExists { .. } => (StatusCode::CONFLICT, "conflict", None),
        BillingError::InvalidAmount(_)
        | BillingError::InvalidPayload(_)
        | BillingError::InvalidId(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
        BillingError::Storage(msg) => {
            tracing::error!(error = %msg, "Storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None)
        }
    }
}

impl From<tally_store::StoreError> for ApiError {
    fn from(err: tally_store::StoreError) -> Self {
        Self::Billing(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::AccountId;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn denials_map_to_client_statuses() {
        assert_eq!(
            status_of(BillingError::InsufficientCredits {
                balance: 1,
                required: 2
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(BillingError::SubscriptionInactive { status: None }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(BillingError::PlanLimitExceeded {
                ceiling: 10,
                attempted: 11
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn faults_map_to_server_statuses() {
        assert_eq!(
            status_of(BillingError::IntegrityViolation {
                account_id: AccountId::generate(),
                cached: 1,
                ledger: 0
            }),
            StatusCode::LOCKED
        );
        assert_eq!(
            status_of(BillingError::ProviderError("timeout".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
