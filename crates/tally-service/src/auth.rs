//! Authentication extractors.
//!
//! - `AuthUser` - End-user authentication via HS256 JWT
//! - `ServiceAuth` - Service-to-service authentication via API key
//! - `AdminAuth` - Admin authentication for operator endpoints

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use tally_core::AccountId;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// An authenticated end user. The JWT subject is the account id.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The account id.
    pub account_id: AccountId,
    /// The raw subject claim from the JWT.
    pub subject: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = header(parts, "authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        // Test tokens are compiled in only for tests and the `test-auth`
        // feature.
        #[cfg(any(test, feature = "test-auth"))]
        if let Some(id) = token.strip_prefix("test-token:") {
            let account_id = id.parse::<AccountId>().map_err(|_| ApiError::Unauthorized)?;
            return Ok(AuthUser {
                account_id,
                subject: id.to_string(),
            });
        }

        let claims = validate_jwt(token, state)?;
        let account_id = claims
            .sub
            .parse::<AccountId>()
            .map_err(|_| ApiError::Unauthorized)?;

        Ok(AuthUser {
            account_id,
            subject: claims.sub,
        })
    }
}

/// Service authentication via API key.
///
/// Used by the chat, agent and task subsystems.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The calling service.
    pub service_name: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let api_key = header(parts, "x-api-key").ok_or(ApiError::Unauthorized)?;
        let expected = state
            .config
            .service_api_key
            .as_deref()
            .ok_or(ApiError::Unauthorized)?;

        if !constant_time_eq(api_key, expected) {
            return Err(ApiError::Unauthorized);
        }

        let service_name = header(parts, "x-service-name")
            .unwrap_or("unknown")
            .to_string();

        Ok(ServiceAuth { service_name })
    }
}

/// Admin authentication for operator endpoints.
///
/// Requires the `X-Admin-Key` header to match the configured admin key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let admin_key = header(parts, "x-admin-key").ok_or(ApiError::Unauthorized)?;
        let expected = state
            .config
            .admin_api_key
            .as_deref()
            .ok_or(ApiError::Unauthorized)?;

        if !constant_time_eq(admin_key, expected) {
            return Err(ApiError::Unauthorized);
        }

        let admin_id = header(parts, "x-admin-id").unwrap_or("admin").to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(AdminAuth { admin_id })
    }
}

/// JWT claims issued by the auth subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (account id).
    pub sub: String,
    /// Audience (string or array).
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: Option<i64>,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Validate an HS256 JWT against the configured secret.
fn validate_jwt(token: &str, state: &AppState) -> Result<JwtClaims, ApiError> {
    let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
        tracing::warn!("JWT secret not configured - rejecting bearer token");
        ApiError::Unauthorized
    })?;

    let mut validation = Validation::new(Algorithm::HS256);
    match &state.config.jwt_audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let token_data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(error = %e, "JWT validation failed");
        ApiError::Unauthorized
    })?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tally_store::MemoryStore;

    fn state_with(config: ServiceConfig) -> AppState {
        AppState::new(Arc::new(MemoryStore::new()), config)
    }

    fn token(secret: &str, sub: &str, aud: Option<&str>) -> String {
        let claims = JwtClaims {
            sub: sub.to_string(),
            aud: aud.map(|a| serde_json::Value::String(a.to_string())),
            exp: chrono::Utc::now().timestamp() + 600,
            iat: Some(chrono::Utc::now().timestamp()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_jwt_is_accepted() {
        let state = state_with(ServiceConfig {
            jwt_secret: Some("s3cret".into()),
            ..ServiceConfig::default()
        });
        let id = AccountId::generate();

        let claims = validate_jwt(&token("s3cret", &id.to_string(), None), &state).unwrap();
        assert_eq!(claims.sub, id.to_string());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let state = state_with(ServiceConfig {
            jwt_secret: Some("s3cret".into()),
            ..ServiceConfig::default()
        });
        let result = validate_jwt(&token("other", "x", None), &state);
        assert!(matches!(result, Err(ApiError::Unauthorized)));
    }

    #[test]
    fn audience_is_enforced_when_configured() {
        let state = state_with(ServiceConfig {
            jwt_secret: Some("s3cret".into()),
            jwt_audience: Some("tally".into()),
            ..ServiceConfig::default()
        });
        let id = AccountId::generate().to_string();

        assert!(validate_jwt(&token("s3cret", &id, Some("tally")), &state).is_ok());
        assert!(validate_jwt(&token("s3cret", &id, Some("other")), &state).is_err());
    }

    #[test]
    fn missing_secret_rejects_everything() {
        let state = state_with(ServiceConfig::default());
        assert!(validate_jwt(&token("s3cret", "x", None), &state).is_err());
    }
}
