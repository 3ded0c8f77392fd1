//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::engine::EngineSettings;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/tally").
    pub data_dir: String,

    /// HS256 secret used to validate user JWTs.
    pub jwt_secret: Option<String>,

    /// Expected JWT audience, if any.
    pub jwt_audience: Option<String>,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Admin API key for operator endpoints.
    pub admin_api_key: Option<String>,

    /// Payment provider API key (optional).
    pub payment_api_key: Option<String>,

    /// Payment provider callback signing secret (optional).
    pub payment_webhook_secret: Option<String>,

    /// Override of the payment provider API root.
    pub payment_api_base_url: Option<String>,

    /// Frontend URL for checkout redirects.
    pub frontend_url: String,

    /// Bound on a single provider call, in milliseconds.
    pub provider_timeout_ms: u64,

    /// Retries for retryable provider errors during checkout.
    pub provider_max_retries: u32,

    /// Accepted age of a callback signature, in seconds.
    pub webhook_tolerance_secs: i64,

    /// Where to POST audit events (optional).
    pub audit_webhook_url: Option<String>,

    /// Secret for signing audit webhook bodies.
    pub audit_webhook_secret: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Renewal sweep interval.
    pub sweep_interval_secs: u64,

    /// Integrity verification interval.
    pub integrity_interval_secs: u64,

    /// Pending-intent poller interval.
    pub intent_poll_interval_secs: u64,

    /// Pending intents younger than this are left to the callback.
    pub intent_poll_min_age_secs: i64,

    /// Pending intents without a provider reference older than this are canceled.
    pub intent_abandon_after_secs: i64,

    /// Concurrent provider lookups per poll.
    pub intent_poll_concurrency: usize,

    /// Ledger engine tunables.
    pub engine: EngineSettings,
}

/// Payment provider secrets file structure.
#[derive(Debug, Deserialize)]
struct PaymentSecrets {
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let (payment_api_key, payment_webhook_secret, payment_api_base_url) =
            load_payment_secrets();
        let defaults = Self::default();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            jwt_audience: std::env::var("JWT_AUDIENCE").ok(),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            payment_api_key,
            payment_webhook_secret,
            payment_api_base_url,
            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            provider_timeout_ms: env_parse("PROVIDER_TIMEOUT_MS", defaults.provider_timeout_ms),
            provider_max_retries: env_parse("PROVIDER_MAX_RETRIES", defaults.provider_max_retries),
            webhook_tolerance_secs: env_parse(
                "WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance_secs,
            ),
            audit_webhook_url: std::env::var("AUDIT_WEBHOOK_URL").ok(),
            audit_webhook_secret: std::env::var("AUDIT_WEBHOOK_SECRET").ok(),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
            integrity_interval_secs: env_parse(
                "INTEGRITY_INTERVAL_SECS",
                defaults.integrity_interval_secs,
            ),
            intent_poll_interval_secs: env_parse(
                "INTENT_POLL_INTERVAL_SECS",
                defaults.intent_poll_interval_secs,
            ),
            intent_poll_min_age_secs: env_parse(
                "INTENT_POLL_MIN_AGE_SECS",
                defaults.intent_poll_min_age_secs,
            ),
            intent_abandon_after_secs: env_parse(
                "INTENT_ABANDON_AFTER_SECS",
                defaults.intent_abandon_after_secs,
            ),
            intent_poll_concurrency: env_parse(
                "INTENT_POLL_CONCURRENCY",
                defaults.intent_poll_concurrency,
            ),
            engine: EngineSettings {
                balance_ceiling: env_parse("BALANCE_CEILING", defaults.engine.balance_ceiling),
                rollover_factor_percent: env_parse(
                    "ROLLOVER_FACTOR_PERCENT",
                    defaults.engine.rollover_factor_percent,
                ),
                grace_period_days: env_parse(
                    "GRACE_PERIOD_DAYS",
                    defaults.engine.grace_period_days,
                ),
                trial_days: env_parse("TRIAL_DAYS", defaults.engine.trial_days),
                currency: std::env::var("CURRENCY")
                    .map(|c| c.to_lowercase())
                    .unwrap_or(defaults.engine.currency),
            },
        }
    }

    /// Checkout success redirect.
    #[must_use]
    pub fn checkout_success_url(&self) -> String {
        format!("{}/billing/success", self.frontend_url.trim_end_matches('/'))
    }

    /// Checkout cancel redirect.
    #[must_use]
    pub fn checkout_cancel_url(&self) -> String {
        format!("{}/billing/cancel", self.frontend_url.trim_end_matches('/'))
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// unset or malformed.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load payment provider secrets from file or environment.
fn load_payment_secrets() -> (Option<String>, Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/payments.json",
        "tally/.secrets/payments.json",
        "../.secrets/payments.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<PaymentSecrets>(path) {
            tracing::info!(path = %path, "Loaded payment secrets from file");
            return (
                Some(secrets.api_key),
                secrets.webhook_secret,
                secrets.base_url,
            );
        }
    }

    tracing::debug!("Payment secrets file not found, using environment variables");
    (
        std::env::var("PAYMENT_API_KEY").ok(),
        std::env::var("PAYMENT_WEBHOOK_SECRET").ok(),
        std::env::var("PAYMENT_API_BASE_URL").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/tally".into(),
            jwt_secret: None,
            jwt_audience: None,
            service_api_key: None,
            admin_api_key: None,
            payment_api_key: None,
            payment_webhook_secret: None,
            payment_api_base_url: None,
            frontend_url: "http://localhost:3000".into(),
            provider_timeout_ms: 10_000,
            provider_max_retries: 3,
            webhook_tolerance_secs: 300,
            audit_webhook_url: None,
            audit_webhook_secret: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            sweep_interval_secs: 3600,
            integrity_interval_secs: 21_600,
            intent_poll_interval_secs: 300,
            intent_poll_min_age_secs: 600,
            intent_abandon_after_secs: 86_400,
            intent_poll_concurrency: 8,
            engine: EngineSettings::default(),
        }
    }
}
