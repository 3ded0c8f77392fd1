//! Shared integration test harness.

#![allow(dead_code)]

use std::sync::Arc;

use axum_test::TestServer;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use tally_core::AccountId;
use tally_service::engine::ManualClock;
use tally_service::{
    create_router, AppState, Engine, EngineSettings, MemorySink, PaymentProvider, ServiceConfig,
};
use tally_store::MemoryStore;

pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const JWT_SECRET: &str = "test-jwt-secret";

/// Test harness with an in-memory store, a manual clock and a recording
/// audit sink.
pub struct TestHarness {
    pub server: TestServer,
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemorySink>,
    pub clock: Arc<ManualClock>,
    pub test_account_id: AccountId,
    pub service_api_key: String,
    pub admin_api_key: String,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        jwt_secret: Some(JWT_SECRET.into()),
        service_api_key: Some(SERVICE_API_KEY.into()),
        admin_api_key: Some(ADMIN_API_KEY.into()),
        provider_timeout_ms: 2000,
        provider_max_retries: 1,
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// Harness without a payment provider.
    pub fn new() -> Self {
        Self::build(None, EngineSettings::default())
    }

    /// Harness with a payment provider.
    pub fn with_provider(provider: Arc<dyn PaymentProvider>) -> Self {
        Self::build(Some(provider), EngineSettings::default())
    }

    /// Harness with custom engine settings.
    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(None, settings)
    }

    fn build(provider: Option<Arc<dyn PaymentProvider>>, settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let mut config = test_config();
        config.engine = settings.clone();

        let engine = Arc::new(
            Engine::new(store.clone(), settings, sink.clone()).with_clock(clock.clone()),
        );
        let state = AppState::with_parts(engine.clone(), config, provider);
        let server = TestServer::new(create_router(state)).expect("Failed to create test server");

        Self {
            server,
            engine,
            store,
            sink,
            clock,
            test_account_id: AccountId::generate(),
            service_api_key: SERVICE_API_KEY.into(),
            admin_api_key: ADMIN_API_KEY.into(),
        }
    }

    /// Bearer header for the test account.
    pub fn user_auth_header(&self) -> String {
        auth_header_for(self.test_account_id)
    }

    /// Open the test account through the API.
    pub async fn open_account(&self) {
        self.server
            .post("/v1/accounts")
            .add_header("authorization", self.user_auth_header())
            .await
            .assert_status_ok();
    }

    /// Add credits to the test account through the admin API.
    pub async fn fund(&self, delta: i64, reference_id: &str) {
        self.server
            .post("/v1/admin/credits")
            .add_header("x-admin-key", &self.admin_api_key)
            .json(&json!({
                "account_id": self.test_account_id.to_string(),
                "delta": delta,
                "reference_id": reference_id,
            }))
            .await
            .assert_status_ok();
    }

    /// Current balance of the test account through the API.
    pub async fn balance(&self) -> i64 {
        let response = self
            .server
            .get("/v1/credits/balance")
            .add_header("authorization", self.user_auth_header())
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        body["balance"].as_i64().unwrap()
    }
}

/// Bearer header carrying an HS256 token for `account_id`.
pub fn auth_header_for(account_id: AccountId) -> String {
    let claims = json!({
        "sub": account_id.to_string(),
        "exp": Utc::now().timestamp() + 3600,
        "iat": Utc::now().timestamp(),
    });
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}
