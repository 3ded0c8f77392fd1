//! Audit sinks.
//!
//! The engine hands every committed ledger entry, subscription transition,
//! intent finalization and integrity violation to an [`AuditSink`] after the
//! write is durable. Sinks must not block: the webhook sink queues events on
//! a channel drained by a background task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tally_core::AuditEvent;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::crypto::hmac_sha256_hex;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of delivery attempts per event.
const WEBHOOK_MAX_RETRIES: u32 = 3;

/// Initial backoff duration for retries (doubles with each attempt).
const WEBHOOK_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff duration for retries.
const WEBHOOK_MAX_BACKOFF_MS: u64 = 5000;

/// Events buffered before new ones are dropped.
const WEBHOOK_QUEUE_CAPACITY: usize = 1024;

/// Header carrying the hex HMAC of the request body.
pub const AUDIT_SIGNATURE_HEADER: &str = "x-tally-signature";

/// Receives audit events after they are committed.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &AuditEvent);
}

/// Writes events to the `tally::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::LedgerEntry { entry } => tracing::info!(
                target: "tally::audit",
                account_id = %entry.account_id,
                entry_id = %entry.id,
                sequence = entry.sequence,
                reason = %entry.reason,
                delta = entry.delta,
                resulting_balance = entry.resulting_balance,
                reference_id = %entry.reference_id,
                "Ledger entry committed"
            ),
            AuditEvent::SubscriptionTransition {
                account_id,
                subscription_id,
                from,
                to,
                plan_id,
                cause,
                ..
            } => tracing::info!(
                target: "tally::audit",
                account_id = %account_id,
                subscription_id = %subscription_id,
                from = ?from,
                to = %to,
                plan = %plan_id,
                cause = %cause,
                "Subscription transition"
            ),
            AuditEvent::IntentFinalized {
                account_id,
                intent_id,
                status,
                ..
            } => tracing::info!(
                target: "tally::audit",
                account_id = %account_id,
                intent_id = %intent_id,
                status = %status,
                "Payment intent finalized"
            ),
            AuditEvent::IntegrityViolation {
                account_id,
                cached,
                ledger,
                ..
            } => tracing::error!(
                target: "tally::audit",
                account_id = %account_id,
                cached,
                ledger,
                "Integrity violation, account frozen"
            ),
            AuditEvent::ProjectionRebuilt {
                account_id,
                previous,
                balance,
                admin_id,
                ..
            } => tracing::warn!(
                target: "tally::audit",
                account_id = %account_id,
                previous,
                balance,
                admin_id = %admin_id,
                "Projection rebuilt from ledger"
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Delivers each event to every inner sink.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    /// An empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// POSTs events as JSON to an external collector.
///
/// Delivery happens on a background task with exponential backoff. When the
/// queue is full the event is dropped with a warning; the tracing sink still
/// has it.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl WebhookSink {
    /// Start the delivery task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(WEBHOOK_QUEUE_CAPACITY);
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                deliver(&client, &url, secret.as_deref(), &event).await;
            }
            tracing::debug!("Audit webhook queue closed");
        });

        Self { sender }
    }
}

impl AuditSink for WebhookSink {
    fn record(&self, event: &AuditEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => tracing::warn!(
                account_id = %event.account_id(),
                kind = event.kind(),
                "Audit webhook queue full, dropping event"
            ),
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Audit webhook worker stopped");
            }
        }
    }
}

/// Deliver one event, retrying with backoff.
async fn deliver(client: &reqwest::Client, url: &str, secret: Option<&str>, event: &AuditEvent) {
    let body = match serde_json::to_string(event) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize audit event");
            return;
        }
    };
    let signature = secret.and_then(|s| hmac_sha256_hex(s, &body));

    let mut backoff_ms = WEBHOOK_INITIAL_BACKOFF_MS;
    for attempt in 1..=WEBHOOK_MAX_RETRIES {
        let mut request = client
            .post(url)
            .header("content-type", "application/json")
            .body(body.clone());
        if let Some(signature) = &signature {
            request = request.header(AUDIT_SIGNATURE_HEADER, signature);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(kind = event.kind(), attempt, "Audit event delivered");
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    status = %response.status(),
                    kind = event.kind(),
                    attempt,
                    "Audit webhook rejected event"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = event.kind(), attempt, "Audit webhook failed");
            }
        }

        if attempt < WEBHOOK_MAX_RETRIES {
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(WEBHOOK_MAX_BACKOFF_MS);
        }
    }

    tracing::error!(
        account_id = %event.account_id(),
        kind = event.kind(),
        "Audit event dropped after retries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::AccountId;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn violation() -> AuditEvent {
        AuditEvent::IntegrityViolation {
            account_id: AccountId::generate(),
            cached: 10,
            ledger: 5,
            at: Utc::now(),
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.record(&violation());

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events_of_kind("integrity_violation").len(), 1);
    }

    #[tokio::test]
    async fn webhook_sink_retries_until_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audit"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/audit"))
            .and(header_exists(AUDIT_SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::spawn(
            format!("{}/audit", server.uri()),
            Some("audit-secret".into()),
            Duration::from_secs(5),
        );
        sink.record(&violation());

        for _ in 0..50 {
            if server.received_requests().await.unwrap_or_default().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
