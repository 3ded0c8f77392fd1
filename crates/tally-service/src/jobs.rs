//! Background jobs: renewal sweep, integrity verification and the
//! pending-intent poller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tally_core::{IntentStatus, PaymentIntent, Result};
use tokio::task::JoinHandle;
use tokio::time;

use crate::engine::Engine;
use crate::provider::PaymentProvider;
use crate::state::AppState;

/// Bounds for one poll of pending intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Intents younger than this are left to the callback.
    pub min_age: ChronoDuration,
    /// Open intents without a provider reference older than this are canceled.
    pub abandon_after: ChronoDuration,
    /// Concurrent provider lookups.
    pub concurrency: usize,
}

impl PollSettings {
    /// Settings from service configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::ServiceConfig) -> Self {
        Self {
            min_age: ChronoDuration::seconds(config.intent_poll_min_age_secs),
            abandon_after: ChronoDuration::seconds(config.intent_abandon_after_secs),
            concurrency: config.intent_poll_concurrency.max(1),
        }
    }
}

/// Totals from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Intents sent to the provider.
    pub polled: usize,
    /// Intents the provider reported final and that were confirmed.
    pub resolved: usize,
    /// Intents still open at the provider.
    pub still_open: usize,
    /// Intents canceled because checkout never started.
    pub abandoned: usize,
    /// Lookups or confirmations that failed.
    pub failed: usize,
}

enum PollResult {
    Resolved,
    Open,
    Failed,
}

/// Spawn every periodic job. Handles are returned so callers may abort
/// them on shutdown.
pub fn spawn(state: &Arc<AppState>) -> Vec<JoinHandle<()>> {
    let config = &state.config;
    let mut handles = vec![
        spawn_sweep(
            state.engine.clone(),
            Duration::from_secs(config.sweep_interval_secs),
        ),
        spawn_integrity(
            state.engine.clone(),
            Duration::from_secs(config.integrity_interval_secs),
        ),
    ];

    match &state.provider {
        Some(provider) => handles.push(spawn_intent_poller(
            state.engine.clone(),
            provider.clone(),
            PollSettings::from_config(config),
            Duration::from_secs(config.intent_poll_interval_secs),
        )),
        None => tracing::warn!("Payment provider not configured - pending intents will not be polled"),
    }

    handles
}

/// Periodically run the renewal and replenishment sweep.
pub fn spawn_sweep(engine: Arc<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.run_blocking(Engine::sweep).await {
                Ok(report) => tracing::debug!(?report, "Sweep tick finished"),
                Err(e) => tracing::warn!(error = %e, "Sweep tick failed"),
            }
        }
    })
}

/// Periodically verify every account's projection against its ledger.
pub fn spawn_integrity(engine: Arc<Engine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.run_blocking(Engine::verify_all).await {
                Ok(summary) if summary.violations > 0 => tracing::error!(
                    violations = summary.violations,
                    "Integrity verification found frozen accounts"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Integrity verification failed"),
            }
        }
    })
}

/// Periodically reconcile intents whose callback never arrived.
pub fn spawn_intent_poller(
    engine: Arc<Engine>,
    provider: Arc<dyn PaymentProvider>,
    settings: PollSettings,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match poll_pending_intents(&engine, provider.as_ref(), settings).await {
                Ok(report) if report.polled > 0 || report.abandoned > 0 => {
                    tracing::info!(?report, "Pending intents reconciled");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Intent poll failed"),
            }
        }
    })
}

/// Resolve stale open intents.
///
/// Intents without a provider reference never reached the provider; once
/// older than `abandon_after` they are canceled. Pending intents with a
/// reference and older than `min_age` are looked up at the provider and a
/// final status is applied through [`Engine::confirm`] exactly as a
/// callback would be.
///
/// # Errors
///
/// Returns a storage error if intents cannot be listed.
pub async fn poll_pending_intents(
    engine: &Arc<Engine>,
    provider: &dyn PaymentProvider,
    settings: PollSettings,
) -> Result<PollReport> {
    let (now, open) = engine
        .run_blocking(|engine| {
            let store = engine.store();
            let mut open = store.list_intents_with_status(IntentStatus::Created)?;
            open.extend(store.list_intents_with_status(IntentStatus::Pending)?);
            Ok((engine.now(), open))
        })
        .await?;

    let mut report = PollReport::default();
    let mut to_poll: Vec<(PaymentIntent, String)> = Vec::new();

    for intent in open {
        let age = now - intent.created_at;
        match intent.provider_reference.clone() {
            None if age >= settings.abandon_after => match engine
                .run_blocking(move |engine| engine.cancel_intent(intent.id))
                .await
            {
                Ok(_) => report.abandoned += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(intent_id = %intent.id, error = %e, "Failed to abandon intent");
                }
            },
            Some(reference) if age >= settings.min_age => to_poll.push((intent, reference)),
            _ => {}
        }
    }

    report.polled = to_poll.len();
    let results: Vec<PollResult> = stream::iter(to_poll)
        .map(|(intent, reference)| poll_one(engine, provider, intent, reference))
        .buffer_unordered(settings.concurrency)
        .collect()
        .await;

    for result in results {
        match result {
            PollResult::Resolved => report.resolved += 1,
            PollResult::Open => report.still_open += 1,
            PollResult::Failed => report.failed += 1,
        }
    }
    Ok(report)
}

async fn poll_one(
    engine: &Arc<Engine>,
    provider: &dyn PaymentProvider,
    intent: PaymentIntent,
    reference: String,
) -> PollResult {
    let status = match provider.fetch_status(&reference).await {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!(
                intent_id = %intent.id,
                provider_reference = %reference,
                error = %e,
                "Provider status lookup failed"
            );
            return PollResult::Failed;
        }
    };

    let Some(event) = status.into_event(&reference) else {
        return PollResult::Open;
    };

    match engine.run_blocking(move |engine| engine.confirm(&event)).await {
        Ok(outcome) => {
            tracing::info!(
                intent_id = %intent.id,
                provider_reference = %reference,
                duplicate = outcome.is_duplicate(),
                "Intent resolved by polling"
            );
            PollResult::Resolved
        }
        Err(e) => {
            tracing::warn!(
                intent_id = %intent.id,
                provider_reference = %reference,
                error = %e,
                "Failed to apply polled status"
            );
            PollResult::Failed
        }
    }
}
