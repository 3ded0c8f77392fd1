//! The ledger engine.
//!
//! [`Engine`] owns the store, the plan catalog and the per-account locks.
//! Its operations are split by concern:
//!
//! - `ledger`: credit, debit, manual adjustment, monthly grant, reads
//! - `entitlements`: the status → quota → credits evaluation
//! - `metering`: authorize+debit in one critical section, compensation
//! - `lifecycle`: account opening, trials, plan changes, cancellation, sweep
//! - `payments`: intents, provider confirmation, paying with credits
//! - `integrity`: projection verification, freezing, operator repair
//!
//! Every mutating operation loads state, computes a [`WriteSet`] and commits
//! it while holding the account's lock. Audit events are emitted only after
//! the commit succeeds.

mod clock;
mod entitlements;
mod integrity;
mod ledger;
mod lifecycle;
mod locks;
mod metering;
mod payments;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::{
    AccountId, AuditEvent, BillingError, CreditAccount, FeatureCostTable, PlanCatalog,
    PostingLimits, Result, RolloverPolicy, Subscription, SubscriptionStatus, GRACE_PERIOD_DAYS,
    TRIAL_PERIOD_DAYS,
};
use tally_store::{Store, WriteSet};

use crate::audit::AuditSink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entitlements::{Authorization, Entitlements, QuotaStatus, QuotaUse};
pub use integrity::{IntegrityReport, IntegritySummary};
pub use lifecycle::{PlanChange, PlanChangeKind, SweepReport};
pub use locks::AccountLocks;
pub use metering::{Metered, MeteredDebit, MeteredError};
pub use payments::{ConfirmEffect, CreditPurchase};

/// Default maximum balance an account may reach through ceiling-bound credits.
pub const DEFAULT_BALANCE_CEILING: i64 = 1_000_000;

/// Tunables of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Maximum balance a grant, payment or adjustment may produce.
    pub balance_ceiling: i64,
    /// Rollover cap as a percentage of the monthly allowance.
    pub rollover_factor_percent: u32,
    /// Days a past-due subscription (or an unpaid trial with a payment
    /// method) keeps its entitlements.
    pub grace_period_days: i64,
    /// Length of a trial.
    pub trial_days: i64,
    /// Currency of payment intents.
    pub currency: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            balance_ceiling: DEFAULT_BALANCE_CEILING,
            rollover_factor_percent: 100,
            grace_period_days: GRACE_PERIOD_DAYS,
            trial_days: TRIAL_PERIOD_DAYS,
            currency: "usd".into(),
        }
    }
}

/// The subscription and credit ledger engine.
pub struct Engine {
    store: Arc<dyn Store>,
    catalog: PlanCatalog,
    costs: FeatureCostTable,
    settings: EngineSettings,
    locks: AccountLocks,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine with the default catalog, cost table and system clock.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, settings: EngineSettings, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            catalog: PlanCatalog::default(),
            costs: FeatureCostTable::default(),
            settings,
            locks: AccountLocks::new(),
            sink,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the plan catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replace the feature cost table.
    #[must_use]
    pub fn with_costs(mut self, costs: FeatureCostTable) -> Self {
        self.costs = costs;
        self
    }

    /// The storage backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The plan catalog.
    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// The feature cost table.
    #[must_use]
    pub fn costs(&self) -> &FeatureCostTable {
        &self.costs
    }

    /// Engine settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current time according to the engine's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `op` on the blocking thread pool.
    ///
    /// Engine calls take per-account locks and do synchronous storage I/O,
    /// so async callers go through here instead of calling in place.
    ///
    /// # Errors
    ///
    /// Whatever `op` returns, or `Storage` if the task panicked.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|e| BillingError::Storage(format!("engine task failed: {e}")))?
    }

    fn limits(&self) -> PostingLimits {
        PostingLimits {
            balance_ceiling: self.settings.balance_ceiling,
        }
    }

    fn rollover(&self) -> RolloverPolicy {
        RolloverPolicy {
            factor_percent: self.settings.rollover_factor_percent,
        }
    }

    fn load_account(&self, account_id: AccountId) -> Result<CreditAccount> {
        self.store
            .get_account(&account_id)?
            .ok_or(BillingError::AccountNotFound { account_id })
    }

    fn live_subscription(&self, account_id: AccountId) -> Result<Option<Subscription>> {
        Ok(self
            .store
            .current_subscription(&account_id)?
            .filter(Subscription::is_live))
    }

    /// Commit `writes`, then emit one event per ledger entry followed by
    /// `events`.
    fn commit(&self, writes: WriteSet, events: Vec<AuditEvent>) -> Result<()> {
        let entries = writes.entries.clone();
        self.store.commit(writes)?;

        for entry in entries {
            self.sink.record(&AuditEvent::LedgerEntry { entry });
        }
        for event in &events {
            self.sink.record(event);
        }
        Ok(())
    }
}

/// Audit event for a subscription that was created or changed.
fn transition_event(
    subscription: &Subscription,
    from: Option<SubscriptionStatus>,
    cause: &str,
) -> AuditEvent {
    AuditEvent::SubscriptionTransition {
        account_id: subscription.owner_id,
        subscription_id: subscription.id,
        from,
        to: subscription.status,
        plan_id: subscription.plan_id,
        cause: cause.to_string(),
        at: subscription.updated_at,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audit::MemorySink;
    use chrono::TimeZone;
    use tally_store::MemoryStore;

    pub(crate) struct Fixture {
        pub engine: Arc<Engine>,
        pub store: Arc<MemoryStore>,
        pub sink: Arc<MemorySink>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(EngineSettings::default())
    }

    pub(crate) fn fixture_with(settings: EngineSettings) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Arc::new(
            Engine::new(store.clone(), settings, sink.clone()).with_clock(clock.clone()),
        );
        Fixture {
            engine,
            store,
            sink,
            clock,
        }
    }
}
