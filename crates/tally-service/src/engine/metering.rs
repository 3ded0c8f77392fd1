//! Usage metering: the single entry point for metered actions.
//!
//! Authorization and debit happen inside one account critical section and
//! one atomic write, so there is no window between "allowed" and "charged".
//! When the downstream action fails the caller compensates with an
//! equal-and-opposite refund that also releases the consumed quota.

use std::future::Future;

use serde::Serialize;
use serde_json::json;
use tally_core::{
    post_entries, AccountId, BillingError, EntryDraft, EntryId, EntryReason, Feature,
    IdempotencyKey, LedgerEntry, Outcome, Resource, Result, UsageQuotaCounter,
};
use tally_store::WriteSet;

use super::{Engine, QuotaUse};

/// A committed metered debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeteredDebit {
    /// The `feature_debit` entry; its id is the compensation handle.
    pub entry: LedgerEntry,
    /// Credits charged.
    pub cost: i64,
    /// Quota consumed, if the feature is quota-bound. `used` includes this
    /// request.
    pub quota: Option<QuotaUse>,
}

/// Result of [`Engine::run_metered`].
#[derive(Debug)]
pub enum Metered<T> {
    /// The action ran and its debit stands.
    Ran {
        /// The debit.
        debit: MeteredDebit,
        /// What the action returned.
        output: T,
    },
    /// The reference was already charged; the action was not run again.
    AlreadyCharged(MeteredDebit),
}

/// Failure of [`Engine::run_metered`].
#[derive(Debug, thiserror::Error)]
pub enum MeteredError<E> {
    /// Authorization or debit was refused; the action did not run.
    #[error(transparent)]
    Denied(#[from] BillingError),
    /// The action failed after the debit; the debit was compensated.
    #[error("metered action failed: {0}")]
    Action(E),
}

impl Engine {
    /// Authorize a feature and debit its cost in one step.
    ///
    /// Idempotent on `reference_id`: a replay returns the original debit.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionInactive`, `QuotaExceeded` or
    /// `InsufficientCredits` (in that order of precedence),
    /// `IntegrityViolation` for frozen accounts, or a storage error.
    pub fn authorize_and_debit(
        &self,
        account_id: AccountId,
        feature: Feature,
        units: u64,
        reference_id: &str,
    ) -> Result<Outcome<MeteredDebit>> {
        if reference_id.is_empty() {
            return Err(BillingError::InvalidPayload(
                "reference_id must not be empty".into(),
            ));
        }
        let key = IdempotencyKey::new(account_id, EntryReason::FeatureDebit, reference_id);

        self.locks.with_account(account_id, || {
            if let Some(entry) = self.store.find_entry(&key)? {
                tracing::debug!(key = %key, "Duplicate metered debit");
                return Ok(Outcome::Duplicate(replayed_debit(entry)));
            }

            let mut account = self.load_account(account_id)?;
            let auth = self.evaluate(&account, feature, units)?;
            if auth.cost <= 0 {
                return Err(BillingError::InvalidAmount(format!(
                    "feature {feature} has no cost"
                )));
            }

            let mut metadata = json!({ "feature": feature, "units": units });
            let mut writes = WriteSet::default();
            let quota = auth.quota.map(|q| {
                metadata["resource"] = json!(q.resource);
                metadata["period_key"] = json!(q.period_key);
                let mut counter = UsageQuotaCounter::new(account_id, q.resource, q.period_key.clone());
                counter.count = q.used.saturating_add(units);
                writes.quota_counters.push(counter);
                QuotaUse {
                    used: q.used.saturating_add(units),
                    ..q
                }
            });

            let draft = EntryDraft::debit(EntryReason::FeatureDebit, auth.cost, reference_id)
                .with_metadata(metadata);
            let entries = post_entries(&mut account, vec![draft], self.limits(), self.now())?;
            writes.account = Some(account);
            writes.entries = entries.clone();
            self.commit(writes, Vec::new())?;

            let entry = entries
                .into_iter()
                .next()
                .ok_or_else(|| BillingError::Storage("posting produced no entry".into()))?;

            tracing::info!(
                account_id = %account_id,
                feature = %feature,
                units,
                cost = auth.cost,
                balance = entry.resulting_balance,
                reference_id = %reference_id,
                "Metered debit applied"
            );

            Ok(Outcome::Applied(MeteredDebit {
                entry,
                cost: auth.cost,
                quota,
            }))
        })
    }

    /// Reverse a metered debit.
    ///
    /// Posts a `refund` of the same amount referencing the debit's id and
    /// releases the quota units it consumed. Compensating twice returns the
    /// original refund.
    ///
    /// # Errors
    ///
    /// - `EntryNotFound` if the entry does not exist.
    /// - `InvalidTransition` if the entry is not a feature debit.
    /// - `IntegrityViolation` if the account is frozen.
    pub fn compensate(&self, debit_entry_id: EntryId) -> Result<Outcome<LedgerEntry>> {
        let debit = self
            .store
            .get_entry(&debit_entry_id)?
            .ok_or_else(|| BillingError::EntryNotFound {
                entry_id: debit_entry_id.to_string(),
            })?;
        if debit.reason != EntryReason::FeatureDebit {
            return Err(BillingError::invalid_transition(debit.reason, "compensate"));
        }

        let account_id = debit.account_id;
        let reference = debit.id.to_string();
        let key = IdempotencyKey::new(account_id, EntryReason::Refund, reference.clone());

        self.locks.with_account(account_id, || {
            if let Some(existing) = self.store.find_entry(&key)? {
                return Ok(Outcome::Duplicate(existing));
            }

            let mut account = self.load_account(account_id)?;
            let mut writes = WriteSet::default();
            if let Some((resource, period_key, units)) = consumed_quota(&debit) {
                let used = self.store.quota_count(&account_id, resource, &period_key)?;
                let mut counter = UsageQuotaCounter::new(account_id, resource, period_key);
                counter.count = used.saturating_sub(units);
                writes.quota_counters.push(counter);
            }

            let draft = EntryDraft::credit(EntryReason::Refund, -debit.delta, reference.clone())
                .with_metadata(json!({
                    "compensates": reference,
                    "feature": debit.metadata.get("feature"),
                }));
            let entries = post_entries(&mut account, vec![draft], self.limits(), self.now())?;
            writes.account = Some(account);
            writes.entries = entries.clone();
            self.commit(writes, Vec::new())?;

            let entry = entries
                .into_iter()
                .next()
                .ok_or_else(|| BillingError::Storage("posting produced no entry".into()))?;

            tracing::info!(
                account_id = %account_id,
                debit_entry_id = %debit.id,
                amount = entry.delta,
                balance = entry.resulting_balance,
                "Metered debit compensated"
            );
            Ok(Outcome::Applied(entry))
        })
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
    pub async fn run_metered<T, E, F, Fut>(
        &self,
        account_id: AccountId,
        feature: Feature,
        units: u64,
        reference_id: &str,
        action: F,
    ) -> std::result::Result<Metered<T>, MeteredError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let debit = match self.authorize_and_debit(account_id, feature, units, reference_id)? {
            Outcome::Duplicate(debit) => return Ok(Metered::AlreadyCharged(debit)),
            Outcome::Applied(debit) => debit,
        };

        match action().await {
            Ok(output) => Ok(Metered::Ran { debit, output }),
            Err(e) => {
                tracing::warn!(
                    account_id = %account_id,
                    entry_id = %debit.entry.id,
                    error = %e,
                    "Metered action failed, compensating"
                );
                if let Err(comp) = self.compensate(debit.entry.id) {
                    tracing::error!(
                        account_id = %account_id,
                        entry_id = %debit.entry.id,
                        error = %comp,
                        "Compensation failed; debit left standing"
                    );
                }
                Err(MeteredError::Action(e))
            }
        }
    }
}

/// Rebuild the metered result from a stored debit.
fn replayed_debit(entry: LedgerEntry) -> MeteredDebit {
    let quota = consumed_quota(&entry).map(|(resource, period_key, _)| QuotaUse {
        resource,
        period_key,
        used: 0,
        limit: None,
    });
    MeteredDebit {
        cost: -entry.delta,
        quota,
        entry,
    }
}

/// Quota resource, counter key and units recorded on a debit.
fn consumed_quota(entry: &LedgerEntry) -> Option<(Resource, String, u64)> {
    let resource = serde_json::from_value(entry.metadata.get("resource")?.clone()).ok()?;
    let period_key = entry.metadata.get("period_key")?.as_str()?.to_string();
    let units = entry.metadata.get("units")?.as_u64()?;
    Some((resource, period_key, units))
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use tally_store::Store;

    fn open(fx: &super::super::testing::Fixture) -> AccountId {
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();
        account
    }

    #[test]
    fn debit_consumes_quota_and_credits() {
        let fx = fixture();
        let account = open(&fx);

        let debit = fx
            .engine
            .authorize_and_debit(account, Feature::AgentCall, 2, "call-1")
            .unwrap()
            .into_inner();

        assert_eq!(debit.cost, 10);
        assert_eq!(debit.entry.resulting_balance, 40);
        let quota = debit.quota.unwrap();
        assert_eq!(quota.used, 2);
        assert_eq!(quota.limit, Some(20));
        assert_eq!(
            fx.store
                .quota_count(&account, Resource::AgentCalls, &quota.period_key)
                .unwrap(),
            2
        );
    }

    #[test]
    fn replayed_reference_charges_once() {
        let fx = fixture();
        let account = open(&fx);

        let first = fx
            .engine
            .authorize_and_debit(account, Feature::Chat, 5, "msg-1")
            .unwrap();
        let second = fx
            .engine
            .authorize_and_debit(account, Feature::Chat, 5, "msg-1")
            .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(first.value().entry.id, second.value().entry.id);
        assert_eq!(fx.engine.balance(account).unwrap(), 45);
    }

    #[test]
    fn compensation_restores_balance_and_quota() {
        let fx = fixture();
        let account = open(&fx);

        let debit = fx
            .engine
            .authorize_and_debit(account, Feature::AgentCall, 3, "call-9")
            .unwrap()
            .into_inner();
        let refund = fx.engine.compensate(debit.entry.id).unwrap();

        assert!(!refund.is_duplicate());
        assert_eq!(refund.value().reference_id, debit.entry.id.to_string());
        assert_eq!(refund.value().delta, 15);
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
        let period = debit.quota.unwrap().period_key;
        assert_eq!(
            fx.store
                .quota_count(&account, Resource::AgentCalls, &period)
                .unwrap(),
            0
        );

        assert!(fx.engine.compensate(debit.entry.id).unwrap().is_duplicate());
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
    }

    #[test]
    fn only_feature_debits_are_compensable() {
        let fx = fixture();
        let account = open(&fx);
        let grant = fx.store.entries_for_account(&account).unwrap().remove(0);

        assert!(matches!(
            fx.engine.compensate(grant.id),
            Err(BillingError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failed_action_is_compensated() {
        let fx = fixture();
        let account = open(&fx);

        let result = fx
            .engine
            .run_metered(account, Feature::Chat, 7, "msg-2", || async {
                Err::<(), _>("model unavailable")
            })
            .await;

        assert!(matches!(result, Err(MeteredError::Action("model unavailable"))));
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
    }

    #[tokio::test]
    async fn duplicate_reference_does_not_rerun_action() {
        let fx = fixture();
        let account = open(&fx);
        let runs = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..2 {
            fx.engine
                .run_metered(account, Feature::Chat, 1, "msg-3", || async {
                    runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await
                .unwrap();
        }

        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(fx.engine.balance(account).unwrap(), 49);
    }

    #[test]
    fn cost_table_sets_the_price() {
        use crate::audit::MemorySink;
        use crate::engine::EngineSettings;
        use std::collections::BTreeMap;
        use std::sync::Arc;
        use tally_core::FeatureCostTable;
        use tally_store::MemoryStore;

        let costs = FeatureCostTable::new(BTreeMap::from([(Feature::Chat, 4)]));
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            EngineSettings::default(),
            Arc::new(MemorySink::new()),
        )
        .with_costs(costs);
        let account = AccountId::generate();
        engine.open_account(account).unwrap();

        let debit = engine
            .authorize_and_debit(account, Feature::Chat, 3, "msg-4")
            .unwrap()
            .into_inner();
        assert_eq!(debit.cost, 12);
        assert!(matches!(
            engine.authorize_and_debit(account, Feature::AgentCall, 1, "call-4"),
            Err(BillingError::InvalidAmount(_))
        ));
    }

    #[test]
    fn parallel_debits_never_overdraw() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fx = fixture();
        let account = open(&fx);
        let applied = AtomicUsize::new(0);
        let denied = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let (engine, applied, denied) = (&fx.engine, &applied, &denied);
                scope.spawn(move || {
                    for n in 0..10 {
                        let reference = format!("msg-{worker}-{n}");
                        match engine.authorize_and_debit(account, Feature::Chat, 1, &reference) {
                            Ok(_) => applied.fetch_add(1, Ordering::SeqCst),
                            Err(BillingError::InsufficientCredits { .. }) => {
                                denied.fetch_add(1, Ordering::SeqCst)
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        };
                    }
                });
            }
        });

        assert_eq!(applied.load(Ordering::SeqCst), 50);
        assert_eq!(denied.load(Ordering::SeqCst), 30);
        assert_eq!(fx.engine.balance(account).unwrap(), 0);

        let entries = fx.store.entries_for_account(&account).unwrap();
        assert_eq!(entries.iter().map(|e| e.delta).sum::<i64>(), 0);
        assert!(entries.iter().all(|e| e.resulting_balance >= 0));
        assert!(fx.engine.verify_account(account).unwrap().consistent);
    }

    #[test]
    fn racing_replays_charge_once() {
        let fx = fixture();
        let account = open(&fx);

        let duplicates = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        fx.engine
                            .authorize_and_debit(account, Feature::AgentCall, 1, "call-race")
                            .unwrap()
                            .is_duplicate()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|duplicate| *duplicate)
                .count()
        });

        assert_eq!(duplicates, 7);
        assert_eq!(fx.engine.balance(account).unwrap(), 45);
    }
}
