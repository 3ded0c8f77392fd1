//! Entitlement resolution.
//!
//! Checks run in a fixed order so callers always see the most fundamental
//! denial first: subscription status, then the non-credit quota, then the
//! credit balance.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{
    quota_period_key, AccountId, BillingError, CreditAccount, Feature, PlanId, Resource, Result,
    SubscriptionStatus,
};

use super::Engine;

/// Quota state relevant to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUse {
    /// Counted resource.
    pub resource: Resource,
    /// Counter key (`YYYY-MM` or `lifetime`).
    pub period_key: String,
    /// Units consumed before this request.
    pub used: u64,
    /// Plan limit, `None` when unlimited.
    pub limit: Option<u64>,
}

/// A positive entitlement decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    /// Account.
    pub account_id: AccountId,
    /// Requested feature.
    pub feature: Feature,
    /// Requested units.
    pub units: u64,
    /// Plan that grants the feature.
    pub plan_id: PlanId,
    /// Subscription status at decision time.
    pub status: SubscriptionStatus,
    /// Credits the request costs.
    pub cost: i64,
    /// Balance at decision time.
    pub balance: i64,
    /// Quota the request consumes, if the feature is quota-bound.
    pub quota: Option<QuotaUse>,
}

/// Usage of one quota resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    /// Resource.
    pub resource: Resource,
    /// Plan limit, `None` when unlimited.
    pub limit: Option<u64>,
    /// Units consumed in the current counter period.
    pub used: u64,
    /// Counter key.
    pub period_key: String,
}

/// What an account may currently do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlements {
    /// Account.
    pub account_id: AccountId,
    /// Effective plan (free when nothing is live).
    pub plan_id: PlanId,
    /// Display name of the plan.
    pub plan_name: String,
    /// Status of the current subscription record.
    pub status: Option<SubscriptionStatus>,
    /// Whether metered features are currently usable.
    pub entitled: bool,
    /// Cached credit balance.
    pub credit_balance: i64,
    /// Monthly allowance of the plan.
    pub monthly_credit_allowance: i64,
    /// Features included in the plan.
    pub features: Vec<Feature>,
    /// Quota usage per resource.
    pub quotas: Vec<QuotaStatus>,
    /// End of the current billing window.
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether the subscription ends at the window end.
    pub cancel_at_period_end: bool,
    /// Deferred downgrade target.
    pub pending_plan_id: Option<PlanId>,
    /// Whether ledger writes are frozen.
    pub frozen: bool,
}

impl Engine {
    /// Evaluate a request without reserving anything.
    ///
    /// Advisory only: a later [`Engine::authorize_and_debit`] may still be
    /// denied.
    ///
    /// # Errors
    ///
    /// Returns the same denials as `authorize_and_debit`.
    pub fn preview(&self, account_id: AccountId, feature: Feature, units: u64) -> Result<Authorization> {
        let account = self.load_account(account_id)?;
        self.evaluate(&account, feature, units)
    }

    /// Plan, quotas and balance of an account.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` or a storage error.
    pub fn entitlements(&self, account_id: AccountId) -> Result<Entitlements> {
        let account = self.load_account(account_id)?;
        let current = self.store.current_subscription(&account_id)?;
        let live = current.as_ref().filter(|s| s.is_live());

        let plan_id = live.map_or(PlanId::Free, |s| s.plan_id);
        let plan = self.catalog.get(plan_id)?;
        let now = self.now();

        let mut resources: Vec<Resource> = Feature::ALL
            .iter()
            .filter_map(Feature::quota_resource)
            .collect();
        resources.dedup();

        let mut quotas = Vec::with_capacity(resources.len());
        for resource in resources {
            let period_key = quota_period_key(resource, now);
            let used = self.store.quota_count(&account_id, resource, &period_key)?;
            let limit = if plan.features.iter().any(|f| f.quota_resource() == Some(resource)) {
                plan.quota(resource)
            } else {
                Some(0)
            };
            quotas.push(QuotaStatus {
                resource,
                limit,
                used,
                period_key,
            });
        }

        Ok(Entitlements {
            account_id,
            plan_id,
            plan_name: plan.name.clone(),
            status: current.as_ref().map(|s| s.status),
            entitled: live.is_some_and(|s| s.status.is_entitled()),
            credit_balance: account.balance,
            monthly_credit_allowance: plan.monthly_credit_allowance,
            features: plan.features.iter().copied().collect(),
            quotas,
            current_period_end: live.map(|s| s.current_period_end),
            cancel_at_period_end: live.is_some_and(|s| s.cancel_at_period_end),
            pending_plan_id: live.and_then(|s| s.pending_plan_id),
            frozen: account.is_frozen(),
        })
    }

    /// Status → quota → credits.
    pub(super) fn evaluate(
        &self,
        account: &CreditAccount,
        feature: Feature,
        units: u64,
    ) -> Result<Authorization> {
        if units == 0 {
            return Err(BillingError::InvalidAmount("units must be positive".into()));
        }

        let subscription = match self.store.current_subscription(&account.account_id)? {
            Some(s) if s.status.is_entitled() => s,
            other => {
                return Err(BillingError::SubscriptionInactive {
                    status: other.map(|s| s.status),
                })
            }
        };
        let plan = self.catalog.get(subscription.plan_id)?;

        let quota = match feature.quota_resource() {
            Some(resource) => {
                let period_key = quota_period_key(resource, self.now());
                let used = self
                    .store
                    .quota_count(&account.account_id, resource, &period_key)?;
                Some(QuotaUse {
                    resource,
                    period_key,
                    used,
                    limit: plan.quota(resource),
                })
            }
            None => None,
        };

        if !plan.includes(feature) {
            return Err(BillingError::QuotaExceeded {
                resource: quota
                    .as_ref()
                    .map_or(feature.as_str(), |q| q.resource.as_str())
                    .to_string(),
                limit: 0,
                used: quota.as_ref().map_or(0, |q| q.used),
                requested: units,
            });
        }

        if let Some(q) = &quota {
            if let Some(limit) = q.limit {
                let fits = q.used.checked_add(units).is_some_and(|total| total <= limit);
                if !fits {
                    return Err(BillingError::QuotaExceeded {
                        resource: q.resource.to_string(),
                        limit,
                        used: q.used,
                        requested: units,
                    });
                }
            }
        }

        let cost = self
            .costs
            .cost(feature, units)
            .ok_or_else(|| BillingError::InvalidAmount("cost overflows".into()))?;
        if account.balance < cost {
            return Err(BillingError::InsufficientCredits {
                balance: account.balance,
                required: cost,
            });
        }

        Ok(Authorization {
            account_id: account.account_id,
            feature,
            units,
            plan_id: plan.id,
            status: subscription.status,
            cost,
            balance: account.balance,
            quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use tally_core::LifecycleEvent;
    use tally_store::{Store, WriteSet};

    #[test]
    fn free_account_is_entitled_to_chat() {
        let fx = fixture();
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        let auth = fx.engine.preview(account, Feature::Chat, 10).unwrap();
        assert_eq!(auth.plan_id, PlanId::Free);
        assert_eq!(auth.cost, 10);
        assert!(auth.quota.is_none());
    }

    #[test]
    fn status_is_checked_before_credits() {
        let fx = fixture();
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        let mut sub = fx.store.current_subscription(&account).unwrap().unwrap();
        sub.transition(LifecycleEvent::UserCanceled, fx.engine.now())
            .unwrap();
        fx.store
            .commit(WriteSet::default().with_subscription(sub))
            .unwrap();

        let err = fx.engine.preview(account, Feature::Chat, 1_000_000).unwrap_err();
        assert_eq!(
            err,
            BillingError::SubscriptionInactive {
                status: Some(SubscriptionStatus::Canceled)
            }
        );
    }

    #[test]
    fn feature_outside_plan_is_a_zero_quota() {
        let fx = fixture();
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        let err = fx
            .engine
            .preview(account, Feature::ScheduledTaskRun, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuotaExceeded { limit: 0, ref resource, .. } if resource == "scheduled_task_runs"
        ));
    }

    #[test]
    fn quota_is_checked_before_credits() {
        let fx = fixture();
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        // Free allows 20 agent calls; 21 would also cost more than the balance.
        let err = fx.engine.preview(account, Feature::AgentCall, 21).unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuotaExceeded { limit: 20, used: 0, requested: 21, .. }
        ));

        let err = fx.engine.preview(account, Feature::AgentCall, 11).unwrap_err();
        assert_eq!(
            err,
            BillingError::InsufficientCredits {
                balance: 50,
                required: 55
            }
        );
    }

    #[test]
    fn entitlements_summarize_plan() {
        let fx = fixture();
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        let ent = fx.engine.entitlements(account).unwrap();
        assert_eq!(ent.plan_id, PlanId::Free);
        assert!(ent.entitled);
        assert_eq!(ent.credit_balance, 50);
        let tasks = ent
            .quotas
            .iter()
            .find(|q| q.resource == Resource::ScheduledTaskRuns)
            .unwrap();
        assert_eq!(tasks.limit, Some(0));
        let collections = ent
            .quotas
            .iter()
            .find(|q| q.resource == Resource::Collections)
            .unwrap();
        assert_eq!(collections.limit, Some(3));
        assert_eq!(collections.period_key, "lifetime");
    }
}
