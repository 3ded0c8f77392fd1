//! Subscription lifecycle: account opening, trials, plan changes,
//! cancellation and the periodic renewal sweep.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tally_core::{
    period_key, post_entries, AccountId, BillingError, BillingPeriod, CreditAccount, EntryDraft,
    EntryReason, Funding, IdempotencyKey, LedgerEntry, LifecycleEvent, Outcome, PlanId, Result,
    Subscription, SubscriptionStatus,
};
use tally_store::WriteSet;

use super::{transition_event, Engine};

/// Direction of a plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    /// Applied immediately with proration.
    Upgrade,
    /// Deferred to the next period boundary.
    Downgrade,
}

/// Result of [`Engine::change_plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanChange {
    /// Upgrade or downgrade.
    pub kind: PlanChangeKind,
    /// Subscription after the change.
    pub subscription: Subscription,
    /// Proration entries (upgrade only).
    pub entries: Vec<LedgerEntry>,
}

/// Counters from a renewal sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Accounts visited.
    pub accounts: usize,
    /// Monthly grants issued.
    pub grants: usize,
    /// Trials canceled at expiry.
    pub trials_expired: usize,
    /// Past-due subscriptions canceled after grace.
    pub past_due_canceled: usize,
    /// Subscriptions canceled at period end.
    pub period_end_canceled: usize,
    /// Deferred downgrades applied.
    pub downgrades_applied: usize,
    /// Billing windows rolled forward.
    pub windows_rolled: usize,
    /// Renewals debited from credits.
    pub renewals_charged: usize,
    /// Paid windows that ended unpaid and went past due.
    pub renewals_failed: usize,
    /// Accounts that failed and will be retried next sweep.
    pub failed: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: Self) {
        self.accounts += other.accounts;
        self.grants += other.grants;
        self.trials_expired += other.trials_expired;
        self.past_due_canceled += other.past_due_canceled;
        self.period_end_canceled += other.period_end_canceled;
        self.downgrades_applied += other.downgrades_applied;
        self.windows_rolled += other.windows_rolled;
        self.renewals_charged += other.renewals_charged;
        self.renewals_failed += other.renewals_failed;
        self.failed += other.failed;
    }
}

impl Engine {
    /// Create the credit account, a free subscription and the first grant in
    /// one write.
    ///
    /// # Errors
    ///
    /// Returns a storage error. Re-opening returns [`Outcome::Duplicate`].
    pub fn open_account(&self, account_id: AccountId) -> Result<Outcome<CreditAccount>> {
        let free = self.catalog.get(PlanId::Free)?.clone();

        self.locks.with_account(account_id, || {
            if let Some(existing) = self.store.get_account(&account_id)? {
                return Ok(Outcome::Duplicate(existing));
            }

            let now = self.now();
            let mut account = CreditAccount::new(account_id, now);
            let subscription = Subscription::active(account_id, PlanId::Free, BillingPeriod::Monthly, now);
            let entries = self.apply_period_grant(&mut account, &free, &period_key(now))?;

            let event = transition_event(&subscription, None, "account_opened");
            self.commit(
                WriteSet::for_account(account.clone())
                    .with_entries(entries)
                    .with_subscription(subscription),
                vec![event],
            )?;

            tracing::info!(account_id = %account_id, balance = account.balance, "Account opened");
            Ok(Outcome::Applied(account))
        })
    }

    /// Start a trial of a paid plan.
    ///
    /// Allowed once per account, when nothing paid has ever been subscribed.
    /// A live free subscription is canceled in the same write.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the plan is free, a paid subscription
    /// exists or existed, or `AccountNotFound`.
    pub fn start_trial(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
    ) -> Result<Subscription> {
        if !self.catalog.get(plan_id)?.is_paid() {
            return Err(BillingError::invalid_transition(plan_id, "start_trial"));
        }

        self.locks.with_account(account_id, || {
            self.load_account(account_id)?;
            let history = self.store.subscriptions_for_owner(&account_id)?;
            if let Some(paid) = history.iter().rev().find(|s| s.plan_id != PlanId::Free) {
                return Err(BillingError::invalid_transition(paid.status, "start_trial"));
            }

            let now = self.now();
            let mut writes = WriteSet::default();
            let mut events = Vec::new();

            if let Some(mut free) = history.into_iter().rev().find(Subscription::is_live) {
                let from = free.transition(LifecycleEvent::UserCanceled, now)?;
                events.push(transition_event(&free, Some(from), "trial_started"));
                writes.subscriptions.push(free);
            }

            let trial = Subscription::trial(
                account_id,
                plan_id,
                billing_period,
                self.settings.trial_days,
                now,
            );
            events.push(transition_event(&trial, None, "trial_started"));
            writes.subscriptions.push(trial.clone());
            self.commit(writes, events)?;

            tracing::info!(
                account_id = %account_id,
                plan = %plan_id,
                trial_end = ?trial.trial_end,
                "Trial started"
            );
            Ok(trial)
        })
    }

    /// Change the plan of an active subscription.
    ///
    /// Upgrades apply now: the unused share of the current plan's price is
    /// refunded and the prorated price of the new plan is debited, both
    /// under `change_id`. Downgrades are stored as pending and applied by
    /// the sweep at the period boundary.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` if nothing is live.
    /// - `InvalidTransition` if the subscription is not active or the plan
    ///   is unchanged.
    /// - `InsufficientCredits` if the prorated cost cannot be covered.
    pub fn change_plan(
        &self,
        account_id: AccountId,
        target: PlanId,
        change_id: &str,
    ) -> Result<Outcome<PlanChange>> {
        if change_id.is_empty() {
            return Err(BillingError::InvalidPayload("change_id must not be empty".into()));
        }
        let target_plan = self.catalog.get(target)?.clone();

        self.locks.with_account(account_id, || {
            let mut subscription = self
                .live_subscription(account_id)?
                .ok_or(BillingError::SubscriptionNotFound { account_id })?;

            let mut prior = Vec::new();
            for reason in [EntryReason::Refund, EntryReason::FeatureDebit] {
                let key = IdempotencyKey::new(account_id, reason, change_id);
                if let Some(entry) = self.store.find_entry(&key)? {
                    prior.push(entry);
                }
            }
            if !prior.is_empty() {
                return Ok(Outcome::Duplicate(PlanChange {
                    kind: PlanChangeKind::Upgrade,
                    subscription,
                    entries: prior,
                }));
            }
            if subscription.pending_plan_id == Some(target) {
                return Ok(Outcome::Duplicate(PlanChange {
                    kind: PlanChangeKind::Downgrade,
                    subscription,
                    entries: Vec::new(),
                }));
            }

            if subscription.status != SubscriptionStatus::Active {
                return Err(BillingError::invalid_transition(subscription.status, "change_plan"));
            }
            if subscription.plan_id == target {
                return Err(BillingError::invalid_transition(
                    subscription.plan_id,
                    format!("change to {target}"),
                ));
            }

            let current_plan = self.catalog.get(subscription.plan_id)?;
            let now = self.now();

            if target_plan.rank <= current_plan.rank {
                subscription.pending_plan_id = Some(target);
                subscription.updated_at = now;
                let event = transition_event(&subscription, Some(subscription.status), "downgrade_scheduled");
                self.commit(
                    WriteSet::default().with_subscription(subscription.clone()),
                    vec![event],
                )?;

                tracing::info!(
                    account_id = %account_id,
                    from = %current_plan.id,
                    to = %target,
                    effective = %subscription.current_period_end,
                    "Downgrade scheduled"
                );
                return Ok(Outcome::Applied(PlanChange {
                    kind: PlanChangeKind::Downgrade,
                    subscription,
                    entries: Vec::new(),
                }));
            }

            let total = (subscription.current_period_end - subscription.current_period_start)
                .num_seconds()
                .max(1);
            let remaining = (subscription.current_period_end - now)
                .num_seconds()
                .clamp(0, total);
            let period = subscription.billing_period;
            let unused = prorate(current_plan.prices.for_period(period), remaining, total);
            let cost = prorate(target_plan.prices.for_period(period), remaining, total);
            let metadata = json!({
                "kind": "upgrade",
                "from": current_plan.id,
                "to": target,
                "remaining_seconds": remaining,
                "period_seconds": total,
            });

            let mut drafts = Vec::with_capacity(2);
            if unused > 0 {
                drafts.push(
                    EntryDraft::credit(EntryReason::Refund, unused, change_id)
                        .with_metadata(metadata.clone()),
                );
            }
            if cost > 0 {
                drafts.push(
                    EntryDraft::debit(EntryReason::FeatureDebit, cost, change_id)
                        .with_metadata(metadata),
                );
            }

            let mut account = self.load_account(account_id)?;
            let entries = post_entries(&mut account, drafts, self.limits(), now)?;

            if !current_plan.is_paid() {
                subscription.funding = Funding::Credits;
            }
            subscription.plan_id = target;
            subscription.pending_plan_id = None;
            subscription.updated_at = now;
            let event = transition_event(&subscription, Some(subscription.status), "upgrade");
            self.commit(
                WriteSet::for_account(account)
                    .with_entries(entries.clone())
                    .with_subscription(subscription.clone()),
                vec![event],
            )?;

            tracing::info!(
                account_id = %account_id,
                from = %current_plan.id,
                to = %target,
                refunded = unused,
                charged = cost,
                "Plan upgraded"
            );
            Ok(Outcome::Applied(PlanChange {
                kind: PlanChangeKind::Upgrade,
                subscription,
                entries,
            }))
        })
    }

    /// Cancel the live subscription, now or at the end of the window.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` or `InvalidTransition` if the
    /// subscription is not active.
    pub fn cancel(&self, account_id: AccountId, at_period_end: bool) -> Result<Subscription> {
        self.locks.with_account(account_id, || {
            let mut subscription = self
                .live_subscription(account_id)?
                .ok_or(BillingError::SubscriptionNotFound { account_id })?;
            let now = self.now();

            if at_period_end {
                if subscription.status != SubscriptionStatus::Active {
                    return Err(BillingError::invalid_transition(
                        subscription.status,
                        "cancel_at_period_end",
                    ));
                }
                if !subscription.cancel_at_period_end {
                    subscription.cancel_at_period_end = true;
                    subscription.updated_at = now;
                    self.commit(
                        WriteSet::default().with_subscription(subscription.clone()),
                        Vec::new(),
                    )?;
                    tracing::info!(
                        account_id = %account_id,
                        ends = %subscription.current_period_end,
                        "Cancellation scheduled"
                    );
                }
                return Ok(subscription);
            }

            let from = subscription.transition(LifecycleEvent::UserCanceled, now)?;
            let event = transition_event(&subscription, Some(from), "user_canceled");
            self.commit(
                WriteSet::default().with_subscription(subscription.clone()),
                vec![event],
            )?;
            tracing::info!(account_id = %account_id, "Subscription canceled");
            Ok(subscription)
        })
    }

    /// Undo a scheduled cancellation.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` or `InvalidTransition` if the
    /// subscription is not active.
    pub fn resume(&self, account_id: AccountId) -> Result<Subscription> {
        self.locks.with_account(account_id, || {
            let mut subscription = self
                .live_subscription(account_id)?
                .ok_or(BillingError::SubscriptionNotFound { account_id })?;
            if subscription.status != SubscriptionStatus::Active {
                return Err(BillingError::invalid_transition(subscription.status, "resume"));
            }
            if subscription.cancel_at_period_end {
                subscription.cancel_at_period_end = false;
                subscription.updated_at = self.now();
                self.commit(
                    WriteSet::default().with_subscription(subscription.clone()),
                    Vec::new(),
                )?;
                tracing::info!(account_id = %account_id, "Cancellation withdrawn");
            }
            Ok(subscription)
        })
    }

    /// Record a failed renewal charge: `active → past_due`.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` or `InvalidTransition`.
    pub fn renewal_failed(&self, account_id: AccountId) -> Result<Subscription> {
        self.locks.with_account(account_id, || {
            let mut subscription = self
                .live_subscription(account_id)?
                .ok_or(BillingError::SubscriptionNotFound { account_id })?;
            if subscription.status == SubscriptionStatus::PastDue {
                return Ok(subscription);
            }

            let from = subscription.transition(LifecycleEvent::RenewalFailed, self.now())?;
            let event = transition_event(&subscription, Some(from), "renewal_failed");
            self.commit(
                WriteSet::default().with_subscription(subscription.clone()),
                vec![event],
            )?;
            tracing::warn!(account_id = %account_id, plan = %subscription.plan_id, "Renewal failed, subscription past due");
            Ok(subscription)
        })
    }

    /// Run the renewal sweep over every live subscription.
    ///
    /// Per-account failures are logged and counted; they never stop the
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the live subscriptions cannot be listed.
    pub fn sweep(&self) -> Result<SweepReport> {
        let subscriptions = self.store.list_live_subscriptions()?;
        let mut seen = HashSet::new();
        let mut report = SweepReport::default();

        for subscription in subscriptions {
            if !seen.insert(subscription.owner_id) {
                continue;
            }
            match self.sweep_account(subscription.owner_id) {
                Ok(account_report) => report.absorb(account_report),
                Err(e) => {
                    report.accounts += 1;
                    report.failed += 1;
                    tracing::warn!(
                        account_id = %subscription.owner_id,
                        error = %e,
                        "Sweep failed for account"
                    );
                }
            }
        }

        tracing::info!(
            accounts = report.accounts,
            grants = report.grants,
            trials_expired = report.trials_expired,
            past_due_canceled = report.past_due_canceled,
            period_end_canceled = report.period_end_canceled,
            downgrades_applied = report.downgrades_applied,
            renewals_charged = report.renewals_charged,
            renewals_failed = report.renewals_failed,
            failed = report.failed,
            "Renewal sweep finished"
        );
        Ok(report)
    }

    /// Sweep one account: expire trials and grace windows, end, renew or
    /// lapse the billing window, apply a pending downgrade, then issue the
    /// monthly grant if the subscription is still entitled.
    ///
    /// A paid window that ends is renewed only when it is paid for:
    /// credit-funded subscriptions are debited the plan price, and
    /// provider-funded ones go past due until a new checkout succeeds.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a state machine violation.
    pub fn sweep_account(&self, account_id: AccountId) -> Result<SweepReport> {
        self.locks.with_account(account_id, || {
            let mut report = SweepReport {
                accounts: 1,
                ..SweepReport::default()
            };
            let Some(mut subscription) = self.live_subscription(account_id)? else {
                return Ok(report);
            };

            let original = subscription.clone();
            let now = self.now();
            let grace = Duration::days(self.settings.grace_period_days);
            let mut account = self.load_account(account_id)?;
            let mut entries = Vec::new();
            let mut events = Vec::new();

            match subscription.status {
                SubscriptionStatus::Trialing => {
                    let trial_end = subscription
                        .trial_end
                        .unwrap_or(subscription.current_period_end);
                    let deadline = if subscription.has_payment_method {
                        trial_end + grace
                    } else {
                        trial_end
                    };
                    if now >= deadline {
                        let from = subscription.transition(LifecycleEvent::TrialExpired, now)?;
                        events.push(transition_event(&subscription, Some(from), "trial_expired"));
                        report.trials_expired += 1;
                    }
                }
                SubscriptionStatus::PastDue => {
                    if self.grace_expired(&subscription, now) {
                        let from = subscription.transition(LifecycleEvent::GraceExpired, now)?;
                        events.push(transition_event(&subscription, Some(from), "grace_expired"));
                        report.past_due_canceled += 1;
                    } else if subscription.funding == Funding::Credits {
                        if let Some(charged) = self.charge_renewal(&mut account, &subscription, now)? {
                            let from = subscription.transition(LifecycleEvent::PaymentSucceeded, now)?;
                            subscription.roll_window(now);
                            events.push(transition_event(&subscription, Some(from), "renewal_charged"));
                            entries.extend(charged);
                            report.renewals_charged += 1;
                            report.windows_rolled += 1;
                        }
                    }
                }
                SubscriptionStatus::Active if now >= subscription.current_period_end => {
                    if subscription.cancel_at_period_end {
                        let from = subscription.transition(LifecycleEvent::PeriodEnded, now)?;
                        events.push(transition_event(&subscription, Some(from), "period_ended"));
                        report.period_end_canceled += 1;
                    } else {
                        if let Some(pending) = subscription.pending_plan_id.take() {
                            subscription.plan_id = pending;
                            report.downgrades_applied += 1;
                            events.push(transition_event(
                                &subscription,
                                Some(SubscriptionStatus::Active),
                                "downgrade_applied",
                            ));
                        }

                        let paid = self.catalog.get(subscription.plan_id)?.is_paid();
                        let renewed = match (paid, subscription.funding) {
                            (false, _) => true,
                            (true, Funding::Provider) => false,
                            (true, Funding::Credits) => {
                                match self.charge_renewal(&mut account, &subscription, now)? {
                                    Some(charged) => {
                                        entries.extend(charged);
                                        report.renewals_charged += 1;
                                        true
                                    }
                                    None => false,
                                }
                            }
                        };

                        if renewed {
                            subscription.roll_window(now);
                            report.windows_rolled += 1;
                        } else {
                            let from = subscription.transition(LifecycleEvent::RenewalFailed, now)?;
                            events.push(transition_event(&subscription, Some(from), "renewal_failed"));
                            report.renewals_failed += 1;
                            tracing::warn!(
                                account_id = %account_id,
                                plan = %subscription.plan_id,
                                funding = ?subscription.funding,
                                "Billing window ended unpaid, subscription past due"
                            );
                        }
                    }
                }
                SubscriptionStatus::Active | SubscriptionStatus::Canceled => {}
            }

            if subscription.status.is_entitled() {
                let period = period_key(now);
                if !account.replenished_for(&period) {
                    let plan = self.catalog.get(subscription.plan_id)?.clone();
                    let mut staged = account.clone();
                    match self.apply_period_grant(&mut staged, &plan, &period) {
                        Ok(granted) => {
                            account = staged;
                            entries.extend(granted);
                            report.grants += 1;
                        }
                        Err(e @ (BillingError::PlanLimitExceeded { .. }
                        | BillingError::IntegrityViolation { .. })) => {
                            tracing::warn!(
                                account_id = %account_id,
                                period = %period,
                                error = %e,
                                "Monthly grant skipped"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            let mut writes = WriteSet::default();
            if !entries.is_empty() {
                writes = WriteSet::for_account(account).with_entries(entries);
            }
            if subscription != original {
                writes.subscriptions.push(subscription);
            }
            if !writes.is_empty() {
                self.commit(writes, events)?;
            }
            Ok(report)
        })
    }

    /// Debit the plan price for the window that follows the current one.
    ///
    /// Returns `None` when the balance cannot cover it; the account is left
    /// untouched in that case.
    fn charge_renewal(
        &self,
        account: &mut CreditAccount,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<LedgerEntry>>> {
        let Some((window_start, _)) = subscription.next_window(now) else {
            return Ok(None);
        };
        let plan = self.catalog.get(subscription.plan_id)?;
        let price = plan.prices.for_period(subscription.billing_period);
        let reference = format!("renew:{}:{}", subscription.id, window_start.timestamp());

        let key = IdempotencyKey::new(account.account_id, EntryReason::FeatureDebit, reference.clone());
        if self.store.find_entry(&key)?.is_some() {
            return Ok(Some(Vec::new()));
        }

        let draft = EntryDraft::debit(EntryReason::FeatureDebit, price, reference).with_metadata(json!({
            "kind": "plan_renewal",
            "plan": plan.id,
            "billing_period": subscription.billing_period,
            "subscription_id": subscription.id,
            "window_start": window_start,
        }));
        let mut staged = account.clone();
        match post_entries(&mut staged, vec![draft], self.limits(), now) {
            Ok(entries) => {
                *account = staged;
                tracing::info!(
                    account_id = %account.account_id,
                    plan = %plan.id,
                    price,
                    balance = account.balance,
                    "Renewal charged in credits"
                );
                Ok(Some(entries))
            }
            Err(BillingError::InsufficientCredits { balance, required }) => {
                tracing::warn!(
                    account_id = %account.account_id,
                    plan = %plan.id,
                    balance,
                    required,
                    "Renewal charge declined"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// `price * remaining / total`, rounded down, without overflow.
fn prorate(price: i64, remaining: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    let value = i128::from(price) * i128::from(remaining) / i128::from(total);
    i64::try_from(value).unwrap_or(i64::MAX)
}
