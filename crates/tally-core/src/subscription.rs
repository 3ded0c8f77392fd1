//! Subscriptions and their lifecycle state machine.
//!
//! ```text
//!   trialing ──payment──▶ active ──renewal failed──▶ past_due
//!      │                  │  ▲                          │
//!      │ trial expired    │  └────────payment───────────┤
//!      ▼                  ▼ user cancel                 │ grace expired
//!   canceled ◀────────────┴─────────────────────────────┘
//! ```
//!
//! `canceled` is terminal. Reactivation always creates a new record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BillingError, Result};
use crate::ids::{AccountId, SubscriptionId};
use crate::plan::{BillingPeriod, PlanId};

/// Days a past-due subscription may recover before it is canceled.
pub const GRACE_PERIOD_DAYS: i64 = 7;

/// Default trial length in days.
pub const TRIAL_PERIOD_DAYS: i64 = 14;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In a free trial of a paid plan.
    Trialing,
    /// Paid up.
    Active,
    /// Renewal failed; inside the grace window.
    PastDue,
    /// Terminal.
    Canceled,
}

impl SubscriptionStatus {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    /// Whether metered features may be used in this state.
    #[must_use]
    pub const fn is_entitled(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active)
    }

    /// Whether this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Next state for `event`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for any edge not in the state machine.
    pub fn apply(self, event: LifecycleEvent) -> Result<Self> {
        use LifecycleEvent as E;
        use SubscriptionStatus as S;

        match (self, event) {
            (S::Trialing | S::PastDue | S::Active, E::PaymentSucceeded) => Ok(S::Active),
            (S::Trialing, E::TrialExpired)
            | (S::PastDue, E::GraceExpired)
            | (S::Active, E::UserCanceled | E::PeriodEnded) => Ok(S::Canceled),
            (S::Active, E::RenewalFailed) => Ok(S::PastDue),
            (from, event) => Err(BillingError::invalid_transition(from, event)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A payment for this subscription was captured.
    PaymentSucceeded,
    /// The trial ended without a successful payment.
    TrialExpired,
    /// The renewal charge failed.
    RenewalFailed,
    /// Past-due for longer than the grace window.
    GraceExpired,
    /// The user canceled immediately.
    UserCanceled,
    /// The period ended with `cancel_at_period_end` set.
    PeriodEnded,
}

impl LifecycleEvent {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment_succeeded",
            Self::TrialExpired => "trial_expired",
            Self::RenewalFailed => "renewal_failed",
            Self::GraceExpired => "grace_expired",
            Self::UserCanceled => "user_canceled",
            Self::PeriodEnded => "period_ended",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a subscription's renewals are paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Funding {
    /// Each window is a one-off provider checkout.
    #[default]
    Provider,
    /// Each window is debited from the credit balance.
    Credits,
}

/// A subscription record. Never deleted; only transitioned to `canceled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Record id.
    pub id: SubscriptionId,
    /// Owning account.
    pub owner_id: AccountId,
    /// Current plan.
    pub plan_id: PlanId,
    /// Billing cadence.
    pub billing_period: BillingPeriod,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Start of the current billing window.
    pub current_period_start: DateTime<Utc>,
    /// End of the current billing window.
    pub current_period_end: DateTime<Utc>,
    /// Cancel when the current window ends.
    pub cancel_at_period_end: bool,
    /// Deferred downgrade target.
    pub pending_plan_id: Option<PlanId>,
    /// End of the trial, for trialing records.
    pub trial_end: Option<DateTime<Utc>>,
    /// When the subscription entered `past_due`.
    pub past_due_since: Option<DateTime<Utc>>,
    /// When the subscription was canceled.
    pub canceled_at: Option<DateTime<Utc>>,
    /// Whether the provider holds a payment method for this record.
    pub has_payment_method: bool,
    /// Where renewal payments come from.
    #[serde(default)]
    pub funding: Funding,
    /// Start of the first window; later windows are whole periods from here.
    pub billing_anchor: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// A new `active` record with a window starting now.
    #[must_use]
    pub fn active(
        owner_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubscriptionId::generate(),
            owner_id,
            plan_id,
            billing_period,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: billing_period.advance(now),
            cancel_at_period_end: false,
            pending_plan_id: None,
            trial_end: None,
            past_due_since: None,
            canceled_at: None,
            has_payment_method: false,
            funding: Funding::Provider,
            billing_anchor: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// A new `trialing` record ending after `trial_days`.
    #[must_use]
    pub fn trial(
        owner_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
        trial_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let trial_end = now + Duration::days(trial_days);
        Self {
            status: SubscriptionStatus::Trialing,
            current_period_end: trial_end,
            trial_end: Some(trial_end),
            ..Self::active(owner_id, plan_id, billing_period, now)
        }
    }

    /// Whether the record is not canceled.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Drive the state machine and stamp the bookkeeping fields.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the edge is not allowed; the record is
    /// left untouched.
    pub fn transition(&mut self, event: LifecycleEvent, now: DateTime<Utc>) -> Result<SubscriptionStatus> {
        let from = self.status;
        let to = from.apply(event)?;

        match to {
            SubscriptionStatus::Active => {
                self.past_due_since = None;
                if from == SubscriptionStatus::Trialing {
                    self.trial_end = None;
                }
            }
            SubscriptionStatus::PastDue => self.past_due_since = Some(now),
            SubscriptionStatus::Canceled => {
                self.canceled_at = Some(now);
                self.cancel_at_period_end = false;
                self.pending_plan_id = None;
            }
            SubscriptionStatus::Trialing => {}
        }

        self.status = to;
        self.updated_at = now;
        Ok(from)
    }

    /// Start a fresh billing window at `now`.
    pub fn restart_window(&mut self, now: DateTime<Utc>) {
        self.billing_anchor = now;
        self.current_period_start = now;
        self.current_period_end = self.billing_period.advance(now);
        self.updated_at = now;
    }

    /// The anchored window that contains `now`, if the current one has
    /// ended.
    #[must_use]
    pub fn next_window(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if self.current_period_end > now {
            return None;
        }
        let mut start = self.billing_anchor;
        for cycles in 1.. {
            let end = self.billing_period.advance_by(self.billing_anchor, cycles)?;
            if end > now {
                return Some((start, end));
            }
            start = end;
        }
        None
    }

    /// Roll the window forward until it contains `now`.
    ///
    /// Windows stay aligned to the billing anchor rather than restarting at
    /// the sweep time.
    pub fn roll_window(&mut self, now: DateTime<Utc>) {
        if let Some((start, end)) = self.next_window(now) {
            self.current_period_start = start;
            self.current_period_end = end;
        }
        self.updated_at = now;
    }

    /// When the grace window of a past-due record closes.
    #[must_use]
    pub fn grace_deadline(&self, grace_days: i64) -> Option<DateTime<Utc>> {
        self.past_due_since.map(|since| since + Duration::days(grace_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn allowed_transitions() {
        use LifecycleEvent as E;
        use SubscriptionStatus as S;

        assert_eq!(S::Trialing.apply(E::PaymentSucceeded), Ok(S::Active));
        assert_eq!(S::Trialing.apply(E::TrialExpired), Ok(S::Canceled));
        assert_eq!(S::Active.apply(E::RenewalFailed), Ok(S::PastDue));
        assert_eq!(S::PastDue.apply(E::PaymentSucceeded), Ok(S::Active));
        assert_eq!(S::PastDue.apply(E::GraceExpired), Ok(S::Canceled));
        assert_eq!(S::Active.apply(E::UserCanceled), Ok(S::Canceled));
        assert_eq!(S::Active.apply(E::PeriodEnded), Ok(S::Canceled));
    }

    #[test]
    fn canceled_is_terminal() {
        for event in [
            LifecycleEvent::PaymentSucceeded,
            LifecycleEvent::RenewalFailed,
            LifecycleEvent::UserCanceled,
        ] {
            let err = SubscriptionStatus::Canceled.apply(event).unwrap_err();
            assert!(matches!(err, BillingError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn illegal_edges_are_rejected() {
        assert!(SubscriptionStatus::Trialing
            .apply(LifecycleEvent::RenewalFailed)
            .is_err());
        assert!(SubscriptionStatus::PastDue
            .apply(LifecycleEvent::UserCanceled)
            .is_err());
        assert!(SubscriptionStatus::Active
            .apply(LifecycleEvent::TrialExpired)
            .is_err());
    }

    #[test]
    fn past_due_stamps_and_clears() {
        let owner = AccountId::generate();
        let mut sub = Subscription::active(owner, PlanId::Pro, BillingPeriod::Monthly, t(1));

        sub.transition(LifecycleEvent::RenewalFailed, t(2)).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.grace_deadline(GRACE_PERIOD_DAYS), Some(t(9)));

        sub.transition(LifecycleEvent::PaymentSucceeded, t(3)).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.past_due_since.is_none());
    }

    #[test]
    fn failed_transition_leaves_record_untouched() {
        let owner = AccountId::generate();
        let mut sub = Subscription::trial(owner, PlanId::Pro, BillingPeriod::Monthly, 14, t(1));
        let before = sub.clone();
        assert!(sub.transition(LifecycleEvent::GraceExpired, t(2)).is_err());
        assert_eq!(sub, before);
    }

    #[test]
    fn roll_window_keeps_anchor() {
        let owner = AccountId::generate();
        let mut sub = Subscription::active(owner, PlanId::Pro, BillingPeriod::Monthly, t(15));
        let later = Utc.with_ymd_and_hms(2025, 3, 20, 0, 0, 0).unwrap();
        sub.roll_window(later);
        assert_eq!(sub.current_period_start, Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
        assert_eq!(sub.current_period_end, Utc.with_ymd_and_hms(2025, 4, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_end_anchor_does_not_drift() {
        let owner = AccountId::generate();
        let anchor = Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap();
        let mut sub = Subscription::active(owner, PlanId::Pro, BillingPeriod::Monthly, anchor);
        assert_eq!(sub.current_period_end, Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap());

        sub.roll_window(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(sub.current_period_end, Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap());

        sub.roll_window(Utc.with_ymd_and_hms(2025, 4, 2, 0, 0, 0).unwrap());
        assert_eq!(sub.current_period_start, Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap());
        assert_eq!(sub.current_period_end, Utc.with_ymd_and_hms(2025, 4, 30, 0, 0, 0).unwrap());
    }

    #[test]
    fn open_window_is_not_rolled() {
        let owner = AccountId::generate();
        let sub = Subscription::active(owner, PlanId::Pro, BillingPeriod::Monthly, t(1));
        assert!(sub.next_window(t(20)).is_none());
    }

    #[test]
    fn trial_record_ends_after_trial_days() {
        let owner = AccountId::generate();
        let sub = Subscription::trial(owner, PlanId::Premium, BillingPeriod::Yearly, 14, t(1));
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.trial_end, Some(t(15)));
    }
}
