//! Ledger entries and posting rules.
//!
//! The ledger is append-only. [`post_entries`] is the single place where a
//! balance changes: it validates a batch of [`EntryDraft`]s against the
//! account projection, stamps each entry with its resulting balance and
//! sequence number, and updates the projection. Callers persist the entries
//! and the projection together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::CreditAccount;
use crate::error::{BillingError, Result};
use crate::ids::{AccountId, EntryId};

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Allowance issued at the start of a credit period.
    MonthlyGrant,
    /// Credits consumed by a metered feature or a plan charge.
    FeatureDebit,
    /// Credits bought through the payment provider.
    PaymentCredit,
    /// Credits returned (compensation, unused plan time).
    Refund,
    /// Unused allowance above the rollover cap, zeroed at period start.
    RolloverExpiry,
    /// Operator correction.
    ManualAdjustment,
}

/// Sign constraint of an entry reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Delta must be positive.
    Credit,
    /// Delta must be negative.
    Debit,
    /// Either sign.
    Either,
}

impl EntryReason {
    /// Stable string name, also used in idempotency keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MonthlyGrant => "monthly_grant",
            Self::FeatureDebit => "feature_debit",
            Self::PaymentCredit => "payment_credit",
            Self::Refund => "refund",
            Self::RolloverExpiry => "rollover_expiry",
            Self::ManualAdjustment => "manual_adjustment",
        }
    }

    /// Allowed sign of the delta.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::MonthlyGrant | Self::PaymentCredit | Self::Refund => Direction::Credit,
            Self::FeatureDebit | Self::RolloverExpiry => Direction::Debit,
            Self::ManualAdjustment => Direction::Either,
        }
    }

    /// Whether a positive delta with this reason is subject to the balance
    /// ceiling. Refunds restore an earlier balance and are exempt.
    #[must_use]
    pub const fn counts_toward_ceiling(&self) -> bool {
        !matches!(self, Self::Refund)
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniqueness key of a ledger entry: `(account, reason, reference)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    /// Account.
    pub account_id: AccountId,
    /// Reason.
    pub reason: EntryReason,
    /// Caller-supplied opaque reference.
    pub reference_id: String,
}

impl IdempotencyKey {
    /// Build a key.
    #[must_use]
    pub fn new(account_id: AccountId, reason: EntryReason, reference_id: impl Into<String>) -> Self {
        Self {
            account_id,
            reason,
            reference_id: reference_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.reason, self.reference_id)
    }
}

/// An immutable, committed balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id.
    pub id: EntryId,
    /// Account the entry belongs to.
    pub account_id: AccountId,
    /// Position in the account's ledger, gap-free from 0.
    pub sequence: u64,
    /// Signed change in credits.
    pub delta: i64,
    /// Why the balance changed.
    pub reason: EntryReason,
    /// Idempotency reference.
    pub reference_id: String,
    /// Balance right after this entry.
    pub resulting_balance: i64,
    /// Audit context (feature, units, plan, ...).
    pub metadata: serde_json::Value,
    /// Commit time.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// The uniqueness key of this entry.
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.account_id, self.reason, self.reference_id.clone())
    }
}

/// A balance change that has not been posted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    /// Why.
    pub reason: EntryReason,
    /// Signed change.
    pub delta: i64,
    /// Idempotency reference.
    pub reference_id: String,
    /// Audit context.
    pub metadata: serde_json::Value,
}

impl EntryDraft {
    /// A positive change.
    #[must_use]
    pub fn credit(reason: EntryReason, amount: i64, reference_id: impl Into<String>) -> Self {
        Self {
            reason,
            delta: amount,
            reference_id: reference_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// A negative change of `amount`.
    #[must_use]
    pub fn debit(reason: EntryReason, amount: i64, reference_id: impl Into<String>) -> Self {
        Self {
            reason,
            delta: -amount,
            reference_id: reference_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach audit metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Limits enforced while posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingLimits {
    /// Maximum balance a ceiling-bound credit may produce.
    pub balance_ceiling: i64,
}

/// Validate `drafts` against `account` and append them.
///
/// Either every draft is posted and the projection updated, or an error is
/// returned and `account` is left untouched.
///
/// # Errors
///
/// - `IntegrityViolation` if the account is frozen.
/// - `InvalidAmount` for a zero delta, a sign that contradicts the reason, or overflow.
/// - `InsufficientCredits` if any intermediate balance would go negative.
/// - `PlanLimitExceeded` if a credit would cross the balance ceiling.
pub fn post_entries(
    account: &mut CreditAccount,
    drafts: Vec<EntryDraft>,
    limits: PostingLimits,
    now: DateTime<Utc>,
) -> Result<Vec<LedgerEntry>> {
    if let Some(note) = &account.frozen {
        return Err(BillingError::IntegrityViolation {
            account_id: account.account_id,
            cached: note.cached,
            ledger: note.ledger,
        });
    }

    let mut next = account.clone();
    let mut entries = Vec::with_capacity(drafts.len());

    for draft in drafts {
        validate_sign(&draft)?;

        let resulting = next
            .balance
            .checked_add(draft.delta)
            .ok_or_else(|| BillingError::InvalidAmount("balance overflow".into()))?;

        if resulting < 0 {
            return Err(BillingError::InsufficientCredits {
                balance: next.balance,
                required: -draft.delta,
            });
        }

        if draft.delta > 0
            && draft.reason.counts_toward_ceiling()
            && resulting > limits.balance_ceiling
        {
            return Err(BillingError::PlanLimitExceeded {
                ceiling: limits.balance_ceiling,
                attempted: resulting,
            });
        }

        if draft.delta > 0 {
            next.lifetime_credited = next.lifetime_credited.saturating_add(draft.delta);
        } else {
            next.lifetime_debited = next.lifetime_debited.saturating_add(-draft.delta);
        }

        entries.push(LedgerEntry {
            id: EntryId::generate(),
            account_id: next.account_id,
            sequence: next.next_sequence,
            delta: draft.delta,
            reason: draft.reason,
            reference_id: draft.reference_id,
            resulting_balance: resulting,
            metadata: draft.metadata,
            created_at: now,
        });

        next.balance = resulting;
        next.next_sequence += 1;
    }

    next.updated_at = now;
    *account = next;
    Ok(entries)
}

fn validate_sign(draft: &EntryDraft) -> Result<()> {
    if draft.delta == 0 {
        return Err(BillingError::InvalidAmount(format!(
            "{} entry with zero delta",
            draft.reason
        )));
    }
    let ok = match draft.reason.direction() {
        Direction::Credit => draft.delta > 0,
        Direction::Debit => draft.delta < 0,
        Direction::Either => true,
    };
    if ok {
        Ok(())
    } else {
        Err(BillingError::InvalidAmount(format!(
            "{} entry cannot have delta {}",
            draft.reason, draft.delta
        )))
    }
}

/// Rollover rule applied at every credit period boundary.
///
/// Policy is clip-then-grant: the balance is first clipped to
/// `allowance * factor_percent / 100`, then the new allowance is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Rollover cap as a percentage of the monthly allowance.
    pub factor_percent: u32,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self {
            factor_percent: 100,
        }
    }
}

impl RolloverPolicy {
    /// Rollover cap for an allowance.
    #[must_use]
    pub fn cap(&self, allowance: i64) -> i64 {
        let cap = i128::from(allowance.max(0)) * i128::from(self.factor_percent) / 100;
        i64::try_from(cap).unwrap_or(i64::MAX)
    }

    /// Drafts that move an account from the old period into `period`.
    ///
    /// Yields a `rollover_expiry` entry for the excess above the cap (if any)
    /// followed by the `monthly_grant` (if the allowance is positive).
    #[must_use]
    pub fn period_drafts(&self, balance: i64, allowance: i64, period: &str) -> Vec<EntryDraft> {
        let cap = self.cap(allowance);
        let mut drafts = Vec::with_capacity(2);

        let excess = balance - cap;
        if excess > 0 {
            drafts.push(
                EntryDraft::debit(EntryReason::RolloverExpiry, excess, rollover_reference(period))
                    .with_metadata(serde_json::json!({
                        "period": period,
                        "rollover_cap": cap,
                    })),
            );
        }

        if allowance > 0 {
            drafts.push(
                EntryDraft::credit(EntryReason::MonthlyGrant, allowance, grant_reference(period))
                    .with_metadata(serde_json::json!({ "period": period })),
            );
        }

        drafts
    }
}

/// Idempotency reference of the monthly grant for a period.
#[must_use]
pub fn grant_reference(period: &str) -> String {
    format!("grant:{period}")
}

/// Idempotency reference of the rollover expiry for a period.
#[must_use]
pub fn rollover_reference(period: &str) -> String {
    format!("rollover:{period}")
}

/// Result of an idempotent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation took effect now.
    Applied(T),
    /// The operation had already been applied; this is the original result.
    Duplicate(T),
}

impl<T> Outcome<T> {
    /// The carried value, regardless of variant.
    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(v) | Self::Duplicate(v) => v,
        }
    }

    /// Borrow the carried value.
    pub const fn value(&self) -> &T {
        match self {
            Self::Applied(v) | Self::Duplicate(v) => v,
        }
    }

    /// Whether this was a replay.
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    /// Transform the carried value, keeping the variant.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Applied(v) => Outcome::Applied(f(v)),
            Self::Duplicate(v) => Outcome::Duplicate(f(v)),
        }
    }
}
