//! Credit accounts.
//!
//! A [`CreditAccount`] is the cached projection of an owner's ledger. Its
//! `balance` is only ever rewritten together with the entries that justify
//! it, inside one atomic commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AccountId;

/// Format the credit period key (`YYYY-MM`, UTC) for an instant.
#[must_use]
pub fn period_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// A credit account, 1:1 with its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// The owner (and account) id.
    pub account_id: AccountId,

    /// Cached balance in credits. Equals the sum of all ledger deltas.
    pub balance: i64,

    /// Maximum balance carried into the next credit period.
    pub rollover_cap: i64,

    /// Credit period of the last monthly grant.
    pub last_replenished_period: Option<String>,

    /// Sequence number the next ledger entry will receive.
    pub next_sequence: u64,

    /// Lifetime sum of positive deltas.
    pub lifetime_credited: i64,

    /// Lifetime sum of negative deltas (stored positive).
    pub lifetime_debited: i64,

    /// Set when reconciliation found a mismatch. Writes are refused until an
    /// operator clears it.
    pub frozen: Option<FreezeNote>,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the projection last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create an empty account.
    #[must_use]
    pub fn new(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance: 0,
            rollover_cap: 0,
            last_replenished_period: None,
            next_sequence: 0,
            lifetime_credited: 0,
            lifetime_debited: 0,
            frozen: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether writes are currently refused.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Whether the balance covers `amount`.
    #[must_use]
    pub const fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Whether the grant for `period` has already been issued.
    #[must_use]
    pub fn replenished_for(&self, period: &str) -> bool {
        self.last_replenished_period.as_deref() == Some(period)
    }
}

/// Why and when an account was frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeNote {
    /// Cached balance at detection time.
    pub cached: i64,
    /// Ledger sum at detection time.
    pub ledger: i64,
    /// When the violation was detected.
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_account_is_empty() {
        let account = CreditAccount::new(AccountId::generate(), Utc::now());
        assert_eq!(account.balance, 0);
        assert_eq!(account.next_sequence, 0);
        assert!(!account.is_frozen());
        assert!(account.last_replenished_period.is_none());
    }

    #[test]
    fn period_key_is_calendar_month() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 23, 59, 0).unwrap();
        assert_eq!(period_key(at), "2025-03");
    }

    #[test]
    fn sufficient_credits_is_inclusive() {
        let mut account = CreditAccount::new(AccountId::generate(), Utc::now());
        account.balance = 30;
        assert!(account.has_sufficient_credits(30));
        assert!(!account.has_sufficient_credits(31));
    }
}
