//! Non-credit quota counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::period_key;
use crate::feature::{QuotaScope, Resource, LIFETIME_PERIOD_KEY};
use crate::ids::AccountId;

/// Usage of one resource by one account in one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageQuotaCounter {
    /// Account.
    pub account_id: AccountId,
    /// Counted resource.
    pub resource: Resource,
    /// `YYYY-MM` for per-period resources, `lifetime` otherwise.
    pub period_key: String,
    /// Units consumed.
    pub count: u64,
}

impl UsageQuotaCounter {
    /// An empty counter.
    #[must_use]
    pub fn new(account_id: AccountId, resource: Resource, period_key: impl Into<String>) -> Self {
        Self {
            account_id,
            resource,
            period_key: period_key.into(),
            count: 0,
        }
    }

    /// Whether `requested` more units fit under `limit`.
    #[must_use]
    pub const fn fits(&self, requested: u64, limit: u64) -> bool {
        match self.count.checked_add(requested) {
            Some(total) => total <= limit,
            None => false,
        }
    }
}

/// The counter key a resource uses at `at`.
#[must_use]
pub fn quota_period_key(resource: Resource, at: DateTime<Utc>) -> String {
    match resource.scope() {
        QuotaScope::Period => period_key(at),
        QuotaScope::Lifetime => LIFETIME_PERIOD_KEY.to_string(),
    }
}
