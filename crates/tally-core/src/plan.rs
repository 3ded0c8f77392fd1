//! The plan catalog.
//!
//! Plans are immutable rows: prices, the monthly credit allowance, non-credit
//! quotas and the feature set. Every layer that needs a price or an allowance
//! reads it from [`PlanCatalog`]; nothing else hardcodes plan numbers.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{BillingError, Result};
use crate::feature::{Feature, Resource};

// ============================================================================
// Constants
// ============================================================================

/// Free plan monthly credit allowance.
pub const FREE_PLAN_CREDITS: i64 = 50;

/// Pro plan monthly price in minor units ($9.99).
pub const PRO_PLAN_MONTHLY_PRICE: i64 = 999;

/// Pro plan yearly price in minor units ($99.90).
pub const PRO_PLAN_YEARLY_PRICE: i64 = 9990;

/// Pro plan monthly credit allowance.
pub const PRO_PLAN_CREDITS: i64 = 1500;

/// Premium plan monthly price in minor units ($29.00).
pub const PREMIUM_PLAN_MONTHLY_PRICE: i64 = 2900;

/// Premium plan yearly price in minor units ($290.00).
pub const PREMIUM_PLAN_YEARLY_PRICE: i64 = 29000;

/// Premium plan monthly credit allowance.
pub const PREMIUM_PLAN_CREDITS: i64 = 5000;

/// Catalog plan identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    /// Free tier.
    Free,
    /// Pro tier.
    Pro,
    /// Premium tier.
    Premium,
}

impl PlanId {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanId {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            other => Err(BillingError::PlanNotFound {
                plan: other.to_string(),
            }),
        }
    }
}

/// Billing cadence of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    /// Billed every month.
    Monthly,
    /// Billed every twelve months.
    Yearly,
}

impl BillingPeriod {
    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Length of one billing window in calendar months.
    #[must_use]
    pub const fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
        }
    }

    /// End of the window starting at `start`.
    ///
    /// Month arithmetic clamps to the last day of shorter months.
    #[must_use]
    pub fn advance(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_months(Months::new(self.months()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Start of window number `cycles` counted from `anchor`, or `None` past
    /// the representable range.
    ///
    /// Always measured from the anchor so short months do not shift later
    /// windows.
    #[must_use]
    pub fn advance_by(&self, anchor: DateTime<Utc>, cycles: u32) -> Option<DateTime<Utc>> {
        anchor.checked_add_months(Months::new(self.months().checked_mul(cycles)?))
    }
}

/// Prices per billing period, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    /// Monthly price.
    pub monthly: i64,
    /// Yearly price.
    pub yearly: i64,
}

impl PriceTable {
    /// Price for the given period.
    #[must_use]
    pub const fn for_period(&self, period: BillingPeriod) -> i64 {
        match period {
            BillingPeriod::Monthly => self.monthly,
            BillingPeriod::Yearly => self.yearly,
        }
    }
}

/// An immutable catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Display name.
    pub name: String,
    /// Price per billing period.
    pub prices: PriceTable,
    /// Credits granted at the start of every credit period.
    pub monthly_credit_allowance: i64,
    /// Non-credit limits. A resource missing from the map is unlimited.
    pub quotas: BTreeMap<Resource, u64>,
    /// Features unlocked by the plan.
    pub features: BTreeSet<Feature>,
    /// Ordering used to tell upgrades from downgrades.
    pub rank: u8,
}

impl Plan {
    /// Whether the plan unlocks a feature.
    #[must_use]
    pub fn includes(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Quota limit for a resource, `None` when unlimited.
    #[must_use]
    pub fn quota(&self, resource: Resource) -> Option<u64> {
        self.quotas.get(&resource).copied()
    }

    /// Whether a subscription to this plan costs money.
    #[must_use]
    pub const fn is_paid(&self) -> bool {
        self.prices.monthly > 0 || self.prices.yearly > 0
    }

    /// Credits granted when a payment for this plan succeeds.
    #[must_use]
    pub const fn credits_for_payment(&self) -> i64 {
        self.monthly_credit_allowance
    }
}

/// The static plan table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: BTreeMap<PlanId, Plan>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let free = Plan {
            id: PlanId::Free,
            name: "Free".into(),
            prices: PriceTable {
                monthly: 0,
                yearly: 0,
            },
            monthly_credit_allowance: FREE_PLAN_CREDITS,
            quotas: BTreeMap::from([(Resource::Collections, 3), (Resource::AgentCalls, 20)]),
            features: BTreeSet::from([Feature::Chat, Feature::AgentCall, Feature::CollectionCreate]),
            rank: 0,
        };

        let pro = Plan {
            id: PlanId::Pro,
            name: "Pro".into(),
            prices: PriceTable {
                monthly: PRO_PLAN_MONTHLY_PRICE,
                yearly: PRO_PLAN_YEARLY_PRICE,
            },
            monthly_credit_allowance: PRO_PLAN_CREDITS,
            quotas: BTreeMap::from([
                (Resource::Collections, 50),
                (Resource::AgentCalls, 500),
                (Resource::ScheduledTaskRuns, 200),
            ]),
            features: Feature::ALL.into_iter().collect(),
            rank: 1,
        };

        let premium = Plan {
            id: PlanId::Premium,
            name: "Premium".into(),
            prices: PriceTable {
                monthly: PREMIUM_PLAN_MONTHLY_PRICE,
                yearly: PREMIUM_PLAN_YEARLY_PRICE,
            },
            monthly_credit_allowance: PREMIUM_PLAN_CREDITS,
            quotas: BTreeMap::from([(Resource::ScheduledTaskRuns, 2000)]),
            features: Feature::ALL.into_iter().collect(),
            rank: 2,
        };

        Self::new([free, pro, premium])
    }
}

impl PlanCatalog {
    /// Build a catalog from plan rows.
    #[must_use]
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    /// Look up a plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound` if the catalog has no such row.
    pub fn get(&self, id: PlanId) -> Result<&Plan> {
        self.plans.get(&id).ok_or_else(|| BillingError::PlanNotFound {
            plan: id.to_string(),
        })
    }

    /// All plans ordered by rank.
    #[must_use]
    pub fn all(&self) -> Vec<&Plan> {
        let mut plans: Vec<_> = self.plans.values().collect();
        plans.sort_by_key(|p| p.rank);
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_catalog_prices() {
        let catalog = PlanCatalog::default();
        let pro = catalog.get(PlanId::Pro).unwrap();
        assert_eq!(pro.prices.for_period(BillingPeriod::Monthly), 999);
        assert_eq!(pro.credits_for_payment(), 1500);
        assert_eq!(
            catalog.get(PlanId::Premium).unwrap().prices.monthly,
            2900
        );
        assert!(!catalog.get(PlanId::Free).unwrap().is_paid());
    }

    #[test]
    fn free_plan_excludes_scheduled_tasks() {
        let catalog = PlanCatalog::default();
        let free = catalog.get(PlanId::Free).unwrap();
        assert!(!free.includes(Feature::ScheduledTaskRun));
        assert_eq!(free.quota(Resource::Collections), Some(3));
        assert_eq!(free.quota(Resource::ScheduledTaskRuns), None);
    }

    #[test]
    fn plans_sorted_by_rank() {
        let catalog = PlanCatalog::default();
        let ids: Vec<_> = catalog.all().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PlanId::Free, PlanId::Pro, PlanId::Premium]);
    }

    #[test]
    fn billing_period_clamps_month_end() {
        let jan_31 = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let end = BillingPeriod::Monthly.advance(jan_31);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());

        let yearly = BillingPeriod::Yearly.advance(jan_31);
        assert_eq!(yearly, Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn plan_id_parses() {
        assert_eq!("pro".parse::<PlanId>().unwrap(), PlanId::Pro);
        assert!("gold".parse::<PlanId>().is_err());
    }
}
