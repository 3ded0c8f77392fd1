//! Metered features, quota resources, and the feature cost table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A metered action that collaborators ask permission for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// A chat message.
    Chat,
    /// A single AI agent invocation.
    AgentCall,
    /// One run of a scheduled task.
    ScheduledTaskRun,
    /// Creating a document collection.
    CollectionCreate,
}

impl Feature {
    /// All features, in display order.
    pub const ALL: [Self; 4] = [
        Self::Chat,
        Self::AgentCall,
        Self::ScheduledTaskRun,
        Self::CollectionCreate,
    ];

    /// Stable string name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::AgentCall => "agent_call",
            Self::ScheduledTaskRun => "scheduled_task_run",
            Self::CollectionCreate => "collection_create",
        }
    }

    /// The non-credit quota this feature consumes, if any.
    #[must_use]
    pub const fn quota_resource(&self) -> Option<Resource> {
        match self {
            Self::Chat => None,
            Self::AgentCall => Some(Resource::AgentCalls),
            Self::ScheduledTaskRun => Some(Resource::ScheduledTaskRuns),
            Self::CollectionCreate => Some(Resource::Collections),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource tracked by a [`UsageQuotaCounter`](crate::UsageQuotaCounter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Agent invocations per credit period.
    AgentCalls,
    /// Scheduled task runs per credit period.
    ScheduledTaskRuns,
    /// Collections owned, over the account lifetime.
    Collections,
}

impl Resource {
    /// Stable string name, also used in storage keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AgentCalls => "agent_calls",
            Self::ScheduledTaskRuns => "scheduled_task_runs",
            Self::Collections => "collections",
        }
    }

    /// How the counter for this resource resets.
    #[must_use]
    pub const fn scope(&self) -> QuotaScope {
        match self {
            Self::AgentCalls | Self::ScheduledTaskRuns => QuotaScope::Period,
            Self::Collections => QuotaScope::Lifetime,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reset behaviour of a quota counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// Counter is keyed by credit period and starts fresh every month.
    Period,
    /// Counter never resets.
    Lifetime,
}

/// Period key used for lifetime counters.
pub const LIFETIME_PERIOD_KEY: &str = "lifetime";

/// Credits charged per unit of each feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCostTable {
    costs: BTreeMap<Feature, i64>,
}

impl Default for FeatureCostTable {
    fn default() -> Self {
        let costs = BTreeMap::from([
            (Feature::Chat, 1),
            (Feature::AgentCall, 5),
            (Feature::ScheduledTaskRun, 3),
            (Feature::CollectionCreate, 1),
        ]);
        Self { costs }
    }
}

impl FeatureCostTable {
    /// Build a table from explicit per-unit costs.
    #[must_use]
    pub fn new(costs: BTreeMap<Feature, i64>) -> Self {
        Self { costs }
    }

    /// Credits per unit for a feature. Unknown features cost nothing.
    #[must_use]
    pub fn unit_cost(&self, feature: Feature) -> i64 {
        self.costs.get(&feature).copied().unwrap_or(0)
    }

    /// Total cost of `units` of a feature, or `None` on overflow.
    #[must_use]
    pub fn cost(&self, feature: Feature, units: u64) -> Option<i64> {
        let units = i64::try_from(units).ok()?;
        self.unit_cost(feature).checked_mul(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_costs() {
        let table = FeatureCostTable::default();
        assert_eq!(table.cost(Feature::Chat, 3), Some(3));
        assert_eq!(table.cost(Feature::AgentCall, 2), Some(10));
        assert_eq!(table.cost(Feature::AgentCall, u64::MAX), None);
    }

    #[test]
    fn collections_are_lifetime_scoped() {
        assert_eq!(Resource::Collections.scope(), QuotaScope::Lifetime);
        assert_eq!(Resource::AgentCalls.scope(), QuotaScope::Period);
        assert_eq!(Feature::Chat.quota_resource(), None);
    }
}
