//! Audit events delivered to the observability sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, PaymentIntentId, SubscriptionId};
use crate::ledger::LedgerEntry;
use crate::payment::IntentStatus;
use crate::plan::PlanId;
use crate::subscription::SubscriptionStatus;

/// Something an operator may want to see in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A ledger entry was committed.
    LedgerEntry {
        /// The committed entry.
        entry: LedgerEntry,
    },
    /// A subscription was created or changed state or plan.
    SubscriptionTransition {
        /// Account.
        account_id: AccountId,
        /// Subscription record.
        subscription_id: SubscriptionId,
        /// Previous status, `None` for a new record.
        from: Option<SubscriptionStatus>,
        /// New status.
        to: SubscriptionStatus,
        /// Plan after the change.
        plan_id: PlanId,
        /// Trigger (`payment_succeeded`, `upgrade`, `sweep`, ...).
        cause: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// A payment intent reached a final status.
    IntentFinalized {
        /// Account.
        account_id: AccountId,
        /// Intent.
        intent_id: PaymentIntentId,
        /// Final status.
        status: IntentStatus,
        /// When.
        at: DateTime<Utc>,
    },
    /// The cached balance disagreed with the ledger; the account is frozen.
    IntegrityViolation {
        /// Account.
        account_id: AccountId,
        /// Cached balance.
        cached: i64,
        /// Ledger sum.
        ledger: i64,
        /// When.
        at: DateTime<Utc>,
    },
    /// An operator rebuilt the cached projection from the ledger.
    ProjectionRebuilt {
        /// Account.
        account_id: AccountId,
        /// Cached balance before the rebuild.
        previous: i64,
        /// Balance after the rebuild.
        balance: i64,
        /// Operator.
        admin_id: String,
        /// When.
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Account the event concerns.
    #[must_use]
    pub fn account_id(&self) -> AccountId {
        match self {
            Self::LedgerEntry { entry } => entry.account_id,
            Self::SubscriptionTransition { account_id, .. }
            | Self::IntentFinalized { account_id, .. }
            | Self::IntegrityViolation { account_id, .. }
            | Self::ProjectionRebuilt { account_id, .. } => *account_id,
        }
    }

    /// Short event type name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LedgerEntry { .. } => "ledger_entry",
            Self::SubscriptionTransition { .. } => "subscription_transition",
            Self::IntentFinalized { .. } => "intent_finalized",
            Self::IntegrityViolation { .. } => "integrity_violation",
            Self::ProjectionRebuilt { .. } => "projection_rebuilt",
        }
    }
}
