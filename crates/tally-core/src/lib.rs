//! Core types and rules for tally.
//!
//! This crate holds the domain model of the subscription and credit ledger
//! engine. Everything here is pure: no I/O, no clocks (callers pass `now`).
//!
//! - **Identifiers**: `AccountId`, `PaymentIntentId`, `EntryId`, `SubscriptionId`
//! - **Catalog**: `Plan`, `PlanCatalog`, `Feature`, `FeatureCostTable`
//! - **Ledger**: `CreditAccount`, `LedgerEntry`, `post_entries`, `RolloverPolicy`
//! - **Lifecycle**: `Subscription`, `SubscriptionStatus`, `LifecycleEvent`
//! - **Payments**: `PaymentIntent`, `IntentStatus`
//!
//! # Credits
//!
//! Credits are integer minor units stored as `i64`. Plan prices are in minor
//! currency units and convert 1:1 when a plan is bought with credits. There
//! is no floating point anywhere in the crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod error;
pub mod event;
pub mod feature;
pub mod ids;
pub mod ledger;
pub mod payment;
pub mod plan;
pub mod quota;
pub mod subscription;

pub use account::{period_key, CreditAccount, FreezeNote};
pub use error::{BillingError, Result};
pub use event::AuditEvent;
pub use feature::{Feature, FeatureCostTable, QuotaScope, Resource, LIFETIME_PERIOD_KEY};
pub use ids::{AccountId, EntryId, IdError, PaymentIntentId, SubscriptionId};
pub use ledger::{
    grant_reference, post_entries, rollover_reference, Direction, EntryDraft, EntryReason,
    IdempotencyKey, LedgerEntry, Outcome, PostingLimits, RolloverPolicy,
};
pub use payment::{IntentStatus, PaymentIntent};
pub use plan::{
    BillingPeriod, Plan, PlanCatalog, PlanId, PriceTable, FREE_PLAN_CREDITS,
    PREMIUM_PLAN_CREDITS, PREMIUM_PLAN_MONTHLY_PRICE, PREMIUM_PLAN_YEARLY_PRICE,
    PRO_PLAN_CREDITS, PRO_PLAN_MONTHLY_PRICE, PRO_PLAN_YEARLY_PRICE,
};
pub use quota::{quota_period_key, UsageQuotaCounter};
pub use subscription::{
    Funding, LifecycleEvent, Subscription, SubscriptionStatus, GRACE_PERIOD_DAYS, TRIAL_PERIOD_DAYS,
};
