//! API handlers.

pub mod accounts;
pub mod admin;
pub mod checkout;
pub mod credits;
pub mod entitlements;
pub mod health;
pub mod plans;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;
