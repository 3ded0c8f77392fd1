//! Tally ledger engine and HTTP API service.
//!
//! This crate provides:
//!
//! - The ledger [`Engine`]: credits and debits, entitlements, usage
//!   metering, subscription lifecycle, payment reconciliation and
//!   integrity verification
//! - A Stripe-style [`PaymentProvider`] adapter and checkout orchestration
//! - Audit sinks
//! - Background jobs (renewal sweep, integrity checks, intent polling)
//! - The axum HTTP API
//!
//! # Authentication
//!
//! 1. **JWT bearer tokens** - For end-user requests
//! 2. **Service API keys** - For the chat, agent and task subsystems
//! 3. **Admin API keys** - For operator endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for axum

pub mod audit;
pub mod auth;
pub mod checkout;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod provider;
pub mod routes;
pub mod state;

pub use audit::{AuditSink, FanoutSink, MemorySink, TracingSink, WebhookSink};
pub use checkout::{start_checkout, CheckoutOutcome, CheckoutPolicy};
pub use config::ServiceConfig;
pub use engine::{Engine, EngineSettings};
pub use error::ApiError;
pub use provider::{PaymentProvider, ProviderError, ProviderEvent, StripeProvider};
pub use routes::create_router;
pub use state::AppState;
