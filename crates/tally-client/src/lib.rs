//! Tally client SDK.
//!
//! Used by the chat, agent and task subsystems to meter feature use
//! against the tally service.
//!
//! # Example
//!
//! ```no_run
//! use tally_client::{ClientError, ClientOptions, TallyClient};
//! use tally_core::{AccountId, Feature};
//!
//! # async fn example(account_id: AccountId) -> Result<(), ClientError> {
//! let client = TallyClient::with_options(
//!     "http://tally.billing.svc:8080",
//!     "your-service-api-key",
//!     ClientOptions::with_service_name("agent-runtime"),
//! )?;
//!
//! let debit = client
//!     .authorize(account_id, Feature::AgentCall, 1, "run-42")
//!     .await?;
//!
//! if run_agent().await.is_err() {
//!     client.compensate(&debit.entry_id).await?;
//! }
//! # Ok(())
//! # }
//! # async fn run_agent() -> Result<(), ()> { Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, TallyClient};
pub use error::{ClientError, MeteredError};
pub use types::*;
