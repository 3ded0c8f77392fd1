//! Error types for tally storage.

use tally_core::BillingError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// An entry with the same `(account, reason, reference)` already exists.
    #[error("duplicate ledger entry: {key}")]
    DuplicateEntry {
        /// The conflicting idempotency key.
        key: String,
    },

    /// The write set was built against a stale account projection.
    #[error("write conflict on {account}: stored sequence {stored}, expected {expected}")]
    Conflict {
        /// Account.
        account: String,
        /// Next sequence in storage.
        stored: u64,
        /// Next sequence the write set assumed.
        expected: u64,
    },

    /// The write set is malformed.
    #[error("invalid write set: {0}")]
    InvalidWrite(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEntry { key } => Self::DuplicateOperation { reference_id: key },
            other => Self::Storage(other.to_string()),
        }
    }
}
