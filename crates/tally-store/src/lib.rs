//! Storage layer for tally.
//!
//! The ledger, projections, subscriptions, payment intents and quota
//! counters all live behind the [`Store`] trait. Reads are plain lookups;
//! every write goes through [`Store::commit`], which applies a [`WriteSet`]
//! atomically and enforces ledger uniqueness at the storage boundary.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: `RwLock`-guarded maps, used by tests and single-node dev.
//! - `RocksStore` (feature `rocksdb-backend`): column families, CBOR values,
//!   one `WriteBatch` per commit.
//!
//! # Example
//!
//! ```
//! use tally_store::{MemoryStore, Store, WriteSet};
//! use tally_core::{AccountId, CreditAccount};
//!
//! let store = MemoryStore::new();
//! let account = CreditAccount::new(AccountId::generate(), chrono::Utc::now());
//! store.commit(WriteSet::for_account(account.clone())).unwrap();
//!
//! let retrieved = store.get_account(&account.account_id).unwrap();
//! assert_eq!(retrieved, Some(account));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use tally_core::{
    AccountId, CreditAccount, EntryId, IdempotencyKey, IntentStatus, LedgerEntry, PaymentIntent,
    PaymentIntentId, Resource, Subscription, SubscriptionId, UsageQuotaCounter,
};

/// A set of writes applied atomically by [`Store::commit`].
///
/// Ledger entries may only be written together with the projection of the
/// account they belong to, so the cached balance can never drift from the
/// entries that justify it.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    /// New projection of the account touched by this write.
    pub account: Option<CreditAccount>,
    /// Ledger entries to append, in sequence order.
    pub entries: Vec<LedgerEntry>,
    /// Subscription records to insert or replace.
    pub subscriptions: Vec<Subscription>,
    /// Payment intents to insert or replace.
    pub intents: Vec<PaymentIntent>,
    /// Quota counters to insert or replace.
    pub quota_counters: Vec<UsageQuotaCounter>,
}

impl WriteSet {
    /// A write set that stores an account projection.
    #[must_use]
    pub fn for_account(account: CreditAccount) -> Self {
        Self {
            account: Some(account),
            ..Self::default()
        }
    }

    /// Append ledger entries.
    #[must_use]
    pub fn with_entries(mut self, entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Insert or replace a subscription.
    #[must_use]
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Insert or replace a payment intent.
    #[must_use]
    pub fn with_intent(mut self, intent: PaymentIntent) -> Self {
        self.intents.push(intent);
        self
    }

    /// Insert or replace a quota counter.
    #[must_use]
    pub fn with_quota(mut self, counter: UsageQuotaCounter) -> Self {
        self.quota_counters.push(counter);
        self
    }

    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.entries.is_empty()
            && self.subscriptions.is_empty()
            && self.intents.is_empty()
            && self.quota_counters.is_empty()
    }

    /// The `next_sequence` the stored projection must have for this write
    /// to apply, or `None` if no projection is written.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWrite` if entries are present without a projection,
    /// belong to another account, or are not contiguous up to the
    /// projection's `next_sequence`.
    pub fn expected_sequence(&self) -> Result<Option<u64>> {
        let Some(account) = &self.account else {
            if self.entries.is_empty() {
                return Ok(None);
            }
            return Err(StoreError::InvalidWrite(
                "ledger entries without an account projection".into(),
            ));
        };

        let count = self.entries.len() as u64;
        let base = account.next_sequence.checked_sub(count).ok_or_else(|| {
            StoreError::InvalidWrite("projection sequence behind its entries".into())
        })?;

        for (offset, entry) in (0u64..).zip(&self.entries) {
            if entry.account_id != account.account_id {
                return Err(StoreError::InvalidWrite(format!(
                    "entry {} belongs to {}, not {}",
                    entry.id, entry.account_id, account.account_id
                )));
            }
            if entry.sequence != base + offset {
                return Err(StoreError::InvalidWrite(format!(
                    "entry {} has sequence {}, expected {}",
                    entry.id,
                    entry.sequence,
                    base + offset
                )));
            }
        }

        Ok(Some(base))
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (`RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Get an account projection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, account_id: &AccountId) -> Result<Option<CreditAccount>>;

    /// All account ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_account_ids(&self) -> Result<Vec<AccountId>>;

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Get a ledger entry by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_entry(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>>;

    /// Find the entry committed under an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_entry(&self, key: &IdempotencyKey) -> Result<Option<LedgerEntry>>;

    /// List entries for an account, newest first, starting strictly below
    /// `before_sequence` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entries(
        &self,
        account_id: &AccountId,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Every entry of an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn entries_for_account(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>>;

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Get a subscription record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>>;

    /// All subscription records of an owner, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn subscriptions_for_owner(&self, owner_id: &AccountId) -> Result<Vec<Subscription>>;

    /// Every subscription that is not canceled.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_live_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// The owner's live subscription, or their most recent record if none
    /// is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn current_subscription(&self, owner_id: &AccountId) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions_for_owner(owner_id)?;
        let live = subscriptions.iter().rev().find(|s| s.is_live()).cloned();
        Ok(live.or_else(|| subscriptions.into_iter().last()))
    }

    // =========================================================================
    // Payment intents
    // =========================================================================

    /// Get a payment intent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_intent(&self, intent_id: &PaymentIntentId) -> Result<Option<PaymentIntent>>;

    /// Find an intent by its provider reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_intent_by_provider_reference(&self, reference: &str) -> Result<Option<PaymentIntent>>;

    /// Every intent currently in `status`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_intents_with_status(&self, status: IntentStatus) -> Result<Vec<PaymentIntent>>;

    // =========================================================================
    // Quotas
    // =========================================================================

    /// Units of `resource` consumed by an account under `period_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn quota_count(&self, account_id: &AccountId, resource: Resource, period_key: &str)
        -> Result<u64>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a write set atomically.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicateEntry` if an entry's idempotency key or id is taken.
    /// - `StoreError::Conflict` if the stored projection moved since the write set was built.
    /// - `StoreError::InvalidWrite` if the write set is malformed.
    fn commit(&self, writes: WriteSet) -> Result<()>;
}

/// Sort subscriptions oldest first.
pub(crate) fn sort_subscriptions(subscriptions: &mut [Subscription]) {
    subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
