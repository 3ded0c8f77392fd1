//! `RocksDB` storage implementation.
//!
//! Values are CBOR. Every commit is one `WriteBatch`; the uniqueness and
//! sequence checks that precede it run under `commit_lock` so that two
//! commits in this process cannot both pass validation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use tally_core::{
    AccountId, CreditAccount, EntryId, IdempotencyKey, IntentStatus, LedgerEntry, PaymentIntent,
    PaymentIntentId, Resource, Subscription, SubscriptionId, UsageQuotaCounter,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{sort_subscriptions, Store, WriteSet};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn exists(&self, cf_name: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        Ok(self
            .db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }

    /// All `(key, value)` pairs under a prefix, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn scan_all<T: serde::de::DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    fn entry_from_index(&self, value: &[u8]) -> Result<Option<LedgerEntry>> {
        let entry_id = keys::decode_entry_id(value)
            .ok_or_else(|| StoreError::Serialization("malformed entry index value".into()))?;
        self.get_entry(&entry_id)
    }
}

impl Store for RocksStore {
    fn get_account(&self, account_id: &AccountId) -> Result<Option<CreditAccount>> {
        self.get(cf::ACCOUNTS, &keys::account_key(account_id))
    }

    fn list_account_ids(&self) -> Result<Vec<AccountId>> {
        let accounts: Vec<CreditAccount> = self.scan_all(cf::ACCOUNTS)?;
        Ok(accounts.into_iter().map(|a| a.account_id).collect())
    }

    fn get_entry(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        self.get(cf::ENTRIES, &keys::entry_key(entry_id))
    }

    fn find_entry(&self, key: &IdempotencyKey) -> Result<Option<LedgerEntry>> {
        let cf = self.cf(cf::ENTRY_KEYS)?;
        match self
            .db
            .get_cf(&cf, keys::idempotency_key(key))
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            Some(value) => self.entry_from_index(&value),
            None => Ok(None),
        }
    }

    fn list_entries(
        &self,
        account_id: &AccountId,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let cf = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let prefix = keys::account_entries_prefix(account_id);
        let start = keys::account_entry_key(account_id, before_sequence.unwrap_or(u64::MAX));

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Reverse));
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if before_sequence.is_some() && key.as_ref() == start.as_slice() {
                continue;
            }
            if let Some(entry) = self.entry_from_index(&value)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn entries_for_account(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let prefix = keys::account_entries_prefix(account_id);
        let mut entries = Vec::new();
        for (_, value) in self.scan_prefix(cf::ENTRIES_BY_ACCOUNT, &prefix)? {
            if let Some(entry) = self.entry_from_index(&value)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn get_subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        self.get(cf::SUBSCRIPTIONS, &keys::subscription_key(subscription_id))
    }

    fn subscriptions_for_owner(&self, owner_id: &AccountId) -> Result<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for (key, _) in self.scan_prefix(cf::SUBSCRIPTIONS_BY_OWNER, owner_id.as_bytes())? {
            let id = keys::extract_subscription_id(&key)
                .ok_or_else(|| StoreError::Serialization("malformed owner index key".into()))?;
            if let Some(subscription) = self.get_subscription(&id)? {
                subscriptions.push(subscription);
            }
        }
        sort_subscriptions(&mut subscriptions);
        Ok(subscriptions)
    }

    fn list_live_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut live: Vec<Subscription> = self
            .scan_all::<Subscription>(cf::SUBSCRIPTIONS)?
            .into_iter()
            .filter(Subscription::is_live)
            .collect();
        sort_subscriptions(&mut live);
        Ok(live)
    }

    fn get_intent(&self, intent_id: &PaymentIntentId) -> Result<Option<PaymentIntent>> {
        self.get(cf::INTENTS, &keys::intent_key(intent_id))
    }

    fn find_intent_by_provider_reference(&self, reference: &str) -> Result<Option<PaymentIntent>> {
        let cf = self.cf(cf::INTENTS_BY_PROVIDER_REF)?;
        let Some(value) = self
            .db
            .get_cf(&cf, keys::provider_reference_key(reference))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };
        let intent_id = keys::decode_intent_id(&value)
            .ok_or_else(|| StoreError::Serialization("malformed intent index value".into()))?;
        self.get_intent(&intent_id)
    }

    fn list_intents_with_status(&self, status: IntentStatus) -> Result<Vec<PaymentIntent>> {
        let mut intents: Vec<PaymentIntent> = self
            .scan_all::<PaymentIntent>(cf::INTENTS)?
            .into_iter()
            .filter(|i| i.status == status)
            .collect();
        intents.sort_by_key(|i| i.created_at);
        Ok(intents)
    }

    fn quota_count(
        &self,
        account_id: &AccountId,
        resource: Resource,
        period_key: &str,
    ) -> Result<u64> {
        let counter: Option<UsageQuotaCounter> = self.get(
            cf::QUOTA_COUNTERS,
            &keys::quota_key(account_id, resource, period_key),
        )?;
        Ok(counter.map_or(0, |c| c.count))
    }

    fn commit(&self, writes: WriteSet) -> Result<()> {
        let expected = writes.expected_sequence()?;
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Database("commit lock poisoned".into()))?;

        if let (Some(account), Some(expected)) = (&writes.account, expected) {
            let stored = self
                .get_account(&account.account_id)?
                .map_or(0, |a| a.next_sequence);
            if stored != expected {
                return Err(StoreError::Conflict {
                    account: account.account_id.to_string(),
                    stored,
                    expected,
                });
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for entry in &writes.entries {
            let key = keys::idempotency_key(&entry.key());
            if self.exists(cf::ENTRY_KEYS, &key)?
                || self.exists(cf::ENTRIES, &keys::entry_key(&entry.id))?
                || !seen.insert(key)
            {
                return Err(StoreError::DuplicateEntry {
                    key: entry.key().to_string(),
                });
            }
        }

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_account = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let cf_entry_keys = self.cf(cf::ENTRY_KEYS)?;
        let cf_subscriptions = self.cf(cf::SUBSCRIPTIONS)?;
        let cf_by_owner = self.cf(cf::SUBSCRIPTIONS_BY_OWNER)?;
        let cf_intents = self.cf(cf::INTENTS)?;
        let cf_by_ref = self.cf(cf::INTENTS_BY_PROVIDER_REF)?;
        let cf_quota = self.cf(cf::QUOTA_COUNTERS)?;

        let mut batch = WriteBatch::default();

        if let Some(account) = &writes.account {
            batch.put_cf(
                &cf_accounts,
                keys::account_key(&account.account_id),
                Self::serialize(account)?,
            );
        }

        for entry in &writes.entries {
            let id = entry.id.to_bytes();
            batch.put_cf(&cf_entries, keys::entry_key(&entry.id), Self::serialize(entry)?);
            batch.put_cf(
                &cf_by_account,
                keys::account_entry_key(&entry.account_id, entry.sequence),
                id,
            );
            batch.put_cf(&cf_entry_keys, keys::idempotency_key(&entry.key()), id);
        }

        for subscription in &writes.subscriptions {
            batch.put_cf(
                &cf_subscriptions,
                keys::subscription_key(&subscription.id),
                Self::serialize(subscription)?,
            );
            batch.put_cf(
                &cf_by_owner,
                keys::owner_subscription_key(&subscription.owner_id, &subscription.id),
                [],
            );
        }

        for intent in &writes.intents {
            batch.put_cf(&cf_intents, keys::intent_key(&intent.id), Self::serialize(intent)?);
            if let Some(reference) = &intent.provider_reference {
                batch.put_cf(
                    &cf_by_ref,
                    keys::provider_reference_key(reference),
                    intent.id.as_bytes(),
                );
            }
        }

        for counter in &writes.quota_counters {
            batch.put_cf(
                &cf_quota,
                keys::quota_key(&counter.account_id, counter.resource, &counter.period_key),
                Self::serialize(counter)?,
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::trace!(
            entries = writes.entries.len(),
            subscriptions = writes.subscriptions.len(),
            intents = writes.intents.len(),
            "rocks commit applied"
        );

        Ok(())
    }
}
