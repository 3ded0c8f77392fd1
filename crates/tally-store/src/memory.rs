//! In-memory storage implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tally_core::{
    AccountId, CreditAccount, EntryId, IdempotencyKey, IntentStatus, LedgerEntry, PaymentIntent,
    PaymentIntentId, Resource, Subscription, SubscriptionId, UsageQuotaCounter,
};

use crate::error::{Result, StoreError};
use crate::{sort_subscriptions, Store, WriteSet};

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, CreditAccount>,
    entries: HashMap<EntryId, LedgerEntry>,
    entries_by_account: BTreeMap<(AccountId, u64), EntryId>,
    entry_keys: HashMap<IdempotencyKey, EntryId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    subscriptions_by_owner: BTreeSet<(AccountId, SubscriptionId)>,
    intents: HashMap<PaymentIntentId, PaymentIntent>,
    intents_by_provider_ref: HashMap<String, PaymentIntentId>,
    quota_counters: HashMap<(AccountId, Resource, String), UsageQuotaCounter>,
}

/// `RwLock`-guarded in-memory storage.
///
/// Commits take the write lock for their whole duration, so a commit is
/// atomic with respect to every reader.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl Store for MemoryStore {
    fn get_account(&self, account_id: &AccountId) -> Result<Option<CreditAccount>> {
        Ok(self.read()?.accounts.get(account_id).cloned())
    }

    fn list_account_ids(&self) -> Result<Vec<AccountId>> {
        let mut ids: Vec<_> = self.read()?.accounts.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn get_entry(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        Ok(self.read()?.entries.get(entry_id).cloned())
    }

    fn find_entry(&self, key: &IdempotencyKey) -> Result<Option<LedgerEntry>> {
        let tables = self.read()?;
        Ok(tables
            .entry_keys
            .get(key)
            .and_then(|id| tables.entries.get(id))
            .cloned())
    }

    fn list_entries(
        &self,
        account_id: &AccountId,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let tables = self.read()?;
        let upper = before_sequence.unwrap_or(u64::MAX);
        Ok(tables
            .entries_by_account
            .range((*account_id, 0)..(*account_id, upper))
            .rev()
            .take(limit)
            .filter_map(|(_, id)| tables.entries.get(id).cloned())
            .collect())
    }

    fn entries_for_account(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let tables = self.read()?;
        Ok(tables
            .entries_by_account
            .range((*account_id, 0)..=(*account_id, u64::MAX))
            .filter_map(|(_, id)| tables.entries.get(id).cloned())
            .collect())
    }

    fn get_subscription(&self, subscription_id: &SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.read()?.subscriptions.get(subscription_id).cloned())
    }

    fn subscriptions_for_owner(&self, owner_id: &AccountId) -> Result<Vec<Subscription>> {
        let tables = self.read()?;
        let mut subscriptions: Vec<_> = tables
            .subscriptions_by_owner
            .iter()
            .filter(|(owner, _)| owner == owner_id)
            .filter_map(|(_, id)| tables.subscriptions.get(id).cloned())
            .collect();
        sort_subscriptions(&mut subscriptions);
        Ok(subscriptions)
    }

    fn list_live_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut live: Vec<_> = self
            .read()?
            .subscriptions
            .values()
            .filter(|s| s.is_live())
            .cloned()
            .collect();
        sort_subscriptions(&mut live);
        Ok(live)
    }

    fn get_intent(&self, intent_id: &PaymentIntentId) -> Result<Option<PaymentIntent>> {
        Ok(self.read()?.intents.get(intent_id).cloned())
    }

    fn find_intent_by_provider_reference(&self, reference: &str) -> Result<Option<PaymentIntent>> {
        let tables = self.read()?;
        Ok(tables
            .intents_by_provider_ref
            .get(reference)
            .and_then(|id| tables.intents.get(id))
            .cloned())
    }

    fn list_intents_with_status(&self, status: IntentStatus) -> Result<Vec<PaymentIntent>> {
        let mut intents: Vec<_> = self
            .read()?
            .intents
            .values()
            .filter(|i| i.status == status)
            .cloned()
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
        Ok(self
            .read()?
            .quota_counters
            .get(&(*account_id, resource, period_key.to_string()))
            .map_or(0, |c| c.count))
    }

    fn commit(&self, writes: WriteSet) -> Result<()> {
        let expected = writes.expected_sequence()?;
        let mut tables = self.write()?;

        // Validate everything before touching any table.
        if let (Some(account), Some(expected)) = (&writes.account, expected) {
            let stored = tables
                .accounts
                .get(&account.account_id)
                .map_or(0, |a| a.next_sequence);
            if stored != expected {
                return Err(StoreError::Conflict {
                    account: account.account_id.to_string(),
                    stored,
                    expected,
                });
            }
        }

        let mut batch_keys = BTreeSet::new();
        for entry in &writes.entries {
            let key = entry.key();
            let rendered = key.to_string();
            if tables.entry_keys.contains_key(&key)
                || tables.entries.contains_key(&entry.id)
                || !batch_keys.insert(rendered.clone())
            {
                return Err(StoreError::DuplicateEntry { key: rendered });
            }
        }

        if let Some(account) = writes.account {
            tables.accounts.insert(account.account_id, account);
        }

        for entry in writes.entries {
            tables.entry_keys.insert(entry.key(), entry.id);
            tables
                .entries_by_account
                .insert((entry.account_id, entry.sequence), entry.id);
            tables.entries.insert(entry.id, entry);
        }

        for subscription in writes.subscriptions {
            tables
                .subscriptions_by_owner
                .insert((subscription.owner_id, subscription.id));
            tables.subscriptions.insert(subscription.id, subscription);
        }

        for intent in writes.intents {
            if let Some(reference) = &intent.provider_reference {
                tables
                    .intents_by_provider_ref
                    .insert(reference.clone(), intent.id);
            }
            tables.intents.insert(intent.id, intent);
        }

        for counter in writes.quota_counters {
            tables.quota_counters.insert(
                (counter.account_id, counter.resource, counter.period_key.clone()),
                counter,
            );
        }

        Ok(())
    }
}
