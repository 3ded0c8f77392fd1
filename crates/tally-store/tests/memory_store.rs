//! Behaviour of the in-memory store's atomic commit.

use chrono::Utc;
use tally_core::{
    post_entries, AccountId, BillingPeriod, CreditAccount, EntryDraft, EntryReason,
    IdempotencyKey, PlanId, PostingLimits, Resource, Subscription, SubscriptionStatus,
    UsageQuotaCounter,
};
use tally_store::{MemoryStore, Store, StoreError, WriteSet};

const LIMITS: PostingLimits = PostingLimits {
    balance_ceiling: 1_000_000,
};

fn credit(store: &MemoryStore, account: &mut CreditAccount, amount: i64, reference: &str) -> tally_store::Result<()> {
    let entries = post_entries(
        account,
        vec![EntryDraft::credit(EntryReason::PaymentCredit, amount, reference)],
        LIMITS,
        Utc::now(),
    )
    .unwrap();
    store.commit(WriteSet::for_account(account.clone()).with_entries(entries))
}

#[test]
fn entries_and_projection_commit_together() {
    let store = MemoryStore::new();
    let mut account = CreditAccount::new(AccountId::generate(), Utc::now());

    credit(&store, &mut account, 100, "pi-1").unwrap();
    credit(&store, &mut account, 50, "pi-2").unwrap();

    let stored = store.get_account(&account.account_id).unwrap().unwrap();
    let sum: i64 = store
        .entries_for_account(&account.account_id)
        .unwrap()
        .iter()
        .map(|e| e.delta)
        .sum();
    assert_eq!(stored.balance, 150);
    assert_eq!(sum, stored.balance);
}

#[test]
fn replayed_key_changes_nothing() {
    let store = MemoryStore::new();
    let mut account = CreditAccount::new(AccountId::generate(), Utc::now());
    credit(&store, &mut account, 100, "pi-1").unwrap();

    let mut again = store.get_account(&account.account_id).unwrap().unwrap();
    let err = credit(&store, &mut again, 100, "pi-1").unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEntry { .. }));

    assert_eq!(store.get_account(&account.account_id).unwrap().unwrap().balance, 100);
    assert_eq!(store.entries_for_account(&account.account_id).unwrap().len(), 1);

    let key = IdempotencyKey::new(account.account_id, EntryReason::PaymentCredit, "pi-1");
    assert_eq!(store.find_entry(&key).unwrap().unwrap().delta, 100);
}

#[test]
fn stale_projection_is_a_conflict() {
    let store = MemoryStore::new();
    let mut account = CreditAccount::new(AccountId::generate(), Utc::now());
    let mut stale = account.clone();
    credit(&store, &mut account, 10, "a").unwrap();

    let err = credit(&store, &mut stale, 10, "b").unwrap_err();
    assert!(matches!(err, StoreError::Conflict { stored: 1, expected: 0, .. }));
}

#[test]
fn entries_without_projection_are_rejected() {
    let store = MemoryStore::new();
    let mut account = CreditAccount::new(AccountId::generate(), Utc::now());
    let entries = post_entries(
        &mut account,
        vec![EntryDraft::credit(EntryReason::Refund, 5, "x")],
        LIMITS,
        Utc::now(),
    )
    .unwrap();

    let err = store
        .commit(WriteSet::default().with_entries(entries))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidWrite(_)));
}

#[test]
fn pagination_walks_backwards_by_sequence() {
    let store = MemoryStore::new();
    let mut account = CreditAccount::new(AccountId::generate(), Utc::now());
    for i in 0..7 {
        credit(&store, &mut account, 1, &format!("pi-{i}")).unwrap();
    }

    let first = store.list_entries(&account.account_id, None, 3).unwrap();
    assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![6, 5, 4]);

    let cursor = first.last().map(|e| e.sequence);
    let second = store.list_entries(&account.account_id, cursor, 3).unwrap();
    assert_eq!(second.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 2, 1]);
}

#[test]
fn current_subscription_prefers_live_record() {
    let store = MemoryStore::new();
    let owner = AccountId::generate();
    let now = Utc::now();

    let mut old = Subscription::active(owner, PlanId::Free, BillingPeriod::Monthly, now);
    old.transition(tally_core::LifecycleEvent::UserCanceled, now).unwrap();
    let trial = Subscription::trial(owner, PlanId::Pro, BillingPeriod::Monthly, 14, now);

    store
        .commit(WriteSet::default().with_subscription(old).with_subscription(trial.clone()))
        .unwrap();

    let current = store.current_subscription(&owner).unwrap().unwrap();
    assert_eq!(current.id, trial.id);
    assert_eq!(current.status, SubscriptionStatus::Trialing);
    assert_eq!(store.subscriptions_for_owner(&owner).unwrap().len(), 2);
    assert_eq!(store.list_live_subscriptions().unwrap().len(), 1);
}

#[test]
fn quota_counters_are_scoped_by_period() {
    let store = MemoryStore::new();
    let account = AccountId::generate();
    let mut counter = UsageQuotaCounter::new(account, Resource::AgentCalls, "2025-01");
    counter.count = 4;
    store.commit(WriteSet::default().with_quota(counter)).unwrap();

    assert_eq!(store.quota_count(&account, Resource::AgentCalls, "2025-01").unwrap(), 4);
    assert_eq!(store.quota_count(&account, Resource::AgentCalls, "2025-02").unwrap(), 0);
}
