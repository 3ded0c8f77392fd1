//! Key encoding utilities for `RocksDB`.
//!
//! Composite keys put the account (or owner) id first so that one account's
//! rows are contiguous and can be walked with a prefix iterator. Sequence
//! numbers are big-endian so byte order equals numeric order.

use tally_core::{
    AccountId, EntryId, IdempotencyKey, PaymentIntentId, Resource, SubscriptionId,
};

/// Create an account key.
#[must_use]
pub fn account_key(account_id: &AccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Create an entry key from an entry id.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Create an account-entry index key.
///
/// Format: `account_id (16 bytes) || sequence (8 bytes, big-endian)`
#[must_use]
pub fn account_entry_key(account_id: &AccountId, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Prefix for iterating all entries of an account.
#[must_use]
pub fn account_entries_prefix(account_id: &AccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Extract the sequence number from an account-entry index key.
#[must_use]
pub fn extract_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(16..24)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Create an idempotency index key.
///
/// Format: `account_id (16 bytes) || reason || 0x00 || reference_id`
#[must_use]
pub fn idempotency_key(key: &IdempotencyKey) -> Vec<u8> {
    let reason = key.reason.as_str().as_bytes();
    let reference = key.reference_id.as_bytes();
    let mut out = Vec::with_capacity(16 + reason.len() + 1 + reference.len());
    out.extend_from_slice(key.account_id.as_bytes());
    out.extend_from_slice(reason);
    out.push(0);
    out.extend_from_slice(reference);
    out
}

/// Decode an entry id stored as an index value.
#[must_use]
pub fn decode_entry_id(value: &[u8]) -> Option<EntryId> {
    let bytes: [u8; 16] = value.try_into().ok()?;
    Some(EntryId::from_bytes(bytes))
}

/// Create a subscription key.
#[must_use]
pub fn subscription_key(subscription_id: &SubscriptionId) -> Vec<u8> {
    subscription_id.to_bytes().to_vec()
}

/// Create an owner-subscription index key.
///
/// Format: `owner_id (16 bytes) || subscription_id (16 bytes)`
#[must_use]
pub fn owner_subscription_key(owner_id: &AccountId, subscription_id: &SubscriptionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(owner_id.as_bytes());
    key.extend_from_slice(&subscription_id.to_bytes());
    key
}

/// Extract the subscription id from an owner-subscription index key.
#[must_use]
pub fn extract_subscription_id(key: &[u8]) -> Option<SubscriptionId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(SubscriptionId::from_bytes(bytes))
}

/// Create a payment intent key.
#[must_use]
pub fn intent_key(intent_id: &PaymentIntentId) -> Vec<u8> {
    intent_id.as_bytes().to_vec()
}

/// Decode an intent id stored as an index value.
#[must_use]
pub fn decode_intent_id(value: &[u8]) -> Option<PaymentIntentId> {
    let bytes: [u8; 16] = value.try_into().ok()?;
    Some(PaymentIntentId::from_bytes(bytes))
}

/// Create a provider reference index key.
#[must_use]
pub fn provider_reference_key(reference: &str) -> Vec<u8> {
    reference.as_bytes().to_vec()
}

/// Create a quota counter key.
///
/// Format: `account_id (16 bytes) || resource || 0x00 || period_key`
#[must_use]
pub fn quota_key(account_id: &AccountId, resource: Resource, period_key: &str) -> Vec<u8> {
    let resource = resource.as_str().as_bytes();
    let mut key = Vec::with_capacity(16 + resource.len() + 1 + period_key.len());
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(resource);
    key.push(0);
    key.extend_from_slice(period_key.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::EntryReason;

    #[test]
    fn account_entry_keys_sort_by_sequence() {
        let account = AccountId::generate();
        let a = account_entry_key(&account, 9);
        let b = account_entry_key(&account, 10);
        let c = account_entry_key(&account, 256);
        assert!(a < b && b < c);
        assert_eq!(extract_sequence(&c), Some(256));
    }

    #[test]
    fn idempotency_keys_separate_reason_and_reference() {
        let account = AccountId::generate();
        let a = idempotency_key(&IdempotencyKey::new(account, EntryReason::Refund, "x"));
        let b = idempotency_key(&IdempotencyKey::new(account, EntryReason::FeatureDebit, "x"));
        assert_ne!(a, b);
        assert_eq!(&a[..16], account.as_bytes());
    }

    #[test]
    fn owner_subscription_key_roundtrip() {
        let owner = AccountId::generate();
        let sub = SubscriptionId::generate();
        let key = owner_subscription_key(&owner, &sub);
        assert_eq!(key.len(), 32);
        assert_eq!(extract_subscription_id(&key), Some(sub));
    }

    #[test]
    fn short_keys_do_not_panic() {
        assert_eq!(extract_sequence(&[1, 2, 3]), None);
        assert_eq!(decode_entry_id(&[0; 4]), None);
    }
}
