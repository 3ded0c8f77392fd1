//! Column families used by the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit account projections, keyed by `account_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Ledger entries, keyed by `entry_id` (ULID).
    pub const ENTRIES: &str = "entries";

    /// Index: entries by account, keyed by `account_id || sequence (BE u64)`.
    /// Value is the entry id.
    pub const ENTRIES_BY_ACCOUNT: &str = "entries_by_account";

    /// Index: idempotency keys, keyed by `account_id || reason || 0x00 || reference`.
    /// Value is the entry id.
    pub const ENTRY_KEYS: &str = "entry_keys";

    /// Subscription records, keyed by `subscription_id` (ULID).
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Index: subscriptions by owner, keyed by `owner_id || subscription_id`.
    /// Value is empty (index only).
    pub const SUBSCRIPTIONS_BY_OWNER: &str = "subscriptions_by_owner";

    /// Payment intents, keyed by `intent_id`.
    pub const INTENTS: &str = "intents";

    /// Index: intents by provider reference. Value is the intent id.
    pub const INTENTS_BY_PROVIDER_REF: &str = "intents_by_provider_ref";

    /// Quota counters, keyed by `account_id || resource || 0x00 || period_key`.
    pub const QUOTA_COUNTERS: &str = "quota_counters";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::ENTRIES,
        cf::ENTRIES_BY_ACCOUNT,
        cf::ENTRY_KEYS,
        cf::SUBSCRIPTIONS,
        cf::SUBSCRIPTIONS_BY_OWNER,
        cf::INTENTS,
        cf::INTENTS_BY_PROVIDER_REF,
        cf::QUOTA_COUNTERS,
    ]
}
