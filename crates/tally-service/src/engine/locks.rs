//! Per-account critical sections.
//!
//! Every write to one account runs while holding that account's mutex, so
//! writes to one ledger are strictly serialized while distinct accounts
//! proceed in parallel. The store's sequence check backs this up across
//! processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tally_core::AccountId;

/// A lazily populated map of per-account mutexes.
#[derive(Debug, Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    /// Empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the account's lock.
    pub fn with_account<T>(&self, account_id: AccountId, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(account_id).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Drop the entry once nobody else holds or waits on it.
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            map.remove(&account_id);
        }

        result
    }

    /// Number of accounts with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no account currently holds a lock entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_account_is_serialized() {
        let locks = AccountLocks::new();
        let account = AccountId::generate();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    locks.with_account(account, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
