//! Projection reconciliation.
//!
//! The cached balance is recomputed from the ledger and compared. A
//! mismatch freezes the account and pages an operator; nothing is ever
//! corrected automatically.

use serde::Serialize;
use tally_core::{
    AccountId, AuditEvent, BillingError, CreditAccount, FreezeNote, LedgerEntry, Result,
};
use tally_store::WriteSet;

use super::Engine;

/// Result of verifying one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Account.
    pub account_id: AccountId,
    /// Cached balance.
    pub cached: i64,
    /// Sum of ledger deltas.
    pub ledger: i64,
    /// Number of entries walked.
    pub entries: usize,
    /// Whether projection and ledger agree.
    pub consistent: bool,
    /// Whether writes are frozen.
    pub frozen: bool,
}

/// Totals from [`Engine::verify_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegritySummary {
    /// Accounts found consistent.
    pub checked: usize,
    /// Accounts found inconsistent and frozen.
    pub violations: usize,
    /// Accounts that could not be checked.
    pub errors: usize,
}

impl Engine {
    /// Recompute an account's balance from its ledger.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` after freezing the account if the
    /// projection disagrees with the ledger.
    pub fn verify_account(&self, account_id: AccountId) -> Result<IntegrityReport> {
        self.locks.with_account(account_id, || {
            let mut account = self.load_account(account_id)?;
            let report = self.inspect(&account)?;
            if report.consistent {
                return Ok(report);
            }

            let violation = BillingError::IntegrityViolation {
                account_id,
                cached: report.cached,
                ledger: report.ledger,
            };

            if account.frozen.is_none() {
                let now = self.now();
                account.frozen = Some(FreezeNote {
                    cached: report.cached,
                    ledger: report.ledger,
                    detected_at: now,
                });
                self.commit(
                    WriteSet::for_account(account),
                    vec![AuditEvent::IntegrityViolation {
                        account_id,
                        cached: report.cached,
                        ledger: report.ledger,
                        at: now,
                    }],
                )?;
            }

            tracing::error!(
                account_id = %account_id,
                cached = report.cached,
                ledger = report.ledger,
                entries = report.entries,
                "Ledger integrity violation, account frozen"
            );
            Err(violation)
        })
    }

    /// Verify every account.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the accounts cannot be listed.
    pub fn verify_all(&self) -> Result<IntegritySummary> {
        let mut summary = IntegritySummary::default();

        for account_id in self.store.list_account_ids()? {
            match self.verify_account(account_id) {
                Ok(_) => summary.checked += 1,
                Err(BillingError::IntegrityViolation { .. }) => summary.violations += 1,
                Err(e) => {
                    summary.errors += 1;
                    tracing::warn!(account_id = %account_id, error = %e, "Integrity check failed");
                }
            }
        }

        tracing::info!(
            checked = summary.checked,
            violations = summary.violations,
            errors = summary.errors,
            "Integrity verification finished"
        );
        Ok(summary)
    }

    /// Lift a freeze once ledger and projection agree again.
    ///
    /// # Errors
    ///
    /// Returns `IntegrityViolation` if they still disagree.
    pub fn unfreeze(&self, account_id: AccountId, admin_id: &str) -> Result<CreditAccount> {
        self.locks.with_account(account_id, || {
            let mut account = self.load_account(account_id)?;
            let report = self.inspect(&account)?;
            if !report.consistent {
                return Err(BillingError::IntegrityViolation {
                    account_id,
                    cached: report.cached,
                    ledger: report.ledger,
                });
            }

            if account.frozen.take().is_some() {
                account.updated_at = self.now();
                self.commit(WriteSet::for_account(account.clone()), Vec::new())?;
                tracing::warn!(account_id = %account_id, admin_id = %admin_id, "Account unfrozen");
            }
            Ok(account)
        })
    }

    /// Overwrite the projection with values derived from the ledger and
    /// lift any freeze.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` or a storage error.
    pub fn rebuild_projection(&self, account_id: AccountId, admin_id: &str) -> Result<CreditAccount> {
        self.locks.with_account(account_id, || {
            let mut account = self.load_account(account_id)?;
            let entries = self.store.entries_for_account(&account_id)?;
            let previous = account.balance;
            let now = self.now();

            account.balance = ledger_sum(&entries);
            account.lifetime_credited = entries.iter().map(|e| e.delta.max(0)).sum();
            account.lifetime_debited = entries.iter().map(|e| (-e.delta).max(0)).sum();
            account.frozen = None;
            account.updated_at = now;
            self.commit(
                WriteSet::for_account(account.clone()),
                vec![AuditEvent::ProjectionRebuilt {
                    account_id,
                    previous,
                    balance: account.balance,
                    admin_id: admin_id.to_string(),
                    at: now,
                }],
            )?;

            tracing::warn!(
                account_id = %account_id,
                admin_id = %admin_id,
                previous,
                balance = account.balance,
                "Projection rebuilt from ledger"
            );
            Ok(account)
        })
    }

    fn inspect(&self, account: &CreditAccount) -> Result<IntegrityReport> {
        let entries = self.store.entries_for_account(&account.account_id)?;
        let ledger = ledger_sum(&entries);
        let chain_intact = chain_is_intact(&entries);
        let sequence_matches = account.next_sequence == entries.len() as u64;

        Ok(IntegrityReport {
            account_id: account.account_id,
            cached: account.balance,
            ledger,
            entries: entries.len(),
            consistent: chain_intact && sequence_matches && ledger == account.balance,
            frozen: account.is_frozen(),
        })
    }
}

fn ledger_sum(entries: &[LedgerEntry]) -> i64 {
    entries.iter().fold(0i64, |acc, e| acc.saturating_add(e.delta))
}

/// Sequences are gap-free from zero and every snapshot follows from the
/// previous one.
fn chain_is_intact(entries: &[LedgerEntry]) -> bool {
    let mut running = 0i64;
    for (expected, entry) in (0u64..).zip(entries) {
        if entry.sequence != expected {
            return false;
        }
        running = running.saturating_add(entry.delta);
        if entry.resulting_balance != running || running < 0 {
            return false;
        }
    }
    true
}
