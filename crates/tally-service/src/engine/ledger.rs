//! Credit ledger operations.

use serde_json::json;
use tally_core::{
    grant_reference, period_key, post_entries, rollover_reference, AccountId, BillingError,
    CreditAccount, Direction, EntryDraft, EntryReason, IdempotencyKey, LedgerEntry, Outcome, Plan,
    PlanId, Result,
};
use tally_store::WriteSet;

use super::Engine;

impl Engine {
    /// The cached projection of an account.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` or a storage error.
    pub fn account(&self, account_id: AccountId) -> Result<CreditAccount> {
        self.load_account(account_id)
    }

    /// Current balance. Served from the projection; frozen accounts stay
    /// readable.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` or a storage error.
    pub fn balance(&self, account_id: AccountId) -> Result<i64> {
        Ok(self.load_account(account_id)?.balance)
    }

    /// Ledger entries newest first, strictly below `before_sequence`.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` or a storage error.
    pub fn transactions(
        &self,
        account_id: AccountId,
        before_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        self.load_account(account_id)?;
        Ok(self.store.list_entries(&account_id, before_sequence, limit)?)
    }

    /// Add credits.
    ///
    /// A replay of `(account, reason, reference_id)` returns the original
    /// entry as [`Outcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` if `amount <= 0` or `reason` only debits.
    /// - `PlanLimitExceeded` if the balance ceiling would be crossed.
    /// - `IntegrityViolation` if the account is frozen.
    pub fn credit(
        &self,
        account_id: AccountId,
        amount: i64,
        reason: EntryReason,
        reference_id: &str,
    ) -> Result<Outcome<LedgerEntry>> {
        if amount <= 0 || reason.direction() == Direction::Debit {
            return Err(BillingError::InvalidAmount(format!(
                "cannot credit {amount} as {reason}"
            )));
        }
        self.post_single(account_id, EntryDraft::credit(reason, amount, reference_id))
    }

    /// Remove credits. Check and write happen under the account lock.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount` if `amount <= 0` or `reason` only credits.
    /// - `InsufficientCredits` if the balance is short; nothing is written.
    /// - `IntegrityViolation` if the account is frozen.
    pub fn debit(
        &self,
        account_id: AccountId,
        amount: i64,
        reason: EntryReason,
        reference_id: &str,
    ) -> Result<Outcome<LedgerEntry>> {
        if amount <= 0 || reason.direction() == Direction::Credit {
            return Err(BillingError::InvalidAmount(format!(
                "cannot debit {amount} as {reason}"
            )));
        }
        self.post_single(account_id, EntryDraft::debit(reason, amount, reference_id))
    }

    /// Operator adjustment with a signed delta.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::credit`] and [`Engine::debit`].
    pub fn adjust(
        &self,
        account_id: AccountId,
        delta: i64,
        reference_id: &str,
        admin_id: &str,
        note: Option<&str>,
    ) -> Result<Outcome<LedgerEntry>> {
        let draft = EntryDraft {
            reason: EntryReason::ManualAdjustment,
            delta,
            reference_id: reference_id.to_string(),
            metadata: json!({ "admin_id": admin_id, "note": note }),
        };
        self.post_single(account_id, draft)
    }

    /// Issue the monthly grant for the current credit period.
    ///
    /// Clip-then-grant: excess above the rollover cap expires first, then
    /// the plan's allowance is added. Both entries are committed together.
    /// Calling it again in the same period returns the period's entries as
    /// a duplicate.
    ///
    /// # Errors
    ///
    /// Returns `PlanNotFound`, `AccountNotFound`, `PlanLimitExceeded`,
    /// `IntegrityViolation` or a storage error.
    pub fn monthly_grant(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
    ) -> Result<Outcome<Vec<LedgerEntry>>> {
        let plan = self.catalog.get(plan_id)?.clone();

        self.locks.with_account(account_id, || {
            let mut account = self.load_account(account_id)?;
            let period = period_key(self.now());

            if account.replenished_for(&period) {
                return Ok(Outcome::Duplicate(self.period_entries(account_id, &period)?));
            }

            let entries = self.apply_period_grant(&mut account, &plan, &period)?;
            self.commit(
                WriteSet::for_account(account).with_entries(entries.clone()),
                Vec::new(),
            )?;

            tracing::info!(
                account_id = %account_id,
                plan = %plan.id,
                period = %period,
                entries = entries.len(),
                "Monthly grant issued"
            );
            Ok(Outcome::Applied(entries))
        })
    }

    /// Post the rollover expiry and grant for `period` onto `account` in
    /// memory and mark the period as replenished.
    pub(super) fn apply_period_grant(
        &self,
        account: &mut CreditAccount,
        plan: &Plan,
        period: &str,
    ) -> Result<Vec<LedgerEntry>> {
        let policy = self.rollover();
        let drafts = policy
            .period_drafts(account.balance, plan.monthly_credit_allowance, period)
            .into_iter()
            .map(|mut draft| {
                if let Some(metadata) = draft.metadata.as_object_mut() {
                    metadata.insert("plan".into(), json!(plan.id));
                }
                draft
            })
            .collect();

        let entries = post_entries(account, drafts, self.limits(), self.now())?;
        account.last_replenished_period = Some(period.to_string());
        account.rollover_cap = policy.cap(plan.monthly_credit_allowance);
        Ok(entries)
    }

    fn period_entries(&self, account_id: AccountId, period: &str) -> Result<Vec<LedgerEntry>> {
        let keys = [
            IdempotencyKey::new(account_id, EntryReason::RolloverExpiry, rollover_reference(period)),
            IdempotencyKey::new(account_id, EntryReason::MonthlyGrant, grant_reference(period)),
        ];
        let mut entries = Vec::new();
        for key in &keys {
            if let Some(entry) = self.store.find_entry(key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn post_single(&self, account_id: AccountId, draft: EntryDraft) -> Result<Outcome<LedgerEntry>> {
        if draft.reference_id.is_empty() {
            return Err(BillingError::InvalidPayload(
                "reference_id must not be empty".into(),
            ));
        }
        let key = IdempotencyKey::new(account_id, draft.reason, draft.reference_id.clone());

        self.locks.with_account(account_id, || {
            if let Some(existing) = self.store.find_entry(&key)? {
                tracing::debug!(key = %key, "Duplicate ledger operation");
                return Ok(Outcome::Duplicate(existing));
            }

            let mut account = self.load_account(account_id)?;
            let entries = post_entries(&mut account, vec![draft], self.limits(), self.now())?;
            self.commit(
                WriteSet::for_account(account).with_entries(entries.clone()),
                Vec::new(),
            )?;

            let entry = entries
                .into_iter()
                .next()
                .ok_or_else(|| BillingError::Storage("posting produced no entry".into()))?;

            tracing::info!(
                account_id = %account_id,
                reason = %entry.reason,
                delta = entry.delta,
                balance = entry.resulting_balance,
                reference_id = %entry.reference_id,
                "Ledger entry applied"
            );
            Ok(Outcome::Applied(entry))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::super::EngineSettings;
    use super::*;
    use chrono::Duration;
    use tally_core::{FREE_PLAN_CREDITS, PRO_PLAN_CREDITS};
    use tally_store::Store;

    fn funded(balance: i64) -> (super::super::testing::Fixture, AccountId) {
        let fx = fixture();
        let account_id = AccountId::generate();
        fx.engine.open_account(account_id).unwrap();
        let top_up = balance - FREE_PLAN_CREDITS;
        if top_up > 0 {
            fx.engine
                .adjust(account_id, top_up, "seed", "ops", None)
                .unwrap();
        }
        (fx, account_id)
    }

    #[test]
    fn credit_replay_returns_original_entry() {
        let (fx, account) = funded(50);

        let first = fx
            .engine
            .credit(account, 100, EntryReason::ManualAdjustment, "bonus-1")
            .unwrap();
        let second = fx
            .engine
            .credit(account, 100, EntryReason::ManualAdjustment, "bonus-1")
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.value().id, second.value().id);
        assert_eq!(fx.engine.balance(account).unwrap(), 150);
    }

    #[test]
    fn debit_never_goes_negative() {
        let (fx, account) = funded(50);

        let err = fx
            .engine
            .debit(account, 51, EntryReason::FeatureDebit, "big")
            .unwrap_err();

        assert_eq!(
            err,
            BillingError::InsufficientCredits {
                balance: 50,
                required: 51
            }
        );
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
        assert_eq!(fx.store.entries_for_account(&account).unwrap().len(), 1);
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let (fx, account) = funded(50);

        assert!(matches!(
            fx.engine.credit(account, 5, EntryReason::FeatureDebit, "x"),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            fx.engine.debit(account, 0, EntryReason::FeatureDebit, "x"),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            fx.engine.debit(account, 5, EntryReason::FeatureDebit, ""),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn ceiling_rejects_instead_of_clamping() {
        let fx = super::super::testing::fixture_with(EngineSettings {
            balance_ceiling: 100,
            ..EngineSettings::default()
        });
        let account = AccountId::generate();
        fx.engine.open_account(account).unwrap();

        let err = fx
            .engine
            .credit(account, 51, EntryReason::ManualAdjustment, "over")
            .unwrap_err();
        assert_eq!(
            err,
            BillingError::PlanLimitExceeded {
                ceiling: 100,
                attempted: 101
            }
        );
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
    }

    #[test]
    fn negative_adjustment_is_bounded_by_balance() {
        let (fx, account) = funded(50);

        fx.engine.adjust(account, -20, "fix-1", "ops", Some("typo")).unwrap();
        assert_eq!(fx.engine.balance(account).unwrap(), 30);

        let err = fx.engine.adjust(account, -31, "fix-2", "ops", None).unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { .. }));
    }

    #[test]
    fn grant_is_once_per_period() {
        let (fx, account) = funded(50);

        let replay = fx.engine.monthly_grant(account, PlanId::Free).unwrap();
        assert!(replay.is_duplicate());
        assert_eq!(replay.value().len(), 1);
        assert_eq!(fx.engine.balance(account).unwrap(), 50);
    }

    #[test]
    fn rollover_at_cap_keeps_everything() {
        let (fx, account) = funded(PRO_PLAN_CREDITS);
        fx.clock.advance(Duration::days(31));

        let entries = fx
            .engine
            .monthly_grant(account, PlanId::Pro)
            .unwrap()
            .into_inner();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, EntryReason::MonthlyGrant);
        assert_eq!(fx.engine.balance(account).unwrap(), 3000);
    }

    #[test]
    fn rollover_one_above_cap_expires_one_credit() {
        let (fx, account) = funded(PRO_PLAN_CREDITS + 1);
        fx.clock.advance(Duration::days(31));

        let entries = fx
            .engine
            .monthly_grant(account, PlanId::Pro)
            .unwrap()
            .into_inner();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, EntryReason::RolloverExpiry);
        assert_eq!(entries[0].delta, -1);
        assert_eq!(entries[0].resulting_balance, PRO_PLAN_CREDITS);
        assert_eq!(entries[1].delta, PRO_PLAN_CREDITS);
        assert_eq!(fx.engine.balance(account).unwrap(), 3000);

        let account = fx.engine.account(account).unwrap();
        assert_eq!(account.rollover_cap, PRO_PLAN_CREDITS);
    }

    #[test]
    fn transactions_page_newest_first() {
        let (fx, account) = funded(50);
        for i in 0..3 {
            fx.engine
                .debit(account, 1, EntryReason::FeatureDebit, &format!("d{i}"))
                .unwrap();
        }

        let page = fx.engine.transactions(account, None, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 2]);

        let next = fx.engine.transactions(account, Some(2), 10).unwrap();
        assert_eq!(next.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 0]);
    }
}
