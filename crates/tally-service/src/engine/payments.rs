//! Payment reconciliation: intents, provider confirmation and paying for a
//! plan with credits.
//!
//! A successful payment is applied exactly once: the intent moves to
//! `succeeded`, the payment credit is posted under the intent id and the
//! subscription is activated, all in one write. Replayed callbacks find the
//! intent already succeeded and report a duplicate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tally_core::{
    period_key, post_entries, AccountId, AuditEvent, BillingError, BillingPeriod, EntryDraft,
    EntryReason, Funding, IdempotencyKey, IntentStatus, LedgerEntry, LifecycleEvent, Outcome,
    PaymentIntent, PaymentIntentId, PlanId, Result, Subscription, SubscriptionStatus,
};
use tally_store::WriteSet;

use super::{transition_event, Engine};
use crate::provider::{ProviderEvent, ProviderEventKind};

/// What a provider event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ConfirmEffect {
    /// Payment applied: credit posted and subscription active.
    Paid {
        /// The succeeded intent.
        intent: PaymentIntent,
        /// The payment credit.
        entry: LedgerEntry,
        /// The activated subscription.
        subscription: Option<Subscription>,
    },
    /// Intent marked failed; the subscription is untouched.
    Failed {
        /// The failed intent.
        intent: PaymentIntent,
    },
    /// Intent canceled after the session expired.
    Canceled {
        /// The canceled intent.
        intent: PaymentIntent,
    },
    /// The event arrived after the intent succeeded and was ignored.
    Unchanged {
        /// The intent as stored.
        intent: PaymentIntent,
    },
    /// A renewal charge failed.
    RenewalFailed {
        /// The past-due subscription.
        subscription: Subscription,
    },
    /// A payment method is now on file.
    PaymentMethodRecorded {
        /// The updated subscription.
        subscription: Subscription,
    },
    /// Event type we do not act on.
    Ignored {
        /// Provider event type.
        event_type: String,
    },
}

/// Result of [`Engine::pay_with_credits`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditPurchase {
    /// The debit for the plan price.
    pub entry: LedgerEntry,
    /// The activated subscription.
    pub subscription: Option<Subscription>,
}

impl Engine {
    /// Create a payment intent for a paid plan.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for the free plan, `AccountNotFound` or a
    /// storage error.
    pub fn create_intent(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
    ) -> Result<PaymentIntent> {
        let plan = self.catalog.get(plan_id)?;
        if !plan.is_paid() {
            return Err(BillingError::invalid_transition(plan_id, "purchase"));
        }
        self.load_account(account_id)?;

        let intent = PaymentIntent::new(
            account_id,
            plan_id,
            billing_period,
            plan.prices.for_period(billing_period),
            self.settings.currency.clone(),
            self.now(),
        );
        self.commit(WriteSet::default().with_intent(intent.clone()), Vec::new())?;

        tracing::info!(
            intent_id = %intent.id,
            account_id = %account_id,
            plan = %plan_id,
            amount_minor = intent.amount_minor,
            "Payment intent created"
        );
        Ok(intent)
    }

    /// Look up an intent.
    ///
    /// # Errors
    ///
    /// Returns `IntentNotFound` or a storage error.
    pub fn intent(&self, intent_id: PaymentIntentId) -> Result<PaymentIntent> {
        self.store
            .get_intent(&intent_id)?
            .ok_or_else(|| BillingError::IntentNotFound {
                reference: intent_id.to_string(),
            })
    }

    /// Move an intent to `pending` before calling the provider.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the intent is already final.
    pub fn begin_checkout(&self, intent_id: PaymentIntentId) -> Result<PaymentIntent> {
        let account_id = self.intent(intent_id)?.account_id;
        self.locks.with_account(account_id, || {
            let mut intent = self.intent(intent_id)?;
            match intent.status {
                IntentStatus::Pending => Ok(intent),
                IntentStatus::Created => {
                    intent.set_status(IntentStatus::Pending, self.now());
                    self.commit(WriteSet::default().with_intent(intent.clone()), Vec::new())?;
                    Ok(intent)
                }
                status => Err(BillingError::invalid_transition(status, "begin_checkout")),
            }
        })
    }

    /// Store the provider's session id on an open intent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the intent is final or already carries
    /// a different reference.
    pub fn attach_provider_reference(
        &self,
        intent_id: PaymentIntentId,
        provider_reference: &str,
    ) -> Result<PaymentIntent> {
        if provider_reference.is_empty() {
            return Err(BillingError::InvalidPayload(
                "provider reference must not be empty".into(),
            ));
        }
        let account_id = self.intent(intent_id)?.account_id;

        self.locks.with_account(account_id, || {
            let mut intent = self.intent(intent_id)?;
            match intent.provider_reference.as_deref() {
                Some(existing) if existing == provider_reference => return Ok(intent),
                Some(existing) => {
                    return Err(BillingError::invalid_transition(
                        format!("reference {existing}"),
                        "attach_provider_reference",
                    ))
                }
                None => {}
            }
            if !intent.status.is_open() {
                return Err(BillingError::invalid_transition(
                    intent.status,
                    "attach_provider_reference",
                ));
            }

            intent.provider_reference = Some(provider_reference.to_string());
            intent.updated_at = self.now();
            self.commit(WriteSet::default().with_intent(intent.clone()), Vec::new())?;

            tracing::debug!(
                intent_id = %intent_id,
                provider_reference = %provider_reference,
                "Provider reference attached"
            );
            Ok(intent)
        })
    }

    /// Cancel an open intent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the intent already succeeded or failed.
    pub fn cancel_intent(&self, intent_id: PaymentIntentId) -> Result<Outcome<PaymentIntent>> {
        let account_id = self.intent(intent_id)?.account_id;
        self.locks.with_account(account_id, || {
            let mut intent = self.intent(intent_id)?;
            match intent.status {
                IntentStatus::Canceled => Ok(Outcome::Duplicate(intent)),
                IntentStatus::Created | IntentStatus::Pending => {
                    let now = self.now();
                    intent.set_status(IntentStatus::Canceled, now);
                    self.commit(
                        WriteSet::default().with_intent(intent.clone()),
                        vec![finalized_event(&intent)],
                    )?;
                    tracing::info!(intent_id = %intent_id, "Payment intent canceled");
                    Ok(Outcome::Applied(intent))
                }
                status => Err(BillingError::invalid_transition(status, "cancel_intent")),
            }
        })
    }

    /// Mark the live subscription as having a payment method on file.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` if nothing is live.
    pub fn record_payment_method(&self, account_id: AccountId) -> Result<Subscription> {
        self.locks.with_account(account_id, || {
            let mut subscription = self
                .live_subscription(account_id)?
                .ok_or(BillingError::SubscriptionNotFound { account_id })?;
            if !subscription.has_payment_method {
                subscription.has_payment_method = true;
                subscription.updated_at = self.now();
                self.commit(
                    WriteSet::default().with_subscription(subscription.clone()),
                    Vec::new(),
                )?;
                tracing::info!(account_id = %account_id, "Payment method recorded");
            }
            Ok(subscription)
        })
    }

    /// Apply a verified provider event.
    ///
    /// Safe to call any number of times with the same event.
    ///
    /// # Errors
    ///
    /// - `IntentNotFound` if no intent matches the event.
    /// - `InvalidPayload` if amount or currency disagree with the intent, or
    ///   an account-level event carries no account.
    /// - `IntegrityViolation` if the account is frozen; the provider should
    ///   redeliver once an operator has repaired it.
    pub fn confirm(&self, event: &ProviderEvent) -> Result<Outcome<ConfirmEffect>> {
        tracing::debug!(
            event_id = %event.event_id,
            kind = ?event.kind,
            provider_reference = ?event.provider_reference,
            "Confirming provider event"
        );

        match &event.kind {
            ProviderEventKind::CheckoutSucceeded => self.confirm_success(event),
            ProviderEventKind::CheckoutFailed => self.finalize_unpaid(event, IntentStatus::Failed),
            ProviderEventKind::CheckoutExpired => {
                self.finalize_unpaid(event, IntentStatus::Canceled)
            }
            ProviderEventKind::RenewalFailed => {
                let account_id = self.event_account(event)?;
                let subscription = self.renewal_failed(account_id)?;
                Ok(Outcome::Applied(ConfirmEffect::RenewalFailed { subscription }))
            }
            ProviderEventKind::PaymentMethodAttached => {
                let account_id = self.event_account(event)?;
                let subscription = self.record_payment_method(account_id)?;
                Ok(Outcome::Applied(ConfirmEffect::PaymentMethodRecorded {
                    subscription,
                }))
            }
            ProviderEventKind::Other(event_type) => {
                tracing::debug!(event_type = %event_type, "Ignoring provider event");
                Ok(Outcome::Applied(ConfirmEffect::Ignored {
                    event_type: event_type.clone(),
                }))
            }
        }
    }

    /// Buy a plan with credits, bypassing the provider.
    ///
    /// # Errors
    ///
    /// - `InsufficientCredits` if the balance is short; nothing is written.
    /// - `InvalidTransition` for the free plan.
    pub fn pay_with_credits(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
        purchase_id: &str,
    ) -> Result<Outcome<CreditPurchase>> {
        if purchase_id.is_empty() {
            return Err(BillingError::InvalidPayload("purchase_id must not be empty".into()));
        }
        let plan = self.catalog.get(plan_id)?.clone();
        if !plan.is_paid() {
            return Err(BillingError::invalid_transition(plan_id, "purchase"));
        }

        self.locks.with_account(account_id, || {
            let key = IdempotencyKey::new(account_id, EntryReason::FeatureDebit, purchase_id);
            if let Some(entry) = self.store.find_entry(&key)? {
                return Ok(Outcome::Duplicate(CreditPurchase {
                    entry,
                    subscription: self.store.current_subscription(&account_id)?,
                }));
            }

            let now = self.now();
            let price = plan.prices.for_period(billing_period);
            let mut account = self.load_account(account_id)?;
            let draft = EntryDraft::debit(EntryReason::FeatureDebit, price, purchase_id)
                .with_metadata(json!({
                    "kind": "plan_purchase",
                    "plan": plan_id,
                    "billing_period": billing_period,
                }));
            let entries = post_entries(&mut account, vec![draft], self.limits(), now)?;
            let entry = entries
                .first()
                .cloned()
                .ok_or_else(|| BillingError::Storage("posting produced no entry".into()))?;

            let activation = self.activate(
                account_id,
                plan_id,
                billing_period,
                Funding::Credits,
                "credit_purchase",
            )?;
            let subscription = activation.subscription.clone();
            let writes = activation.stage(WriteSet::for_account(account).with_entries(entries));
            self.commit(writes, activation.events)?;

            tracing::info!(
                account_id = %account_id,
                plan = %plan_id,
                price,
                purchase_id = %purchase_id,
                "Plan purchased with credits"
            );
            Ok(Outcome::Applied(CreditPurchase {
                entry,
                subscription: Some(subscription),
            }))
        })
    }

    fn confirm_success(&self, event: &ProviderEvent) -> Result<Outcome<ConfirmEffect>> {
        let located = self.locate_intent(event)?;
        let account_id = located.account_id;

        self.locks.with_account(account_id, || {
            let mut intent = self.intent(located.id)?;
            let credit_key = IdempotencyKey::new(account_id, EntryReason::PaymentCredit, intent.id.to_string());

            if intent.status == IntentStatus::Succeeded {
                let entry = self
                    .store
                    .find_entry(&credit_key)?
                    .ok_or_else(|| BillingError::EntryNotFound {
                        entry_id: credit_key.to_string(),
                    })?;
                tracing::info!(
                    intent_id = %intent.id,
                    event_id = %event.event_id,
                    "Duplicate payment confirmation"
                );
                return Ok(Outcome::Duplicate(ConfirmEffect::Paid {
                    intent,
                    entry,
                    subscription: self.store.current_subscription(&account_id)?,
                }));
            }

            check_amount(&intent, event)?;
            if intent.provider_reference.is_none() {
                intent.provider_reference.clone_from(&event.provider_reference);
            }

            let plan = self.catalog.get(intent.plan_id)?.clone();
            let now = self.now();
            let period = period_key(now);

            let mut activation = self.activate(
                account_id,
                intent.plan_id,
                intent.billing_period,
                Funding::Provider,
                "payment_succeeded",
            )?;
            activation.subscription.has_payment_method = true;
            let subscription = activation.subscription.clone();

            let mut account = self.load_account(account_id)?;
            let draft = EntryDraft::credit(
                EntryReason::PaymentCredit,
                plan.credits_for_payment(),
                intent.id.to_string(),
            )
            .with_metadata(json!({
                "plan": intent.plan_id,
                "billing_period": intent.billing_period,
                "amount_minor": intent.amount_minor,
                "currency": intent.currency,
                "provider_reference": intent.provider_reference,
            }));
            let entries = post_entries(&mut account, vec![draft], self.limits(), now)?;
            account.last_replenished_period = Some(period);
            account.rollover_cap = self.rollover().cap(plan.monthly_credit_allowance);
            let entry = entries
                .first()
                .cloned()
                .ok_or_else(|| BillingError::Storage("posting produced no entry".into()))?;

            let previous = intent.status;
            intent.set_status(IntentStatus::Succeeded, now);
            let writes = activation.stage(
                WriteSet::for_account(account)
                    .with_entries(entries)
                    .with_intent(intent.clone()),
            );
            let mut events = activation.events;
            events.push(finalized_event(&intent));
            self.commit(writes, events)?;

            if matches!(previous, IntentStatus::Failed | IntentStatus::Canceled) {
                tracing::warn!(
                    intent_id = %intent.id,
                    previous = %previous,
                    "Late payment success superseded a final intent"
                );
            }
            tracing::info!(
                intent_id = %intent.id,
                account_id = %account_id,
                plan = %intent.plan_id,
                credits = entry.delta,
                "Payment confirmed"
            );
            Ok(Outcome::Applied(ConfirmEffect::Paid {
                intent,
                entry,
                subscription: Some(subscription),
            }))
        })
    }

    fn finalize_unpaid(
        &self,
        event: &ProviderEvent,
        status: IntentStatus,
    ) -> Result<Outcome<ConfirmEffect>> {
        let located = self.locate_intent(event)?;

        self.locks.with_account(located.account_id, || {
            let mut intent = self.intent(located.id)?;
            let effect = |intent: PaymentIntent| match status {
                IntentStatus::Failed => ConfirmEffect::Failed { intent },
                _ => ConfirmEffect::Canceled { intent },
            };

            if intent.status == IntentStatus::Succeeded {
                tracing::info!(
                    intent_id = %intent.id,
                    event_id = %event.event_id,
                    "Ignoring failure for a succeeded intent"
                );
                return Ok(Outcome::Duplicate(ConfirmEffect::Unchanged { intent }));
            }
            if intent.status == status {
                return Ok(Outcome::Duplicate(effect(intent)));
            }

            if intent.provider_reference.is_none() {
                intent.provider_reference.clone_from(&event.provider_reference);
            }
            intent.set_status(status, self.now());
            self.commit(
                WriteSet::default().with_intent(intent.clone()),
                vec![finalized_event(&intent)],
            )?;

            tracing::info!(
                intent_id = %intent.id,
                status = %status,
                "Payment intent finalized without payment"
            );
            Ok(Outcome::Applied(effect(intent)))
        })
    }

    fn locate_intent(&self, event: &ProviderEvent) -> Result<PaymentIntent> {
        if let Some(reference) = &event.provider_reference {
            if let Some(intent) = self.store.find_intent_by_provider_reference(reference)? {
                return Ok(intent);
            }
        }
        if let Some(intent_id) = event.intent_id {
            if let Some(intent) = self.store.get_intent(&intent_id)? {
                return Ok(intent);
            }
        }
        Err(BillingError::IntentNotFound {
            reference: event
                .provider_reference
                .clone()
                .or_else(|| event.intent_id.map(|id| id.to_string()))
                .unwrap_or_else(|| event.event_id.clone()),
        })
    }

    fn event_account(&self, event: &ProviderEvent) -> Result<AccountId> {
        if let Some(account_id) = event.account_id {
            return Ok(account_id);
        }
        match self.locate_intent(event) {
            Ok(intent) => Ok(intent.account_id),
            Err(BillingError::IntentNotFound { .. }) => Err(BillingError::InvalidPayload(format!(
                "event {} names no account",
                event.event_id
            ))),
            Err(e) => Err(e),
        }
    }

    /// The subscription that results from paying for `plan_id`. Caller
    /// holds the account lock.
    ///
    /// A past-due record whose grace window has closed is canceled and a
    /// new record is opened in its place.
    fn activate(
        &self,
        account_id: AccountId,
        plan_id: PlanId,
        billing_period: BillingPeriod,
        funding: Funding,
        cause: &str,
    ) -> Result<Activation> {
        let now = self.now();
        let mut events = Vec::new();
        let mut retired = None;

        let live = match self.live_subscription(account_id)? {
            Some(mut lapsed) if self.grace_expired(&lapsed, now) => {
                let from = lapsed.transition(LifecycleEvent::GraceExpired, now)?;
                events.push(transition_event(&lapsed, Some(from), "grace_expired"));
                tracing::info!(
                    account_id = %account_id,
                    subscription_id = %lapsed.id,
                    "Payment arrived after grace, opening a new subscription"
                );
                retired = Some(lapsed);
                None
            }
            other => other,
        };

        let Some(mut subscription) = live else {
            let mut subscription = Subscription::active(account_id, plan_id, billing_period, now);
            subscription.funding = funding;
            events.push(transition_event(&subscription, None, cause));
            return Ok(Activation {
                subscription,
                retired,
                events,
            });
        };

        let from = subscription.transition(LifecycleEvent::PaymentSucceeded, now)?;
        let switched =
            subscription.plan_id != plan_id || subscription.billing_period != billing_period;

        if from == SubscriptionStatus::Trialing || switched {
            subscription.plan_id = plan_id;
            subscription.billing_period = billing_period;
            subscription.restart_window(now);
        } else {
            subscription.roll_window(now);
        }
        subscription.funding = funding;
        subscription.pending_plan_id = None;
        subscription.cancel_at_period_end = false;

        events.push(transition_event(&subscription, Some(from), cause));
        Ok(Activation {
            subscription,
            retired,
            events,
        })
    }

    /// Whether `subscription` is past due and out of grace at `now`.
    pub(super) fn grace_expired(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.status == SubscriptionStatus::PastDue
            && subscription
                .grace_deadline(self.settings.grace_period_days)
                .is_some_and(|deadline| now >= deadline)
    }
}

/// Records touched by a payment.
struct Activation {
    subscription: Subscription,
    retired: Option<Subscription>,
    events: Vec<AuditEvent>,
}

impl Activation {
    fn stage(&self, mut writes: WriteSet) -> WriteSet {
        writes.subscriptions.extend(self.retired.iter().cloned());
        writes.subscriptions.push(self.subscription.clone());
        writes
    }
}

fn check_amount(intent: &PaymentIntent, event: &ProviderEvent) -> Result<()> {
    if let Some(amount) = event.amount_minor {
        if amount != intent.amount_minor {
            return Err(BillingError::InvalidPayload(format!(
                "amount {amount} does not match intent amount {}",
                intent.amount_minor
            )));
        }
    }
    if let Some(currency) = &event.currency {
        if !currency.eq_ignore_ascii_case(&intent.currency) {
            return Err(BillingError::InvalidPayload(format!(
                "currency {currency} does not match intent currency {}",
                intent.currency
            )));
        }
    }
    Ok(())
}

fn finalized_event(intent: &PaymentIntent) -> AuditEvent {
    AuditEvent::IntentFinalized {
        account_id: intent.account_id,
        intent_id: intent.id,
        status: intent.status,
        at: intent.updated_at,
    }
}
