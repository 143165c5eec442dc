/// Subscription lifecycle
///
/// ```text
/// trial ──(first charge)──► active ◄──(successful retry)── suspended
///   │                         │ ──(renewal failure)──────────►  │
///   └─────────────► cancelled ◄┴────────────────────────────────┘
///                      │
///                      └──(reactivate: same record, new period)──► active
/// ```
///
/// Writes go through a version compare-and-set. Processor calls happen
/// outside any store lock and are bounded by the processor guard.
use crate::directory::UserDirectory;
use crate::domain::{
    is_valid_currency, limits, BillingCycle, NewTransaction, PaymentMethod, Subscription,
    SubscriptionAccess, SubscriptionStatus, Transaction, TransactionKind, TransactionMetadata,
    TransactionStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::processors::{GuardedProcessor, ProcessorRegistry, RecurringRequest, RecurringUpdate};
use crate::repository::{Completion, LedgerStore, StoreError};
use crate::services::LedgerService;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Attempts for a compare-and-set before giving up with `Conflict`
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub fan_id: Uuid,
    pub creator_id: Uuid,
    pub price: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub trial_days: Option<u32>,
    pub payment_method_id: Uuid,
}

/// Fan-side changes to a live subscription. Price and cycle apply from the
/// next renewal; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpdateSubscription {
    pub price: Option<i64>,
    pub billing_cycle: Option<BillingCycle>,
    pub auto_renew: Option<bool>,
}

/// A new or reactivated subscription with its first charge, if one was due
#[derive(Debug, Clone)]
pub struct SubscriptionStarted {
    pub subscription: Subscription,
    pub initial_charge: Option<Transaction>,
}

/// Result of applying a processor renewal
#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    Applied {
        subscription: Subscription,
        transaction: Transaction,
    },
    /// The processor transaction was already recorded
    Duplicate(Transaction),
}

pub struct SubscriptionService {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    processors: ProcessorRegistry,
    directory: Arc<dyn UserDirectory>,
}

impl SubscriptionService {
    pub fn new(
        ledger: Arc<LedgerService>,
        processors: ProcessorRegistry,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
            processors,
            directory,
        }
    }

    /// Subscribe a fan to a creator. A cancelled record for the same pair is
    /// reactivated in place instead of creating a second row.
    pub async fn create(&self, request: CreateSubscription) -> ServiceResult<SubscriptionStarted> {
        if request.fan_id == request.creator_id {
            return Err(ServiceError::Validation(
                "cannot subscribe to yourself".to_string(),
            ));
        }
        limits::check_amount("subscription price", request.price, &limits::SUBSCRIPTION_PRICE)
            .map_err(ServiceError::Validation)?;
        if !is_valid_currency(&request.currency) {
            return Err(ServiceError::Validation(format!(
                "invalid currency code '{}'",
                request.currency
            )));
        }
        let trial_days = request.trial_days.filter(|days| *days > 0);
        if let Some(days) = trial_days {
            if days > limits::MAX_TRIAL_DAYS {
                return Err(ServiceError::Validation(format!(
                    "trial period must be at most {} days",
                    limits::MAX_TRIAL_DAYS
                )));
            }
        }

        let creator = self
            .directory
            .require_account(request.creator_id, "creator")
            .await?;
        if !creator.is_active_creator() {
            return Err(ServiceError::Validation(format!(
                "user {} is not an active creator",
                request.creator_id
            )));
        }

        let method = self
            .owned_method(request.fan_id, request.payment_method_id)
            .await?;
        let processor = self.processor(&method.processor)?;

        let now = Utc::now();
        let existing = self
            .store
            .find_subscription_for_pair(request.fan_id, request.creator_id)
            .await?;
        if let Some(current) = &existing {
            if !current.is_logically_cancelled(now) {
                return Err(ServiceError::Conflict(format!(
                    "already subscribed (subscription {})",
                    current.id
                )));
            }
        }

        let (status, period_end, trial_end) = match trial_days {
            Some(days) => {
                let end = now + Duration::days(days as i64);
                (SubscriptionStatus::Trial, end, Some(end))
            }
            None => (
                SubscriptionStatus::Active,
                request.billing_cycle.advance(now),
                None,
            ),
        };

        let (subscription, initial_charge) = match existing {
            Some(previous) => {
                info!(
                    subscription_id = %previous.id,
                    "Reactivating cancelled subscription in place"
                );
                self.restart(previous.id, |s| {
                    if !s.is_logically_cancelled(Utc::now()) {
                        return Err(ServiceError::Conflict(format!(
                            "already subscribed (subscription {})",
                            s.id
                        )));
                    }
                    s.price = request.price;
                    s.currency = request.currency.clone();
                    s.billing_cycle = request.billing_cycle;
                    s.processor = method.processor.clone();
                    s.payment_method_id = Some(method.id);
                    start_period(s, status, now, period_end, trial_end);
                    Ok(())
                })
                .await?
            }
            None => {
                let subscription = Subscription {
                    id: Uuid::new_v4(),
                    fan_id: request.fan_id,
                    creator_id: request.creator_id,
                    price: request.price,
                    currency: request.currency.clone(),
                    billing_cycle: request.billing_cycle,
                    status,
                    current_period_start: now,
                    current_period_end: period_end,
                    trial_end,
                    auto_renew: true,
                    processor: method.processor.clone(),
                    processor_subscription_id: None,
                    payment_method_id: Some(method.id),
                    last_renewal_id: None,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                    cancelled_at: None,
                };
                let charge = match trial_end {
                    Some(_) => None,
                    None => {
                        let new = first_charge(&subscription);
                        super::ledger::validate_new_transaction(&new)?;
                        Some(new)
                    }
                };
                self.store.create_subscription(subscription, charge).await?
            }
        };

        info!(
            subscription_id = %subscription.id,
            fan_id = %subscription.fan_id,
            creator_id = %subscription.creator_id,
            status = %subscription.status,
            "Subscription started"
        );

        self.register_recurring(&processor, subscription, &method, initial_charge)
            .await
    }

    /// Register the recurring charge with the processor. A rejected
    /// registration fails the first charge and cancels the subscription; an
    /// outage leaves both pending for the processor webhook.
    async fn register_recurring(
        &self,
        processor: &GuardedProcessor,
        subscription: Subscription,
        method: &PaymentMethod,
        initial_charge: Option<Transaction>,
    ) -> ServiceResult<SubscriptionStarted> {
        let request = RecurringRequest {
            subscription_id: subscription.id,
            fan_id: subscription.fan_id,
            creator_id: subscription.creator_id,
            price: subscription.price,
            currency: subscription.currency.clone(),
            billing_cycle: subscription.billing_cycle,
            payment_method_reference: method.processor_reference.clone(),
            reference: initial_charge.as_ref().map(|tx| tx.id),
            trial_end: subscription.trial_end,
        };

        match processor.create_recurring(&request).await {
            Ok(processor_subscription_id) => {
                let subscription = self
                    .attach_processor_subscription(subscription.id, &processor_subscription_id)
                    .await?;
                Ok(SubscriptionStarted {
                    subscription,
                    initial_charge,
                })
            }
            Err(e) if e.is_transient() => {
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Recurring registration outcome unknown; awaiting processor webhook"
                );
                Ok(SubscriptionStarted {
                    subscription,
                    initial_charge,
                })
            }
            Err(e) => {
                warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Processor rejected recurring registration"
                );
                if let Some(charge) = &initial_charge {
                    self.ledger
                        .mark_failed(charge.id, &format!("recurring registration rejected: {}", e))
                        .await?;
                }
                self.modify(subscription.id, |s| {
                    s.status = SubscriptionStatus::Cancelled;
                    s.auto_renew = false;
                    s.current_period_end = Utc::now();
                    s.cancelled_at = Some(Utc::now());
                    Ok(())
                })
                .await?;
                Err(e.into())
            }
        }
    }

    /// Cancel on behalf of the fan. Immediate cancellation ends access now;
    /// deferred cancellation only stops auto-renew.
    pub async fn cancel(
        &self,
        caller: Uuid,
        subscription_id: Uuid,
        immediate: bool,
    ) -> ServiceResult<Subscription> {
        let subscription = self.get(caller, subscription_id).await?;
        if subscription.fan_id != caller {
            return Err(ServiceError::Forbidden(
                "only the subscriber can cancel a subscription".to_string(),
            ));
        }
        if subscription.status == SubscriptionStatus::Cancelled {
            return Ok(subscription);
        }

        let cancelled = self
            .modify(subscription_id, |s| {
                let now = Utc::now();
                s.auto_renew = false;
                s.cancelled_at = Some(now);
                if immediate {
                    s.status = SubscriptionStatus::Cancelled;
                    s.current_period_end = now;
                }
                Ok(())
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            immediate = immediate,
            "Subscription cancelled"
        );

        // Best effort; the processor's cancellation webhook is idempotent
        if let Some(processor_subscription_id) = &cancelled.processor_subscription_id {
            match self.processor(&cancelled.processor) {
                Ok(processor) => {
                    if let Err(e) = processor
                        .cancel_recurring(processor_subscription_id, immediate)
                        .await
                    {
                        warn!(
                            subscription_id = %subscription_id,
                            error = %e,
                            "Failed to cancel recurring charge at processor"
                        );
                    }
                }
                Err(e) => warn!(subscription_id = %subscription_id, error = %e, "Processor missing"),
            }
        }

        Ok(cancelled)
    }

    /// Change price, cycle or auto-renew. Turning auto-renew back on lifts a
    /// deferred cancellation as long as the period has not run out. The
    /// processor is told first; if it refuses, nothing changes here.
    pub async fn update(
        &self,
        caller: Uuid,
        subscription_id: Uuid,
        changes: UpdateSubscription,
    ) -> ServiceResult<Subscription> {
        if changes.price.is_none() && changes.billing_cycle.is_none() && changes.auto_renew.is_none() {
            return Err(ServiceError::Validation("nothing to update".to_string()));
        }
        if let Some(price) = changes.price {
            limits::check_amount("subscription price", price, &limits::SUBSCRIPTION_PRICE)
                .map_err(ServiceError::Validation)?;
        }

        let subscription = self.get(caller, subscription_id).await?;
        if subscription.fan_id != caller {
            return Err(ServiceError::Forbidden(
                "only the subscriber can change a subscription".to_string(),
            ));
        }
        if subscription.is_logically_cancelled(Utc::now()) {
            return Err(ServiceError::Conflict(format!(
                "subscription {} is cancelled; reactivate it instead",
                subscription_id
            )));
        }

        let terms = RecurringUpdate {
            price: changes.price.unwrap_or(subscription.price),
            currency: subscription.currency.clone(),
            billing_cycle: changes.billing_cycle.unwrap_or(subscription.billing_cycle),
            auto_renew: changes.auto_renew.unwrap_or(subscription.auto_renew),
        };
        if let Some(processor_subscription_id) = &subscription.processor_subscription_id {
            self.processor(&subscription.processor)?
                .update_recurring(processor_subscription_id, &terms)
                .await?;
        }

        let updated = self
            .modify(subscription_id, |s| {
                let now = Utc::now();
                if s.is_logically_cancelled(now) {
                    return Err(ServiceError::Conflict(format!(
                        "subscription {} is cancelled; reactivate it instead",
                        s.id
                    )));
                }
                s.price = terms.price;
                s.billing_cycle = terms.billing_cycle;
                if s.auto_renew != terms.auto_renew {
                    s.auto_renew = terms.auto_renew;
                    s.cancelled_at = if terms.auto_renew { None } else { Some(now) };
                }
                Ok(())
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            price = updated.price,
            billing_cycle = %updated.billing_cycle,
            auto_renew = updated.auto_renew,
            "Subscription updated"
        );
        Ok(updated)
    }

    /// Access summary for the fan or the creator
    pub async fn status(&self, caller: Uuid, subscription_id: Uuid) -> ServiceResult<SubscriptionAccess> {
        let subscription = self.get(caller, subscription_id).await?;
        Ok(subscription.access(Utc::now()))
    }

    /// Apply a successful processor renewal charge
    pub async fn renew(
        &self,
        subscription_id: Uuid,
        amount: i64,
        processor_transaction_id: &str,
    ) -> ServiceResult<RenewalOutcome> {
        let subscription = self.require(subscription_id).await?;

        if let Some(existing) = self
            .store
            .find_by_processor_reference(&subscription.processor, processor_transaction_id)
            .await?
        {
            if !existing.is_pending() {
                self.repair_period(&subscription, &existing).await?;
                return Ok(RenewalOutcome::Duplicate(existing));
            }
        }

        let now = Utc::now();
        if subscription.is_logically_cancelled(now) {
            return Err(ServiceError::integrity(
                "renewal",
                format!(
                    "renewal {} received for cancelled subscription {}",
                    processor_transaction_id, subscription_id
                ),
            ));
        }
        if amount != subscription.price {
            warn!(
                subscription_id = %subscription_id,
                charged = amount,
                price = subscription.price,
                "Renewal amount differs from subscription price"
            );
        }

        let (_, period_end) = subscription.next_period(now);
        let charge = self
            .ledger
            .create_transaction(NewTransaction {
                payer_id: subscription.fan_id,
                recipient_id: Some(subscription.creator_id),
                kind: TransactionKind::Subscription,
                amount,
                currency: subscription.currency.clone(),
                processor: subscription.processor.clone(),
                payment_method_id: subscription.payment_method_id,
                metadata: TransactionMetadata::Subscription {
                    subscription_id,
                    billing_cycle: subscription.billing_cycle,
                    renewal: true,
                    period_end: Some(period_end),
                },
            })
            .await?;

        let transaction = match self
            .ledger
            .mark_completed(charge.id, processor_transaction_id)
            .await?
        {
            Completion::Completed { transaction, .. } => transaction,
            Completion::AlreadyCompleted(winner) => {
                // Lost a race with a concurrent delivery of the same renewal
                self.ledger
                    .mark_failed(charge.id, "duplicate renewal delivery")
                    .await?;
                return Ok(RenewalOutcome::Duplicate(winner));
            }
        };

        // Extend from the row as it is now: a concurrent renewal may have
        // moved the period since it was read above, and a duplicate delivery
        // may already have applied this charge through `repair_period`
        let subscription = self
            .modify(subscription_id, |s| {
                if s.last_renewal_id == Some(transaction.id) {
                    return Ok(());
                }
                let (start, end) = s.next_period(Utc::now());
                s.status = SubscriptionStatus::Active;
                s.current_period_start = start;
                s.current_period_end = end;
                s.last_renewal_id = Some(transaction.id);
                Ok(())
            })
            .await?;

        info!(
            subscription_id = %subscription_id,
            transaction_id = %transaction.id,
            period_end = %subscription.current_period_end,
            "Subscription renewed"
        );

        Ok(RenewalOutcome::Applied {
            subscription,
            transaction,
        })
    }

    /// Bring the period in line with an already-recorded renewal charge, for
    /// when the charge committed but the period update did not
    async fn repair_period(&self, subscription: &Subscription, charge: &Transaction) -> ServiceResult<()> {
        let period_end = match &charge.metadata {
            TransactionMetadata::Subscription {
                subscription_id,
                renewal: true,
                period_end: Some(end),
                ..
            } if *subscription_id == subscription.id => *end,
            _ => return Ok(()),
        };
        let applied = |s: &Subscription| {
            s.last_renewal_id == Some(charge.id) || s.current_period_end >= period_end
        };
        if charge.status != TransactionStatus::Completed
            || subscription.status == SubscriptionStatus::Cancelled
            || applied(subscription)
        {
            return Ok(());
        }

        let start = subscription.current_period_end;
        self.modify(subscription.id, |s| {
            if !applied(s) {
                s.status = SubscriptionStatus::Active;
                s.current_period_start = start;
                s.current_period_end = period_end;
                s.last_renewal_id = Some(charge.id);
            }
            Ok(())
        })
        .await?;
        warn!(
            subscription_id = %subscription.id,
            transaction_id = %charge.id,
            "Repaired subscription period from recorded renewal"
        );
        Ok(())
    }

    /// Active or trial → suspended after a failed charge
    pub async fn suspend(&self, subscription_id: Uuid, reason: &str) -> ServiceResult<Subscription> {
        let subscription = self.require(subscription_id).await?;
        match subscription.status {
            SubscriptionStatus::Active | SubscriptionStatus::Trial => {}
            _ => return Ok(subscription),
        }

        let suspended = self
            .modify(subscription_id, |s| {
                if matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::Trial) {
                    s.status = SubscriptionStatus::Suspended;
                }
                Ok(())
            })
            .await?;
        info!(subscription_id = %subscription_id, reason = reason, "Subscription suspended");
        Ok(suspended)
    }

    /// Restart a cancelled subscription on the same record with a fresh period
    pub async fn reactivate(&self, caller: Uuid, subscription_id: Uuid) -> ServiceResult<SubscriptionStarted> {
        let subscription = self.get(caller, subscription_id).await?;
        if subscription.fan_id != caller {
            return Err(ServiceError::Forbidden(
                "only the subscriber can reactivate a subscription".to_string(),
            ));
        }
        let now = Utc::now();
        if !subscription.is_logically_cancelled(now) {
            return Err(ServiceError::Conflict(format!(
                "subscription {} is not cancelled",
                subscription_id
            )));
        }

        let method_id = subscription.payment_method_id.ok_or_else(|| {
            ServiceError::Validation("subscription has no payment method".to_string())
        })?;
        let method = self.owned_method(caller, method_id).await?;
        let processor = self.processor(&method.processor)?;

        let period_end = subscription.billing_cycle.advance(now);
        let (reactivated, charge) = self
            .restart(subscription_id, |s| {
                if !s.is_logically_cancelled(Utc::now()) {
                    return Err(ServiceError::Conflict(format!(
                        "subscription {} is not cancelled",
                        s.id
                    )));
                }
                start_period(s, SubscriptionStatus::Active, now, period_end, None);
                Ok(())
            })
            .await?;

        info!(subscription_id = %subscription_id, "Subscription reactivated");
        self.register_recurring(&processor, reactivated, &method, charge)
            .await
    }

    /// Flip deferred cancellations whose period has ended. Returns the count.
    pub async fn finalize_expired(&self, now: DateTime<Utc>, limit: i64) -> ServiceResult<usize> {
        let lapsed = self.store.list_lapsed_subscriptions(now, limit).await?;
        let mut finalized = 0;
        for subscription in lapsed {
            let result = self
                .modify(subscription.id, |s| {
                    if s.status != SubscriptionStatus::Cancelled && s.is_logically_cancelled(now) {
                        s.status = SubscriptionStatus::Cancelled;
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(s) if s.status == SubscriptionStatus::Cancelled => finalized += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Failed to finalize subscription")
                }
            }
        }
        if finalized > 0 {
            info!(count = finalized, "Finalized lapsed subscriptions");
        }
        Ok(finalized)
    }

    /// The processor ended the recurring charge. Returns `None` when the
    /// subscription was already cancelled.
    pub async fn processor_cancelled(&self, subscription_id: Uuid) -> ServiceResult<Option<Subscription>> {
        let subscription = self.require(subscription_id).await?;
        if subscription.status == SubscriptionStatus::Cancelled {
            return Ok(None);
        }

        let cancelled = self
            .modify(subscription_id, |s| {
                let now = Utc::now();
                s.status = SubscriptionStatus::Cancelled;
                s.auto_renew = false;
                s.cancelled_at.get_or_insert(now);
                if s.current_period_end > now {
                    s.current_period_end = now;
                }
                Ok(())
            })
            .await?;
        info!(subscription_id = %subscription_id, "Subscription cancelled by processor");
        Ok(Some(cancelled))
    }

    /// Record the processor's id for the recurring charge
    pub async fn attach_processor_subscription(
        &self,
        subscription_id: Uuid,
        processor_subscription_id: &str,
    ) -> ServiceResult<Subscription> {
        self.modify(subscription_id, |s| match s.processor_subscription_id.as_deref() {
            None => {
                s.processor_subscription_id = Some(processor_subscription_id.to_string());
                Ok(())
            }
            Some(bound) if bound == processor_subscription_id => Ok(()),
            Some(bound) => Err(ServiceError::integrity(
                "processor_subscription",
                format!(
                    "subscription {} is bound to {}, not {}",
                    s.id, bound, processor_subscription_id
                ),
            )),
        })
        .await
    }

    pub async fn get(&self, caller: Uuid, subscription_id: Uuid) -> ServiceResult<Subscription> {
        let subscription = self.require(subscription_id).await?;
        if subscription.fan_id != caller && subscription.creator_id != caller {
            return Err(ServiceError::NotFound(format!(
                "subscription {}",
                subscription_id
            )));
        }
        Ok(subscription)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ServiceResult<Vec<Subscription>> {
        let (offset, limit) = limits::page_window(page, limit).map_err(ServiceError::Validation)?;
        Ok(self.store.list_subscriptions(user_id, offset, limit).await?)
    }

    pub async fn find_by_processor_id(
        &self,
        processor: &str,
        processor_subscription_id: &str,
    ) -> ServiceResult<Option<Subscription>> {
        Ok(self
            .store
            .find_subscription_by_processor_id(processor, processor_subscription_id)
            .await?)
    }

    async fn require(&self, subscription_id: Uuid) -> ServiceResult<Subscription> {
        self.store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("subscription {}", subscription_id)))
    }

    /// Read, change and write back under the version check, re-reading on
    /// concurrent modification
    async fn modify<F>(&self, subscription_id: Uuid, mut change: F) -> ServiceResult<Subscription>
    where
        F: FnMut(&mut Subscription) -> ServiceResult<()>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut subscription = self.require(subscription_id).await?;
            change(&mut subscription)?;
            match self.store.update_subscription(&subscription).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "subscription {} is being modified concurrently",
            subscription_id
        )))
    }

    /// `modify` for a restart into a fresh period: the row and the pending
    /// charge for that period are written together. Trials carry no charge.
    async fn restart<F>(
        &self,
        subscription_id: Uuid,
        mut change: F,
    ) -> ServiceResult<(Subscription, Option<Transaction>)>
    where
        F: FnMut(&mut Subscription) -> ServiceResult<()>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut subscription = self.require(subscription_id).await?;
            change(&mut subscription)?;
            let charge = match subscription.trial_end {
                Some(_) => None,
                None => {
                    let new = first_charge(&subscription);
                    super::ledger::validate_new_transaction(&new)?;
                    Some(new)
                }
            };
            match self.store.restart_subscription(&subscription, charge).await {
                Ok(restarted) => return Ok(restarted),
                Err(StoreError::VersionConflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "subscription {} is being modified concurrently",
            subscription_id
        )))
    }

    async fn owned_method(&self, user_id: Uuid, method_id: Uuid) -> ServiceResult<PaymentMethod> {
        match self.store.find_payment_method(method_id).await? {
            Some(method) if method.user_id == user_id => Ok(method),
            _ => Err(ServiceError::NotFound(format!("payment method {}", method_id))),
        }
    }

    fn processor(&self, name: &str) -> ServiceResult<Arc<GuardedProcessor>> {
        self.processors
            .get(name)
            .ok_or_else(|| ServiceError::UnknownProcessor(name.to_string()))
    }
}

/// Reset a subscription to a fresh live period
fn start_period(
    subscription: &mut Subscription,
    status: SubscriptionStatus,
    now: DateTime<Utc>,
    period_end: DateTime<Utc>,
    trial_end: Option<DateTime<Utc>>,
) {
    subscription.status = status;
    subscription.current_period_start = now;
    subscription.current_period_end = period_end;
    subscription.trial_end = trial_end;
    subscription.auto_renew = true;
    subscription.cancelled_at = None;
    subscription.processor_subscription_id = None;
    subscription.last_renewal_id = None;
}

/// Pending charge for the first period of `subscription`
fn first_charge(subscription: &Subscription) -> NewTransaction {
    NewTransaction {
        payer_id: subscription.fan_id,
        recipient_id: Some(subscription.creator_id),
        kind: TransactionKind::Subscription,
        amount: subscription.price,
        currency: subscription.currency.clone(),
        processor: subscription.processor.clone(),
        payment_method_id: subscription.payment_method_id,
        metadata: TransactionMetadata::Subscription {
            subscription_id: subscription.id,
            billing_cycle: subscription.billing_cycle,
            renewal: false,
            period_end: Some(subscription.current_period_end),
        },
    }
}
