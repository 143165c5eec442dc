/// Webhook reconciliation
///
/// Processor notifications are authenticated, stored in the inbox under the
/// processor's event id and then dispatched. The HTTP caller gets its answer
/// as soon as the entry is stored; dispatch failures only affect the retry
/// schedule of the entry.
use crate::domain::{NormalizedEvent, Transaction, TransactionStatus, WebhookEnvelope};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::processors::ProcessorRegistry;
use crate::repository::{Completion, LedgerStore};
use crate::services::subscriptions::RenewalOutcome;
use crate::services::{LedgerService, SubscriptionService};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webhook_inbox::{Enqueued, InboxEntry, InboxStats, InboxStore, NewInboxEntry, RetryPolicy};

/// What dispatching an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Already reflected in the ledger
    Duplicate,
    /// Refers to something not known yet; retried with backoff
    Deferred(String),
    /// Permanently invalid; dead-lettered
    Rejected(String),
    /// Event type the ledger does not act on
    Ignored,
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Duplicate => "duplicate",
            Disposition::Deferred(_) => "deferred",
            Disposition::Rejected(_) => "rejected",
            Disposition::Ignored => "ignored",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Deferred(reason) | Disposition::Rejected(reason) => {
                write!(f, "{}: {}", self.label(), reason)
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Answer to a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First delivery; dispatched inline with this result
    Queued {
        event_id: String,
        disposition: Disposition,
    },
    /// Seen before; acknowledged without dispatching
    Duplicate { event_id: String },
}

pub struct WebhookReconciler {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    subscriptions: Arc<SubscriptionService>,
    processors: ProcessorRegistry,
    inbox: Arc<dyn InboxStore>,
    retry: RetryPolicy,
    lease: Duration,
}

impl WebhookReconciler {
    pub fn new(
        ledger: Arc<LedgerService>,
        subscriptions: Arc<SubscriptionService>,
        processors: ProcessorRegistry,
        inbox: Arc<dyn InboxStore>,
        retry: RetryPolicy,
        lease: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
            subscriptions,
            processors,
            inbox,
            retry,
            lease,
        }
    }

    /// Authenticate, store and dispatch one delivery.
    ///
    /// Errors mean nothing was stored: unknown processor, bad signature,
    /// malformed body or an inbox failure. Everything after the entry is
    /// stored is reported through the disposition.
    pub async fn ingest(
        &self,
        processor_name: &str,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ServiceResult<IngestOutcome> {
        let processor = self
            .processors
            .get(processor_name)
            .ok_or_else(|| ServiceError::UnknownProcessor(processor_name.to_string()))?;

        let envelope = processor.decode_webhook(payload, signature).map_err(|e| {
            metrics::record_webhook(processor_name, "rejected");
            warn!(processor = processor_name, error = %e, "Webhook rejected");
            e
        })?;

        let body = serde_json::to_value(&envelope)
            .map_err(|e| ServiceError::Internal(format!("failed to serialize webhook: {}", e)))?;
        let new = NewInboxEntry::new(
            processor_name,
            envelope.event_id.clone(),
            envelope.event_type.clone(),
            body,
        )
        .leased_for(self.lease);

        match self.inbox.enqueue(new).await? {
            Enqueued::Duplicate(entry) => {
                metrics::record_webhook(processor_name, "duplicate_delivery");
                info!(
                    processor = processor_name,
                    event_id = %entry.event_id,
                    status = %entry.status,
                    "Duplicate webhook delivery acknowledged"
                );
                Ok(IngestOutcome::Duplicate {
                    event_id: entry.event_id,
                })
            }
            Enqueued::New(entry) => {
                let disposition = self.process_entry(&entry).await;
                Ok(IngestOutcome::Queued {
                    event_id: entry.event_id,
                    disposition,
                })
            }
        }
    }

    /// Dispatch a stored entry and record the outcome on it
    pub async fn process_entry(&self, entry: &InboxEntry) -> Disposition {
        let disposition = match serde_json::from_value::<WebhookEnvelope>(entry.payload.clone()) {
            Ok(envelope) => self.dispatch_classified(&entry.source, &envelope).await,
            Err(e) => Disposition::Rejected(format!("unreadable inbox payload: {}", e)),
        };
        metrics::record_webhook(&entry.source, disposition.label());

        if let Err(e) = self.record_outcome(entry, &disposition).await {
            // The lease expires and the entry is claimed again
            error!(
                inbox_id = %entry.id,
                event_id = %entry.event_id,
                error = %e,
                "Failed to record webhook outcome"
            );
        }
        disposition
    }

    async fn record_outcome(&self, entry: &InboxEntry, disposition: &Disposition) -> ServiceResult<()> {
        match disposition {
            Disposition::Applied | Disposition::Duplicate | Disposition::Ignored => {
                self.inbox.mark_processed(entry.id).await?;
                debug!(event_id = %entry.event_id, disposition = %disposition, "Webhook processed");
            }
            Disposition::Deferred(reason) => {
                let attempts = entry.attempts.max(0) as u32 + 1;
                if self.retry.is_exhausted(attempts) {
                    error!(
                        processor = %entry.source,
                        event_id = %entry.event_id,
                        attempts = attempts,
                        reason = %reason,
                        "Webhook retries exhausted; dead-lettered"
                    );
                    self.inbox.mark_dead(entry.id, reason).await?;
                    metrics::record_webhook(&entry.source, "dead");
                } else {
                    let next = self.retry.next_attempt_at(Utc::now(), attempts);
                    info!(
                        processor = %entry.source,
                        event_id = %entry.event_id,
                        attempts = attempts,
                        next_attempt_at = %next,
                        reason = %reason,
                        "Webhook deferred"
                    );
                    self.inbox.schedule_retry(entry.id, reason, next).await?;
                }
            }
            Disposition::Rejected(reason) => {
                error!(
                    processor = %entry.source,
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    reason = %reason,
                    "Webhook rejected; dead-lettered"
                );
                self.inbox.mark_dead(entry.id, reason).await?;
                metrics::record_webhook(&entry.source, "dead");
            }
        }
        Ok(())
    }

    /// Map dispatch errors onto dispositions: outages are retried, anything
    /// the ledger refused is dead-lettered
    async fn dispatch_classified(&self, source: &str, envelope: &WebhookEnvelope) -> Disposition {
        match self.dispatch(source, envelope).await {
            Ok(disposition) => disposition,
            Err(e) if e.is_transient() => Disposition::Deferred(e.to_string()),
            Err(ServiceError::Conflict(message)) => Disposition::Deferred(message),
            Err(e) => Disposition::Rejected(e.to_string()),
        }
    }

    /// Apply one normalized event to the ledger
    pub async fn dispatch(&self, source: &str, envelope: &WebhookEnvelope) -> ServiceResult<Disposition> {
        match &envelope.event {
            NormalizedEvent::SaleSucceeded {
                processor_tx_id,
                amount,
                user_ref,
                subscription_ref,
            } => {
                let tx = match self.referenced_transaction(source, user_ref).await? {
                    Ok(tx) => tx,
                    Err(disposition) => return Ok(disposition),
                };
                if *amount != tx.amount {
                    return Err(ServiceError::integrity(
                        "webhook_amount",
                        format!(
                            "sale {} for transaction {} charged {} but the ledger expects {}",
                            processor_tx_id, tx.id, amount, tx.amount
                        ),
                    ));
                }
                if let (Some(reference), Some(subscription_id)) =
                    (subscription_ref, tx.subscription_id())
                {
                    self.subscriptions
                        .attach_processor_subscription(subscription_id, reference)
                        .await?;
                }
                match self.ledger.mark_completed(tx.id, processor_tx_id).await? {
                    Completion::Completed { .. } => Ok(Disposition::Applied),
                    Completion::AlreadyCompleted(_) => Ok(Disposition::Duplicate),
                }
            }

            NormalizedEvent::SaleFailed { user_ref, reason } => {
                let tx = match self.referenced_transaction(source, user_ref).await? {
                    Ok(tx) => tx,
                    Err(disposition) => return Ok(disposition),
                };
                match tx.status {
                    TransactionStatus::Pending => {
                        self.ledger.mark_failed(tx.id, reason).await?;
                        if let Some(subscription_id) = tx.subscription_id() {
                            self.subscriptions.suspend(subscription_id, reason).await?;
                        }
                        Ok(Disposition::Applied)
                    }
                    TransactionStatus::Failed => Ok(Disposition::Duplicate),
                    other => {
                        warn!(
                            transaction_id = %tx.id,
                            status = %other,
                            "Sale failure reported for a settled transaction"
                        );
                        Ok(Disposition::Ignored)
                    }
                }
            }

            NormalizedEvent::RenewalSucceeded {
                subscription_id,
                amount,
                processor_tx_id,
            } => {
                let subscription = match self
                    .subscriptions
                    .find_by_processor_id(source, subscription_id)
                    .await?
                {
                    Some(subscription) => subscription,
                    None => return Ok(unknown_subscription(subscription_id)),
                };
                match self
                    .subscriptions
                    .renew(subscription.id, *amount, processor_tx_id)
                    .await?
                {
                    RenewalOutcome::Applied { .. } => Ok(Disposition::Applied),
                    RenewalOutcome::Duplicate(_) => Ok(Disposition::Duplicate),
                }
            }

            NormalizedEvent::RenewalFailed {
                subscription_id,
                reason,
            } => {
                let subscription = match self
                    .subscriptions
                    .find_by_processor_id(source, subscription_id)
                    .await?
                {
                    Some(subscription) => subscription,
                    None => return Ok(unknown_subscription(subscription_id)),
                };
                self.subscriptions.suspend(subscription.id, reason).await?;
                Ok(Disposition::Applied)
            }

            NormalizedEvent::Cancelled { subscription_id } => {
                let subscription = match self
                    .subscriptions
                    .find_by_processor_id(source, subscription_id)
                    .await?
                {
                    Some(subscription) => subscription,
                    None => return Ok(unknown_subscription(subscription_id)),
                };
                match self.subscriptions.processor_cancelled(subscription.id).await? {
                    Some(_) => Ok(Disposition::Applied),
                    None => Ok(Disposition::Duplicate),
                }
            }

            NormalizedEvent::Chargeback { processor_tx_id } => {
                let tx = match self.settled_transaction(source, processor_tx_id).await? {
                    Ok(tx) => tx,
                    Err(disposition) => return Ok(disposition),
                };
                let reversal = self.ledger.mark_chargeback(tx.id).await?;
                Ok(if reversal.newly_reversed {
                    Disposition::Applied
                } else {
                    Disposition::Duplicate
                })
            }

            NormalizedEvent::Refunded { processor_tx_id } => {
                let tx = match self.settled_transaction(source, processor_tx_id).await? {
                    Ok(tx) => tx,
                    Err(disposition) => return Ok(disposition),
                };
                let reversal = self.ledger.mark_refunded(tx.id, "processor_refund").await?;
                Ok(if reversal.newly_reversed {
                    Disposition::Applied
                } else {
                    Disposition::Duplicate
                })
            }

            NormalizedEvent::Ignored { event_type } => {
                debug!(processor = source, event_type = %event_type, "Ignoring webhook event");
                Ok(Disposition::Ignored)
            }
        }
    }

    /// Ledger transaction named by a sale's `user_ref`
    async fn referenced_transaction(
        &self,
        source: &str,
        user_ref: &str,
    ) -> ServiceResult<Result<Transaction, Disposition>> {
        let id = match Uuid::parse_str(user_ref) {
            Ok(id) => id,
            Err(_) => {
                return Ok(Err(Disposition::Rejected(format!(
                    "reference '{}' is not a ledger transaction id",
                    user_ref
                ))))
            }
        };
        match self.store.find_transaction(id).await? {
            None => Ok(Err(Disposition::Deferred(format!(
                "transaction {} not known yet",
                id
            )))),
            Some(tx) if tx.processor != source => Ok(Err(Disposition::Rejected(format!(
                "transaction {} belongs to {}, not {}",
                id, tx.processor, source
            )))),
            Some(tx) => Ok(Ok(tx)),
        }
    }

    /// Transaction a refund or chargeback refers to, once it has settled
    async fn settled_transaction(
        &self,
        source: &str,
        processor_tx_id: &str,
    ) -> ServiceResult<Result<Transaction, Disposition>> {
        match self
            .store
            .find_by_processor_reference(source, processor_tx_id)
            .await?
        {
            None => Ok(Err(Disposition::Deferred(format!(
                "processor transaction {} not known yet",
                processor_tx_id
            )))),
            Some(tx) if tx.is_pending() => Ok(Err(Disposition::Deferred(format!(
                "transaction {} is still pending",
                tx.id
            )))),
            Some(tx) => Ok(Ok(tx)),
        }
    }

    /// Claim due entries and dispatch them. Returns how many were claimed.
    pub async fn drain_due(&self, limit: usize) -> ServiceResult<usize> {
        let entries = self.inbox.claim_due(Utc::now(), self.lease, limit).await?;
        for entry in &entries {
            let disposition = self.process_entry(entry).await;
            debug!(
                event_id = %entry.event_id,
                disposition = %disposition,
                "Retried webhook"
            );
        }
        Ok(entries.len())
    }

    pub async fn stats(&self) -> ServiceResult<InboxStats> {
        Ok(self.inbox.stats().await?)
    }

    pub fn inbox(&self) -> &Arc<dyn InboxStore> {
        &self.inbox
    }
}

fn unknown_subscription(processor_subscription_id: &str) -> Disposition {
    Disposition::Deferred(format!(
        "processor subscription {} not known yet",
        processor_subscription_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_display() {
        assert_eq!(Disposition::Applied.to_string(), "applied");
        assert_eq!(
            Disposition::Deferred("transaction x not known yet".into()).to_string(),
            "deferred: transaction x not known yet"
        );
    }
}
