/// Fan-initiated payments: tips, pay-per-view unlocks, deposits and refunds
///
/// Each payment is recorded as a pending ledger row before the processor is
/// called, so a charge whose outcome is unknown (timeout, outage) is still
/// visible and can be finalized by the processor's webhook.
use crate::directory::{ContentCatalog, UserDirectory};
use crate::domain::{
    is_valid_currency, limits, ContentKind, NewTransaction, PaymentMethod, Transaction,
    TransactionKind, TransactionMetadata, TransactionStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::processors::{ChargeOutcome, GuardedProcessor, ProcessorError, ProcessorRegistry};
use crate::repository::{LedgerStore, Reversal};
use crate::services::LedgerService;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SendTip {
    pub payer_id: Uuid,
    pub recipient_id: Uuid,
    pub amount: i64,
    pub currency: Option<String>,
    pub message: Option<String>,
    pub payment_method_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct PurchaseContent {
    pub payer_id: Uuid,
    pub content_id: Uuid,
    pub content_kind: ContentKind,
    /// Price the client displayed; must match the catalog
    pub amount: i64,
    pub payment_method_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Deposit {
    pub payer_id: Uuid,
    pub amount: i64,
    pub currency: Option<String>,
    pub processor: Option<String>,
    pub payment_method_id: Option<Uuid>,
}

pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<LedgerService>,
    processors: ProcessorRegistry,
    directory: Arc<dyn UserDirectory>,
    catalog: Arc<dyn ContentCatalog>,
    default_currency: String,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<LedgerService>,
        processors: ProcessorRegistry,
        directory: Arc<dyn UserDirectory>,
        catalog: Arc<dyn ContentCatalog>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
            processors,
            directory,
            catalog,
            default_currency: default_currency.into(),
        }
    }

    pub async fn send_tip(&self, request: SendTip) -> ServiceResult<Transaction> {
        // Checked before anything is looked up or written
        if request.payer_id == request.recipient_id {
            return Err(ServiceError::Validation("cannot tip yourself".to_string()));
        }
        limits::check_amount("tip", request.amount, &limits::TIP_AMOUNT)
            .map_err(ServiceError::Validation)?;
        let message = request
            .message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        if let Some(text) = &message {
            if text.chars().count() > limits::MAX_TIP_MESSAGE_CHARS {
                return Err(ServiceError::Validation(format!(
                    "tip message must be at most {} characters",
                    limits::MAX_TIP_MESSAGE_CHARS
                )));
            }
        }
        let currency = self.currency(request.currency)?;

        let recipient = self
            .directory
            .require_account(request.recipient_id, "recipient")
            .await?;
        if !recipient.is_active_creator() {
            return Err(ServiceError::Validation(format!(
                "user {} is not an active creator",
                request.recipient_id
            )));
        }

        let method = self
            .resolve_method(request.payer_id, request.payment_method_id)
            .await?;
        let processor = self.processor(&method.processor)?;

        let tx = self
            .ledger
            .create_transaction(NewTransaction {
                payer_id: request.payer_id,
                recipient_id: Some(request.recipient_id),
                kind: TransactionKind::Tip,
                amount: request.amount,
                currency,
                processor: method.processor.clone(),
                payment_method_id: Some(method.id),
                metadata: TransactionMetadata::Tip { message },
            })
            .await?;

        self.charge(&processor, tx, &method).await
    }

    pub async fn purchase_content(&self, request: PurchaseContent) -> ServiceResult<Transaction> {
        let listing = self
            .catalog
            .find_listing(request.content_id, request.content_kind)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "{} {}",
                    request.content_kind, request.content_id
                ))
            })?;

        if listing.owner_id == request.payer_id {
            return Err(ServiceError::Validation(
                "cannot purchase your own content".to_string(),
            ));
        }
        let price = listing.price.ok_or_else(|| {
            ServiceError::Validation(format!("{} {} is not for sale", listing.kind, listing.id))
        })?;
        if price != request.amount {
            return Err(ServiceError::Validation(format!(
                "price mismatch: content costs {}, got {}",
                limits::format_minor(price),
                limits::format_minor(request.amount)
            )));
        }
        if self
            .store
            .has_completed_unlock(request.payer_id, request.content_id)
            .await?
        {
            return Err(ServiceError::Conflict(format!(
                "{} {} is already unlocked",
                listing.kind, listing.id
            )));
        }

        let method = self
            .resolve_method(request.payer_id, request.payment_method_id)
            .await?;
        let processor = self.processor(&method.processor)?;

        let tx = self
            .ledger
            .create_transaction(NewTransaction {
                payer_id: request.payer_id,
                recipient_id: Some(listing.owner_id),
                kind: TransactionKind::PpvUnlock,
                amount: price,
                currency: listing.currency.clone(),
                processor: method.processor.clone(),
                payment_method_id: Some(method.id),
                metadata: TransactionMetadata::ContentUnlock {
                    content_id: listing.id,
                    content_kind: listing.kind,
                },
            })
            .await?;

        self.charge(&processor, tx, &method).await
    }

    /// Top up the payer's own wallet. Deposits carry no platform fee.
    pub async fn deposit(&self, request: Deposit) -> ServiceResult<Transaction> {
        limits::check_amount("deposit", request.amount, &limits::DEPOSIT_AMOUNT)
            .map_err(ServiceError::Validation)?;
        let currency = self.currency(request.currency)?;
        if let Some(name) = &request.processor {
            self.processor(name)?;
        }

        let method = self
            .resolve_method(request.payer_id, request.payment_method_id)
            .await?;
        if let Some(name) = &request.processor {
            if *name != method.processor {
                return Err(ServiceError::Validation(format!(
                    "payment method {} belongs to {}, not {}",
                    method.id, method.processor, name
                )));
            }
        }
        let processor = self.processor(&method.processor)?;

        let tx = self
            .ledger
            .create_transaction(NewTransaction {
                payer_id: request.payer_id,
                recipient_id: None,
                kind: TransactionKind::Deposit,
                amount: request.amount,
                currency,
                processor: method.processor.clone(),
                payment_method_id: Some(method.id),
                metadata: TransactionMetadata::Deposit,
            })
            .await?;

        self.charge(&processor, tx, &method).await
    }

    /// Refund a completed payment on the payer's request
    pub async fn request_refund(
        &self,
        caller: Uuid,
        transaction_id: Uuid,
        reason: &str,
    ) -> ServiceResult<Reversal> {
        let tx = self.ledger.get_transaction(caller, transaction_id).await?;
        if tx.payer_id != caller {
            return Err(ServiceError::Forbidden(
                "only the payer can request a refund".to_string(),
            ));
        }
        if !tx.kind.is_inbound() {
            return Err(ServiceError::Validation(format!(
                "{} transactions cannot be refunded",
                tx.kind
            )));
        }
        if tx.status != TransactionStatus::Completed {
            return Err(ServiceError::Validation(format!(
                "only completed transactions can be refunded, this one is {}",
                tx.status
            )));
        }
        // The window runs from settlement; a charge can sit pending for days
        let settled_at = tx.processed_at.unwrap_or(tx.created_at);
        if Utc::now() - settled_at > Duration::days(limits::REFUND_WINDOW_DAYS) {
            return Err(ServiceError::RefundWindowExpired {
                days: limits::REFUND_WINDOW_DAYS,
            });
        }

        let processor = self.processor(&tx.processor)?;
        processor.refund(&tx, reason).await?;

        let reversal = self.ledger.mark_refunded(tx.id, reason).await?;
        info!(
            transaction_id = %tx.id,
            reversal_id = ?reversal.reversal.as_ref().map(|r| r.id),
            "Refund issued"
        );
        Ok(reversal)
    }

    /// Charge a pending transaction and settle the ledger row by outcome.
    ///
    /// Declines fail the row. Timeouts and outages leave it pending: the
    /// charge may have gone through and only the webhook can tell. An open
    /// breaker means nothing was sent, so the row fails.
    async fn charge(
        &self,
        processor: &GuardedProcessor,
        tx: Transaction,
        method: &PaymentMethod,
    ) -> ServiceResult<Transaction> {
        match processor.charge(&tx, method).await {
            Ok(ChargeOutcome::Succeeded {
                processor_transaction_id,
            }) => Ok(self
                .ledger
                .mark_completed(tx.id, &processor_transaction_id)
                .await?
                .into_transaction()),
            Ok(ChargeOutcome::Pending {
                processor_transaction_id,
            }) => {
                info!(
                    transaction_id = %tx.id,
                    processor_transaction_id = %processor_transaction_id,
                    "Charge accepted; awaiting processor confirmation"
                );
                self.ledger
                    .attach_processor_reference(tx.id, &processor_transaction_id)
                    .await
            }
            Err(e @ (ProcessorError::Timeout(_) | ProcessorError::Unavailable(_))) => {
                warn!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Charge outcome unknown; transaction left pending"
                );
                Ok(tx)
            }
            Err(e) => {
                self.ledger.mark_failed(tx.id, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// The given method (must belong to the payer) or the payer's default
    async fn resolve_method(
        &self,
        payer_id: Uuid,
        method_id: Option<Uuid>,
    ) -> ServiceResult<PaymentMethod> {
        match method_id {
            Some(id) => match self.store.find_payment_method(id).await? {
                Some(method) if method.user_id == payer_id => Ok(method),
                _ => Err(ServiceError::NotFound(format!("payment method {}", id))),
            },
            None => self
                .store
                .default_payment_method(payer_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::Validation("no default payment method on file".to_string())
                }),
        }
    }

    fn processor(&self, name: &str) -> ServiceResult<Arc<GuardedProcessor>> {
        self.processors
            .get(name)
            .ok_or_else(|| ServiceError::UnknownProcessor(name.to_string()))
    }

    fn currency(&self, requested: Option<String>) -> ServiceResult<String> {
        let currency = requested.unwrap_or_else(|| self.default_currency.clone());
        if !is_valid_currency(&currency) {
            return Err(ServiceError::Validation(format!(
                "invalid currency code '{}'",
                currency
            )));
        }
        Ok(currency)
    }
}
