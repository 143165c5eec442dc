/// Transaction ledger - the only path to wallet balances
///
/// Every money movement is a ledger row. Completion computes fees, credits
/// the receiving wallet and records the revenue share in one store operation,
/// so a transaction credits its wallet at most once no matter how many
/// webhook deliveries or concurrent callers race on it.
use crate::config::FeeConfig;
use crate::domain::{
    is_valid_currency, limits, Earnings, NewTransaction, Transaction, TransactionKind,
    TransactionStatus, Wallet,
};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::notifications::{self, NotificationSink, Receipt};
use crate::repository::{Completion, LedgerStore, Reversal, TransactionQuery};
use chrono::{Months, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    fees: FeeConfig,
    notifier: Arc<dyn NotificationSink>,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fees: FeeConfig,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            fees,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn fees(&self) -> &FeeConfig {
        &self.fees
    }

    /// Record a pending transaction after checking its shape
    pub async fn create_transaction(&self, new: NewTransaction) -> ServiceResult<Transaction> {
        validate_new_transaction(&new)?;

        let tx = self.store.insert_transaction(new).await?;
        metrics::record_transaction(tx.kind.as_str(), "created");
        info!(
            transaction_id = %tx.id,
            kind = %tx.kind,
            amount = tx.amount,
            processor = %tx.processor,
            "Transaction created"
        );
        Ok(tx)
    }

    /// Complete a pending transaction against a processor transaction id.
    ///
    /// Repeating the call with an id that is already completed returns
    /// `Completion::AlreadyCompleted` without touching any wallet.
    pub async fn mark_completed(
        &self,
        transaction_id: Uuid,
        processor_transaction_id: &str,
    ) -> ServiceResult<Completion> {
        let tx = self.require_transaction(transaction_id).await?;
        let rates = self.fees.rates_for(tx.kind, &tx.processor);

        let completion = self
            .store
            .complete_transaction(transaction_id, processor_transaction_id, rates)
            .await?;

        match &completion {
            Completion::Completed {
                transaction,
                revenue_share,
            } => {
                metrics::record_transaction(transaction.kind.as_str(), "completed");
                metrics::record_wallet_movement("credit", revenue_share.net_amount);
                info!(
                    transaction_id = %transaction.id,
                    processor_transaction_id = processor_transaction_id,
                    gross = transaction.amount,
                    net = revenue_share.net_amount,
                    "Transaction completed"
                );
                notifications::dispatch(
                    Arc::clone(&self.notifier),
                    Receipt::for_transaction(transaction),
                );
            }
            Completion::AlreadyCompleted(existing) => {
                info!(
                    transaction_id = %transaction_id,
                    completed_transaction_id = %existing.id,
                    processor_transaction_id = processor_transaction_id,
                    "Processor transaction already completed"
                );
            }
        }

        Ok(completion)
    }

    /// Pending → failed. No wallet effect.
    pub async fn mark_failed(&self, transaction_id: Uuid, reason: &str) -> ServiceResult<Transaction> {
        let tx = self.store.fail_transaction(transaction_id, reason).await?;
        metrics::record_transaction(tx.kind.as_str(), "failed");
        info!(transaction_id = %transaction_id, reason = reason, "Transaction failed");
        Ok(tx)
    }

    pub async fn attach_processor_reference(
        &self,
        transaction_id: Uuid,
        processor_transaction_id: &str,
    ) -> ServiceResult<Transaction> {
        Ok(self
            .store
            .attach_processor_reference(transaction_id, processor_transaction_id)
            .await?)
    }

    pub async fn mark_refunded(&self, transaction_id: Uuid, reason: &str) -> ServiceResult<Reversal> {
        self.reverse(transaction_id, TransactionStatus::Refunded, reason)
            .await
    }

    pub async fn mark_chargeback(&self, transaction_id: Uuid) -> ServiceResult<Reversal> {
        self.reverse(transaction_id, TransactionStatus::Chargeback, "chargeback")
            .await
    }

    /// Flip a completed transaction and try to debit the credited party right
    /// away. A wallet that cannot cover the debit leaves the reversal pending
    /// for the sweep worker.
    async fn reverse(
        &self,
        transaction_id: Uuid,
        target: TransactionStatus,
        reason: &str,
    ) -> ServiceResult<Reversal> {
        let mut reversal = self
            .store
            .reverse_transaction(transaction_id, target, reason)
            .await?;

        if reversal.newly_reversed {
            metrics::record_transaction(reversal.original.kind.as_str(), target.as_str());
            info!(
                transaction_id = %transaction_id,
                status = %target,
                reason = reason,
                "Transaction reversed"
            );
        }

        if let Some(pending) = reversal.reversal.clone().filter(Transaction::is_pending) {
            match self.apply_reversal(pending.id).await {
                Ok(applied) => reversal.reversal = Some(applied),
                Err(ServiceError::InsufficientBalance {
                    available,
                    requested,
                }) => {
                    warn!(
                        reversal_id = %pending.id,
                        debtor = %pending.payer_id,
                        available = available,
                        requested = requested,
                        "Reversal left pending: wallet cannot cover the debit"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(reversal)
    }

    /// Debit the credited party for a pending refund or chargeback row
    pub async fn apply_reversal(&self, reversal_id: Uuid) -> ServiceResult<Transaction> {
        let was_pending = self
            .require_transaction(reversal_id)
            .await?
            .is_pending();

        let tx = self.store.apply_reversal(reversal_id).await?;
        if was_pending {
            metrics::record_transaction(tx.kind.as_str(), "completed");
            metrics::record_wallet_movement("debit", tx.amount);
            info!(
                reversal_id = %reversal_id,
                debtor = %tx.payer_id,
                amount = tx.amount,
                "Reversal applied"
            );
        }
        Ok(tx)
    }

    /// Retry reversals parked for lack of balance. Returns how many were applied.
    pub async fn retry_pending_reversals(&self, limit: i64) -> ServiceResult<usize> {
        let mut applied = 0;
        for pending in self.store.list_pending_reversals(limit).await? {
            match self.apply_reversal(pending.id).await {
                Ok(_) => applied += 1,
                Err(ServiceError::InsufficientBalance { .. }) => {}
                Err(e) => {
                    warn!(reversal_id = %pending.id, error = %e, "Failed to apply reversal");
                }
            }
        }
        Ok(applied)
    }

    pub async fn find_transaction(&self, transaction_id: Uuid) -> ServiceResult<Option<Transaction>> {
        Ok(self.store.find_transaction(transaction_id).await?)
    }

    pub async fn require_transaction(&self, transaction_id: Uuid) -> ServiceResult<Transaction> {
        self.store
            .find_transaction(transaction_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", transaction_id)))
    }

    /// A transaction as seen by `caller`; rows the caller is not party to
    /// are reported as missing
    pub async fn get_transaction(&self, caller: Uuid, transaction_id: Uuid) -> ServiceResult<Transaction> {
        let tx = self.require_transaction(transaction_id).await?;
        if !tx.involves(caller) {
            return Err(ServiceError::NotFound(format!("transaction {}", transaction_id)));
        }
        Ok(tx)
    }

    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        kind: Option<TransactionKind>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ServiceResult<Vec<Transaction>> {
        let (offset, limit) = limits::page_window(page, limit).map_err(ServiceError::Validation)?;
        let query = TransactionQuery {
            kind,
            offset,
            limit,
        };
        Ok(self.store.list_transactions(user_id, &query).await?)
    }

    pub async fn wallet(&self, user_id: Uuid) -> ServiceResult<Wallet> {
        Ok(self.store.wallet(user_id).await?)
    }

    /// Balance plus lifetime and trailing-month net income
    pub async fn earnings(&self, user_id: Uuid) -> ServiceResult<Earnings> {
        let now = Utc::now();
        let since = now
            .checked_sub_months(Months::new(1))
            .unwrap_or(now - chrono::Duration::days(30));
        Ok(self.store.earnings(user_id, since).await?)
    }
}

/// Shape checks shared by every transaction kind
pub(crate) fn validate_new_transaction(new: &NewTransaction) -> ServiceResult<()> {
    if new.amount <= 0 {
        return Err(ServiceError::Validation(format!(
            "amount must be positive, got {}",
            new.amount
        )));
    }
    if !is_valid_currency(&new.currency) {
        return Err(ServiceError::Validation(format!(
            "invalid currency code '{}'",
            new.currency
        )));
    }
    if !new.metadata.matches_kind(new.kind) {
        return Err(ServiceError::Validation(format!(
            "metadata does not describe a {} transaction",
            new.kind
        )));
    }
    if new.kind.requires_distinct_parties() {
        match new.recipient_id {
            None => {
                return Err(ServiceError::Validation(format!(
                    "{} transactions need a recipient",
                    new.kind
                )))
            }
            Some(recipient) if recipient == new.payer_id => {
                return Err(ServiceError::Validation(format!(
                    "payer and recipient must differ for {} transactions",
                    new.kind
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransactionMetadata;

    fn tip(payer: Uuid, recipient: Option<Uuid>, amount: i64) -> NewTransaction {
        NewTransaction {
            payer_id: payer,
            recipient_id: recipient,
            kind: TransactionKind::Tip,
            amount,
            currency: "USD".into(),
            processor: "stripe".into(),
            payment_method_id: None,
            metadata: TransactionMetadata::Tip { message: None },
        }
    }

    #[test]
    fn test_rejects_non_positive_amount() {
        let err = validate_new_transaction(&tip(Uuid::new_v4(), Some(Uuid::new_v4()), 0));
        assert!(matches!(err, Err(ServiceError::Validation(_))));
    }

    #[test]
    fn test_rejects_self_payment() {
        let user = Uuid::new_v4();
        let err = validate_new_transaction(&tip(user, Some(user), 500)).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_rejects_mismatched_metadata() {
        let mut new = tip(Uuid::new_v4(), Some(Uuid::new_v4()), 500);
        new.metadata = TransactionMetadata::Deposit;
        assert!(validate_new_transaction(&new).is_err());
    }

    #[test]
    fn test_deposit_needs_no_recipient() {
        let mut new = tip(Uuid::new_v4(), None, 500);
        new.kind = TransactionKind::Deposit;
        new.metadata = TransactionMetadata::Deposit;
        assert!(validate_new_transaction(&new).is_ok());
    }
}
