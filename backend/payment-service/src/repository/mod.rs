//! Persistence boundary for the ledger.
//!
//! Every method that touches more than one row is a single atomic unit in
//! each implementation: a SQL transaction for [`PgLedgerStore`], per-key locks
//! for [`MemoryLedgerStore`]. Wallet balances change only through these
//! methods.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::domain::{
    Earnings, FeeRates, NewPaymentMethod, NewTransaction, NewWithdrawal, PaymentMethod,
    PaymentMethodPatch, RevenueShare, Subscription, Transaction, TransactionKind,
    TransactionStatus, Wallet, Withdrawal, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    /// A compare-and-set on status found the row in another state
    #[error("{entity} {id} is {status}")]
    StatusConflict {
        entity: &'static str,
        id: Uuid,
        status: String,
    },

    #[error("processor transaction {processor_transaction_id} belongs to transaction {existing}")]
    ProcessorReferenceConflict {
        processor_transaction_id: String,
        existing: Uuid,
    },

    /// Unique constraint on business data (live subscription pair, etc.)
    #[error("{0}")]
    Conflict(String),

    #[error("subscription {0} version mismatch")]
    VersionConflict(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn status_conflict(entity: &'static str, id: Uuid, status: impl ToString) -> Self {
        StoreError::StatusConflict {
            entity,
            id,
            status: status.to_string(),
        }
    }
}

/// Result of `complete_transaction`
#[derive(Debug, Clone)]
pub enum Completion {
    /// This call performed the completion and credited the wallet
    Completed {
        transaction: Transaction,
        revenue_share: RevenueShare,
    },
    /// The processor transaction id was already completed (possibly on a
    /// different ledger row); nothing changed
    AlreadyCompleted(Transaction),
}

impl Completion {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Completion::Completed { transaction, .. } => transaction,
            Completion::AlreadyCompleted(transaction) => transaction,
        }
    }

    pub fn into_transaction(self) -> Transaction {
        match self {
            Completion::Completed { transaction, .. } => transaction,
            Completion::AlreadyCompleted(transaction) => transaction,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Completion::Completed { .. })
    }
}

/// Result of `reverse_transaction`
#[derive(Debug, Clone)]
pub struct Reversal {
    pub original: Transaction,
    /// Pending debit of the credited party; `None` when nothing was credited
    pub reversal: Option<Transaction>,
    /// False when the original had already been reversed
    pub newly_reversed: bool,
}

/// Filter for transaction history
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub kind: Option<TransactionKind>,
    pub offset: i64,
    pub limit: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---- transactions -------------------------------------------------

    async fn insert_transaction(&self, new: NewTransaction) -> StoreResult<Transaction>;

    async fn find_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>>;

    async fn find_by_processor_reference(
        &self,
        processor: &str,
        processor_transaction_id: &str,
    ) -> StoreResult<Option<Transaction>>;

    /// Pending → completed with fees, wallet credit and revenue share in one
    /// unit. Idempotent per processor transaction id.
    async fn complete_transaction(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
        rates: FeeRates,
    ) -> StoreResult<Completion>;

    /// Pending → failed. Repeating on a failed row returns it unchanged.
    async fn fail_transaction(&self, id: Uuid, reason: &str) -> StoreResult<Transaction>;

    /// Record the processor id on a pending row
    async fn attach_processor_reference(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
    ) -> StoreResult<Transaction>;

    /// Completed → refunded/chargeback plus a pending reversal row
    async fn reverse_transaction(
        &self,
        id: Uuid,
        target: TransactionStatus,
        reason: &str,
    ) -> StoreResult<Reversal>;

    /// Debit the reversal amount and complete the reversal row
    async fn apply_reversal(&self, reversal_id: Uuid) -> StoreResult<Transaction>;

    async fn list_pending_reversals(&self, limit: i64) -> StoreResult<Vec<Transaction>>;

    async fn list_transactions(
        &self,
        user_id: Uuid,
        query: &TransactionQuery,
    ) -> StoreResult<Vec<Transaction>>;

    async fn has_completed_unlock(&self, payer_id: Uuid, content_id: Uuid) -> StoreResult<bool>;

    async fn find_revenue_share(&self, transaction_id: Uuid) -> StoreResult<Option<RevenueShare>>;

    // ---- wallets ------------------------------------------------------

    async fn wallet(&self, user_id: Uuid) -> StoreResult<Wallet>;

    async fn earnings(&self, user_id: Uuid, since: DateTime<Utc>) -> StoreResult<Earnings>;

    // ---- subscriptions ------------------------------------------------

    /// Insert a subscription, optionally with its first pending charge.
    /// Fails with `Conflict` if the pair already has a live subscription.
    async fn create_subscription(
        &self,
        subscription: Subscription,
        initial_charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)>;

    /// Write back a modified subscription if its version is unchanged;
    /// returns the stored row with the bumped version
    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription>;

    /// Version-checked write of a restarted subscription together with the
    /// pending charge for its new period, in one unit
    async fn restart_subscription(
        &self,
        subscription: &Subscription,
        charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)>;

    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>>;

    /// Live subscription for the pair if any, otherwise the most recent one
    async fn find_subscription_for_pair(
        &self,
        fan_id: Uuid,
        creator_id: Uuid,
    ) -> StoreResult<Option<Subscription>>;

    async fn find_subscription_by_processor_id(
        &self,
        processor: &str,
        processor_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Subscriptions where the user is the fan or the creator, newest first
    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>>;

    /// Deferred cancellations whose period ended at or before `now`
    async fn list_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>>;

    // ---- withdrawals --------------------------------------------------

    /// Debit the wallet and record the withdrawal with its ledger row
    async fn open_withdrawal(&self, new: NewWithdrawal) -> StoreResult<Withdrawal>;

    /// Pending → `target`; cancelled and failed credit the amount back.
    /// Repeating the same transition returns the row unchanged.
    async fn settle_withdrawal(
        &self,
        id: Uuid,
        target: WithdrawalStatus,
        reason: Option<&str>,
    ) -> StoreResult<Withdrawal>;

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<Withdrawal>>;

    async fn list_withdrawals(
        &self,
        creator_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Withdrawal>>;

    // ---- payment methods ----------------------------------------------

    async fn insert_payment_method(&self, new: NewPaymentMethod) -> StoreResult<PaymentMethod>;

    async fn find_payment_method(&self, id: Uuid) -> StoreResult<Option<PaymentMethod>>;

    async fn list_payment_methods(&self, user_id: Uuid) -> StoreResult<Vec<PaymentMethod>>;

    async fn default_payment_method(&self, user_id: Uuid) -> StoreResult<Option<PaymentMethod>>;

    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<PaymentMethod>;

    /// Apply the owner's patch; `NotFound` for another user's method
    async fn update_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: &PaymentMethodPatch,
    ) -> StoreResult<PaymentMethod>;

    /// Remove the method from the user's list. Removing the default promotes
    /// the newest remaining method, which is returned.
    async fn delete_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<PaymentMethod>>;

    // ---- health -------------------------------------------------------

    async fn ping(&self) -> StoreResult<()>;
}
