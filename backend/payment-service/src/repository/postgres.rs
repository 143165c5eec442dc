//! PostgreSQL ledger store.
//!
//! Status changes are compare-and-set updates guarded by `status = 'pending'`
//! on rows locked with `FOR UPDATE`; the unique `(processor,
//! processor_transaction_id)` constraint backs processor-side idempotency.

use super::{Completion, LedgerStore, Reversal, StoreError, StoreResult, TransactionQuery};
use crate::domain::{
    BillingCycle, Earnings, EarningsByKind, FeeRates, NewPaymentMethod, NewTransaction,
    NewWithdrawal, PaymentMethod, PaymentMethodKind, PaymentMethodPatch, RevenueShare,
    RevenueShareCalculator, Subscription, SubscriptionStatus, Transaction, TransactionKind,
    TransactionMetadata, TransactionStatus, Wallet, Withdrawal, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

const TX_COLUMNS: &str = "id, payer_id, recipient_id, kind, amount, currency, status, processor, \
     processor_transaction_id, payment_method_id, platform_fee_amount, processor_fee_amount, \
     net_amount, metadata, related_transaction_id, failure_reason, created_at, processed_at";

const SUB_COLUMNS: &str = "id, fan_id, creator_id, price, currency, billing_cycle, status, \
     current_period_start, current_period_end, trial_end, auto_renew, processor, \
     processor_subscription_id, payment_method_id, last_renewal_id, version, created_at, updated_at, \
     cancelled_at";

const WITHDRAWAL_COLUMNS: &str = "id, creator_id, amount, fee_amount, net_amount, currency, status, \
     payment_method_id, transaction_id, failure_reason, created_at, updated_at";

const METHOD_COLUMNS: &str = "id, user_id, processor, kind, processor_reference, last_four, brand, \
     is_default, is_verified, expires_at, billing_address, created_at";

const EARNING_KINDS: &str = "('subscription', 'tip', 'ppv_unlock')";

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    payer_id: Uuid,
    recipient_id: Option<Uuid>,
    kind: String,
    amount: i64,
    currency: String,
    status: String,
    processor: String,
    processor_transaction_id: Option<String>,
    payment_method_id: Option<Uuid>,
    platform_fee_amount: i64,
    processor_fee_amount: i64,
    net_amount: Option<i64>,
    metadata: Json<TransactionMetadata>,
    related_transaction_id: Option<Uuid>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            payer_id: row.payer_id,
            recipient_id: row.recipient_id,
            kind: row.kind.parse().map_err(corrupt)?,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse().map_err(corrupt)?,
            processor: row.processor,
            processor_transaction_id: row.processor_transaction_id,
            payment_method_id: row.payment_method_id,
            platform_fee_amount: row.platform_fee_amount,
            processor_fee_amount: row.processor_fee_amount,
            net_amount: row.net_amount,
            metadata: row.metadata.0,
            related_transaction_id: row.related_transaction_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    fan_id: Uuid,
    creator_id: Uuid,
    price: i64,
    currency: String,
    billing_cycle: String,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_end: Option<DateTime<Utc>>,
    auto_renew: bool,
    processor: String,
    processor_subscription_id: Option<String>,
    payment_method_id: Option<Uuid>,
    last_renewal_id: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            fan_id: row.fan_id,
            creator_id: row.creator_id,
            price: row.price,
            currency: row.currency,
            billing_cycle: row.billing_cycle.parse::<BillingCycle>().map_err(corrupt)?,
            status: row.status.parse::<SubscriptionStatus>().map_err(corrupt)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_end: row.trial_end,
            auto_renew: row.auto_renew,
            processor: row.processor,
            processor_subscription_id: row.processor_subscription_id,
            payment_method_id: row.payment_method_id,
            last_renewal_id: row.last_renewal_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WithdrawalRow {
    id: Uuid,
    creator_id: Uuid,
    amount: i64,
    fee_amount: i64,
    net_amount: i64,
    currency: String,
    status: String,
    payment_method_id: Uuid,
    transaction_id: Uuid,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = StoreError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        Ok(Withdrawal {
            id: row.id,
            creator_id: row.creator_id,
            amount: row.amount,
            fee_amount: row.fee_amount,
            net_amount: row.net_amount,
            currency: row.currency,
            status: row.status.parse::<WithdrawalStatus>().map_err(corrupt)?,
            payment_method_id: row.payment_method_id,
            transaction_id: row.transaction_id,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    user_id: Uuid,
    processor: String,
    kind: String,
    processor_reference: String,
    last_four: Option<String>,
    brand: Option<String>,
    is_default: bool,
    is_verified: bool,
    expires_at: Option<DateTime<Utc>>,
    billing_address: Option<Json<serde_json::Value>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentMethodRow> for PaymentMethod {
    type Error = StoreError;

    fn try_from(row: PaymentMethodRow) -> Result<Self, Self::Error> {
        Ok(PaymentMethod {
            id: row.id,
            user_id: row.user_id,
            processor: row.processor,
            kind: row.kind.parse::<PaymentMethodKind>().map_err(corrupt)?,
            processor_reference: row.processor_reference,
            last_four: row.last_four,
            brand: row.brand,
            is_default: row.is_default,
            is_verified: row.is_verified,
            expires_at: row.expires_at,
            billing_address: row.billing_address.map(|address| address.0),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RevenueShareRow {
    id: Uuid,
    creator_id: Uuid,
    transaction_id: Uuid,
    gross_amount: i64,
    platform_fee_rate_bps: i32,
    platform_fee_amount: i64,
    processor_fee_rate_bps: i32,
    processor_fee_amount: i64,
    net_amount: i64,
    created_at: DateTime<Utc>,
}

impl From<RevenueShareRow> for RevenueShare {
    fn from(row: RevenueShareRow) -> Self {
        RevenueShare {
            id: row.id,
            creator_id: row.creator_id,
            transaction_id: row.transaction_id,
            gross_amount: row.gross_amount,
            platform_fee_rate_bps: row.platform_fee_rate_bps.max(0) as u32,
            platform_fee_amount: row.platform_fee_amount,
            processor_fee_rate_bps: row.processor_fee_rate_bps.max(0) as u32,
            processor_fee_amount: row.processor_fee_amount,
            net_amount: row.net_amount,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct EarningsRow {
    kind: String,
    net: i64,
    monthly: i64,
    count: i64,
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

fn conflict_on_unique(message: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |err| {
        if is_unique_violation(&err) {
            StoreError::Conflict(message.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_transaction(conn: &mut PgConnection, id: Uuid) -> StoreResult<Transaction> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1 FOR UPDATE", TX_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))?
            .try_into()
    }

    async fn insert_transaction_row(conn: &mut PgConnection, tx: &Transaction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, payer_id, recipient_id, kind, amount, currency, status, processor,
                processor_transaction_id, payment_method_id, platform_fee_amount,
                processor_fee_amount, net_amount, metadata, related_transaction_id,
                failure_reason, created_at, processed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(tx.id)
        .bind(tx.payer_id)
        .bind(tx.recipient_id)
        .bind(tx.kind.as_str())
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(&tx.processor)
        .bind(&tx.processor_transaction_id)
        .bind(tx.payment_method_id)
        .bind(tx.platform_fee_amount)
        .bind(tx.processor_fee_amount)
        .bind(tx.net_amount)
        .bind(Json(&tx.metadata))
        .bind(tx.related_transaction_id)
        .bind(&tx.failure_reason)
        .bind(tx.created_at)
        .bind(tx.processed_at)
        .execute(conn)
        .await
        .map_err(conflict_on_unique("transaction reversal already exists"))?;
        Ok(())
    }

    async fn credit_wallet(conn: &mut PgConnection, user_id: Uuid, amount: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET balance = wallets.balance + EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Guarded debit; the balance is untouched when it would go negative
    async fn debit_wallet(conn: &mut PgConnection, user_id: Uuid, amount: i64) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE wallets SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT balance FROM wallets WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            return Err(StoreError::InsufficientBalance {
                available: available.unwrap_or(0),
                requested: amount,
            });
        }
        Ok(())
    }

    /// Version-checked write; `None` when the version moved or the row is gone
    async fn write_subscription(
        conn: &mut PgConnection,
        subscription: &Subscription,
    ) -> StoreResult<Option<Subscription>> {
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET price = $3, currency = $4, billing_cycle = $5, status = $6,
                current_period_start = $7, current_period_end = $8, trial_end = $9,
                auto_renew = $10, processor = $11, processor_subscription_id = $12,
                payment_method_id = $13, cancelled_at = $14, last_renewal_id = $15,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SUB_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(subscription.id)
            .bind(subscription.version)
            .bind(subscription.price)
            .bind(&subscription.currency)
            .bind(subscription.billing_cycle.as_str())
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.trial_end)
            .bind(subscription.auto_renew)
            .bind(&subscription.processor)
            .bind(&subscription.processor_subscription_id)
            .bind(subscription.payment_method_id)
            .bind(subscription.cancelled_at)
            .bind(subscription.last_renewal_id)
            .fetch_optional(conn)
            .await
            .map_err(conflict_on_unique(
                "subscription conflicts with an existing subscription",
            ))?
            .map(Subscription::try_from)
            .transpose()
    }

    /// Why a version-checked write matched no row
    async fn missed_write(&self, id: Uuid) -> StoreError {
        match self.find_subscription(id).await {
            Ok(Some(_)) => StoreError::VersionConflict(id),
            Ok(None) => StoreError::NotFound(format!("subscription {}", id)),
            Err(e) => e,
        }
    }

    async fn find_reversal_of(conn: &mut PgConnection, original_id: Uuid) -> StoreResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE related_transaction_id = $1 AND kind IN ('refund', 'chargeback')",
            TX_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(original_id)
            .fetch_optional(conn)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_transaction(&self, new: NewTransaction) -> StoreResult<Transaction> {
        let tx = new.into_pending(Utc::now());
        let mut conn = self.pool.acquire().await?;
        Self::insert_transaction_row(&mut conn, &tx).await?;
        Ok(tx)
    }

    async fn find_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE id = $1", TX_COLUMNS);
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_by_processor_reference(
        &self,
        processor: &str,
        processor_transaction_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE processor = $1 AND processor_transaction_id = $2",
            TX_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(processor)
            .bind(processor_transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn complete_transaction(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
        rates: FeeRates,
    ) -> StoreResult<Completion> {
        let mut db = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut db, id).await?;

        let sql = format!(
            "SELECT {} FROM transactions WHERE processor = $1 AND processor_transaction_id = $2 AND id <> $3",
            TX_COLUMNS
        );
        let owner = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&tx.processor)
            .bind(processor_transaction_id)
            .bind(id)
            .fetch_optional(&mut *db)
            .await?;
        if let Some(owner) = owner {
            let owner = Transaction::try_from(owner)?;
            db.rollback().await?;
            if owner.status == TransactionStatus::Completed && owner.amount == tx.amount {
                return Ok(Completion::AlreadyCompleted(owner));
            }
            return Err(StoreError::ProcessorReferenceConflict {
                processor_transaction_id: processor_transaction_id.to_string(),
                existing: owner.id,
            });
        }

        match tx.status {
            TransactionStatus::Pending => {}
            TransactionStatus::Completed
                if tx.processor_transaction_id.as_deref() == Some(processor_transaction_id) =>
            {
                db.rollback().await?;
                return Ok(Completion::AlreadyCompleted(tx));
            }
            other => return Err(StoreError::status_conflict("transaction", id, other)),
        }
        if !tx.kind.is_inbound() {
            return Err(StoreError::Conflict(format!(
                "{} transactions are not completed by processor confirmation",
                tx.kind
            )));
        }
        if let Some(bound) = tx.processor_transaction_id.as_deref() {
            if bound != processor_transaction_id {
                return Err(StoreError::status_conflict(
                    "transaction",
                    id,
                    format!("bound to processor transaction {}", bound),
                ));
            }
        }
        let credited = tx.credited_party().ok_or_else(|| {
            StoreError::Corrupt(format!("transaction {} has no party to credit", id))
        })?;

        let split = RevenueShareCalculator::compute(tx.amount, rates);
        let sql = format!(
            r#"
            UPDATE transactions
            SET status = 'completed', processor_transaction_id = $2, platform_fee_amount = $3,
                processor_fee_amount = $4, net_amount = $5, processed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            TX_COLUMNS
        );
        let updated = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(processor_transaction_id)
            .bind(split.platform_fee)
            .bind(split.processor_fee)
            .bind(split.net)
            .fetch_optional(&mut *db)
            .await;

        let updated = match updated {
            Ok(Some(row)) => Transaction::try_from(row)?,
            Ok(None) => return Err(StoreError::status_conflict("transaction", id, "not pending")),
            Err(e) if is_unique_violation(&e) => {
                // A concurrent completion claimed the reference and committed
                db.rollback().await?;
                let owner = self
                    .find_by_processor_reference(&tx.processor, processor_transaction_id)
                    .await?;
                return match owner {
                    Some(owner)
                        if owner.status == TransactionStatus::Completed
                            && owner.amount == tx.amount =>
                    {
                        Ok(Completion::AlreadyCompleted(owner))
                    }
                    owner => Err(StoreError::ProcessorReferenceConflict {
                        processor_transaction_id: processor_transaction_id.to_string(),
                        existing: owner.map(|t| t.id).unwrap_or_default(),
                    }),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if split.net > 0 {
            Self::credit_wallet(&mut db, credited, split.net).await?;
        }

        let share = RevenueShare::from_breakdown(credited, id, rates, &split, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO revenue_shares (
                id, creator_id, transaction_id, gross_amount, platform_fee_rate_bps,
                platform_fee_amount, processor_fee_rate_bps, processor_fee_amount, net_amount, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(share.id)
        .bind(share.creator_id)
        .bind(share.transaction_id)
        .bind(share.gross_amount)
        .bind(share.platform_fee_rate_bps as i32)
        .bind(share.platform_fee_amount)
        .bind(share.processor_fee_rate_bps as i32)
        .bind(share.processor_fee_amount)
        .bind(share.net_amount)
        .bind(share.created_at)
        .execute(&mut *db)
        .await?;

        db.commit().await?;
        debug!(transaction_id = %id, net = split.net, "Transaction completed");

        Ok(Completion::Completed {
            transaction: updated,
            revenue_share: share,
        })
    }

    async fn fail_transaction(&self, id: Uuid, reason: &str) -> StoreResult<Transaction> {
        let mut db = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut db, id).await?;
        match tx.status {
            TransactionStatus::Failed => {
                db.rollback().await?;
                return Ok(tx);
            }
            TransactionStatus::Pending => {}
            other => return Err(StoreError::status_conflict("transaction", id, other)),
        }

        let sql = format!(
            r#"
            UPDATE transactions
            SET status = 'failed', failure_reason = $2, processed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            TX_COLUMNS
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(reason)
            .fetch_one(&mut *db)
            .await?;
        db.commit().await?;
        row.try_into()
    }

    async fn attach_processor_reference(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
    ) -> StoreResult<Transaction> {
        let mut db = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut db, id).await?;
        if tx.status != TransactionStatus::Pending {
            return Err(StoreError::status_conflict("transaction", id, tx.status));
        }
        match tx.processor_transaction_id.as_deref() {
            Some(bound) if bound == processor_transaction_id => {
                db.rollback().await?;
                return Ok(tx);
            }
            Some(bound) => {
                return Err(StoreError::status_conflict(
                    "transaction",
                    id,
                    format!("bound to processor transaction {}", bound),
                ))
            }
            None => {}
        }

        let sql = format!(
            "UPDATE transactions SET processor_transaction_id = $2 WHERE id = $1 RETURNING {}",
            TX_COLUMNS
        );
        let result = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .bind(processor_transaction_id)
            .fetch_one(&mut *db)
            .await;
        match result {
            Ok(row) => {
                db.commit().await?;
                row.try_into()
            }
            Err(e) if is_unique_violation(&e) => {
                db.rollback().await?;
                let existing = self
                    .find_by_processor_reference(&tx.processor, processor_transaction_id)
                    .await?
                    .map(|t| t.id)
                    .unwrap_or_default();
                Err(StoreError::ProcessorReferenceConflict {
                    processor_transaction_id: processor_transaction_id.to_string(),
                    existing,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reverse_transaction(
        &self,
        id: Uuid,
        target: TransactionStatus,
        reason: &str,
    ) -> StoreResult<Reversal> {
        let kind = match target {
            TransactionStatus::Refunded => TransactionKind::Refund,
            TransactionStatus::Chargeback => TransactionKind::Chargeback,
            other => {
                return Err(StoreError::Conflict(format!(
                    "{} is not a reversal status",
                    other
                )))
            }
        };

        let mut db = self.pool.begin().await?;
        let mut original = Self::lock_transaction(&mut db, id).await?;
        match original.status {
            TransactionStatus::Completed => {}
            TransactionStatus::Refunded | TransactionStatus::Chargeback => {
                let reversal = Self::find_reversal_of(&mut db, id).await?;
                db.rollback().await?;
                return Ok(Reversal {
                    original,
                    reversal,
                    newly_reversed: false,
                });
            }
            other => return Err(StoreError::status_conflict("transaction", id, other)),
        }

        let amount = original.net_amount.unwrap_or(0);
        let reversal = match original.credited_party() {
            Some(debtor) if amount > 0 => {
                let row = NewTransaction {
                    payer_id: debtor,
                    recipient_id: None,
                    kind,
                    amount,
                    currency: original.currency.clone(),
                    processor: original.processor.clone(),
                    payment_method_id: None,
                    metadata: TransactionMetadata::Reversal {
                        original_transaction_id: id,
                        reason: reason.to_string(),
                    },
                }
                .into_pending(Utc::now());
                Self::insert_transaction_row(&mut db, &row).await?;
                Some(row)
            }
            _ => None,
        };

        sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1 AND status = 'completed'")
            .bind(id)
            .bind(target.as_str())
            .execute(&mut *db)
            .await?;
        db.commit().await?;

        original.status = target;
        Ok(Reversal {
            original,
            reversal,
            newly_reversed: true,
        })
    }

    async fn apply_reversal(&self, reversal_id: Uuid) -> StoreResult<Transaction> {
        let mut db = self.pool.begin().await?;
        let tx = Self::lock_transaction(&mut db, reversal_id).await?;
        if !tx.kind.is_reversal() {
            return Err(StoreError::Conflict(format!(
                "transaction {} is not a reversal",
                reversal_id
            )));
        }
        match tx.status {
            TransactionStatus::Completed => {
                db.rollback().await?;
                return Ok(tx);
            }
            TransactionStatus::Pending => {}
            other => return Err(StoreError::status_conflict("transaction", reversal_id, other)),
        }

        // Dropping `db` on error rolls back
        Self::debit_wallet(&mut db, tx.payer_id, tx.amount).await?;

        let sql = format!(
            r#"
            UPDATE transactions
            SET status = 'completed', net_amount = amount, processed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            TX_COLUMNS
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(reversal_id)
            .fetch_one(&mut *db)
            .await?;
        db.commit().await?;
        row.try_into()
    }

    async fn list_pending_reversals(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions
            WHERE kind IN ('refund', 'chargeback') AND status = 'pending'
            ORDER BY created_at
            LIMIT $1
            "#,
            TX_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        query: &TransactionQuery,
    ) -> StoreResult<Vec<Transaction>> {
        let sql = format!(
            r#"
            SELECT {} FROM transactions
            WHERE (payer_id = $1 OR recipient_id = $1)
              AND ($2::TEXT IS NULL OR kind = $2)
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            "#,
            TX_COLUMNS
        );
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(user_id)
            .bind(query.kind.map(|k| k.as_str()))
            .bind(query.offset)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Transaction::try_from)
            .collect()
    }

    async fn has_completed_unlock(&self, payer_id: Uuid, content_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM transactions
                WHERE payer_id = $1 AND kind = 'ppv_unlock' AND status = 'completed'
                  AND metadata->>'content_id' = $2
            )
            "#,
        )
        .bind(payer_id)
        .bind(content_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_revenue_share(&self, transaction_id: Uuid) -> StoreResult<Option<RevenueShare>> {
        let row = sqlx::query_as::<_, RevenueShareRow>(
            r#"
            SELECT id, creator_id, transaction_id, gross_amount, platform_fee_rate_bps,
                   platform_fee_amount, processor_fee_rate_bps, processor_fee_amount,
                   net_amount, created_at
            FROM revenue_shares WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RevenueShare::from))
    }

    async fn wallet(&self, user_id: Uuid) -> StoreResult<Wallet> {
        let row: Option<(i64, DateTime<Utc>)> =
            sqlx::query_as("SELECT balance, updated_at FROM wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match row {
            Some((balance, updated_at)) => Wallet {
                user_id,
                balance,
                updated_at,
            },
            None => Wallet::empty(user_id),
        })
    }

    async fn earnings(&self, user_id: Uuid, since: DateTime<Utc>) -> StoreResult<Earnings> {
        let sql = format!(
            r#"
            SELECT t.kind,
                   COALESCE(SUM(r.net_amount), 0)::BIGINT AS net,
                   COALESCE(SUM(r.net_amount) FILTER (WHERE r.created_at >= $2), 0)::BIGINT AS monthly,
                   COUNT(*) AS count
            FROM revenue_shares r
            JOIN transactions t ON t.id = r.transaction_id
            WHERE r.creator_id = $1 AND t.kind IN {}
            GROUP BY t.kind
            ORDER BY t.kind
            "#,
            EARNING_KINDS
        );
        let rows = sqlx::query_as::<_, EarningsRow>(&sql)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        let sql = format!(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT FROM transactions
            WHERE recipient_id = $1 AND status = 'pending' AND kind IN {}
            "#,
            EARNING_KINDS
        );
        let pending_gross: i64 = sqlx::query_scalar(&sql)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        let mut earnings = Earnings {
            user_id,
            balance: self.wallet(user_id).await?.balance,
            pending_gross,
            ..Default::default()
        };
        for row in rows {
            earnings.lifetime_net += row.net;
            earnings.monthly_net += row.monthly;
            earnings.breakdown.push(EarningsByKind {
                kind: row.kind.parse().map_err(corrupt)?,
                net: row.net,
                count: row.count,
            });
        }
        Ok(earnings)
    }

    async fn create_subscription(
        &self,
        subscription: Subscription,
        initial_charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)> {
        let mut db = self.pool.begin().await?;
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                id, fan_id, creator_id, price, currency, billing_cycle, status,
                current_period_start, current_period_end, trial_end, auto_renew, processor,
                processor_subscription_id, payment_method_id, last_renewal_id, version,
                created_at, updated_at, cancelled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING {}
            "#,
            SUB_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(subscription.id)
            .bind(subscription.fan_id)
            .bind(subscription.creator_id)
            .bind(subscription.price)
            .bind(&subscription.currency)
            .bind(subscription.billing_cycle.as_str())
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.trial_end)
            .bind(subscription.auto_renew)
            .bind(&subscription.processor)
            .bind(&subscription.processor_subscription_id)
            .bind(subscription.payment_method_id)
            .bind(subscription.last_renewal_id)
            .bind(subscription.version)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .bind(subscription.cancelled_at)
            .fetch_one(&mut *db)
            .await
            .map_err(conflict_on_unique(
                "fan already has a live subscription to this creator",
            ))?;

        let charge = match initial_charge {
            Some(new) => {
                let tx = new.into_pending(Utc::now());
                Self::insert_transaction_row(&mut db, &tx).await?;
                Some(tx)
            }
            None => None,
        };
        db.commit().await?;

        Ok((row.try_into()?, charge))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        let mut conn = self.pool.acquire().await?;
        match Self::write_subscription(&mut conn, subscription).await? {
            Some(updated) => Ok(updated),
            None => Err(self.missed_write(subscription.id).await),
        }
    }

    async fn restart_subscription(
        &self,
        subscription: &Subscription,
        charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)> {
        let mut db = self.pool.begin().await?;
        let updated = match Self::write_subscription(&mut db, subscription).await? {
            Some(updated) => updated,
            None => {
                db.rollback().await?;
                return Err(self.missed_write(subscription.id).await);
            }
        };

        let charge = match charge {
            Some(new) => {
                let tx = new.into_pending(Utc::now());
                Self::insert_transaction_row(&mut db, &tx).await?;
                Some(tx)
            }
            None => None,
        };
        db.commit().await?;

        debug!(subscription_id = %updated.id, version = updated.version, "Subscription restarted");
        Ok((updated, charge))
    }

    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = $1", SUB_COLUMNS);
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_subscription_for_pair(
        &self,
        fan_id: Uuid,
        creator_id: Uuid,
    ) -> StoreResult<Option<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE fan_id = $1 AND creator_id = $2
            ORDER BY (status <> 'cancelled') DESC, updated_at DESC
            LIMIT 1
            "#,
            SUB_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(fan_id)
            .bind(creator_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn find_subscription_by_processor_id(
        &self,
        processor: &str,
        processor_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE processor = $1 AND processor_subscription_id = $2",
            SUB_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(processor)
            .bind(processor_subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE fan_id = $1 OR creator_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
            SUB_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Subscription::try_from)
            .collect()
    }

    async fn list_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status <> 'cancelled' AND NOT auto_renew AND current_period_end <= $1
            ORDER BY current_period_end
            LIMIT $2
            "#,
            SUB_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Subscription::try_from)
            .collect()
    }

    async fn open_withdrawal(&self, new: NewWithdrawal) -> StoreResult<Withdrawal> {
        let mut db = self.pool.begin().await?;
        Self::debit_wallet(&mut db, new.creator_id, new.amount).await?;

        let withdrawal_id = Uuid::new_v4();
        let ledger_row = NewTransaction {
            payer_id: new.creator_id,
            recipient_id: None,
            kind: TransactionKind::Withdrawal,
            amount: new.amount,
            currency: new.currency.clone(),
            processor: new.processor.clone(),
            payment_method_id: Some(new.payment_method_id),
            metadata: TransactionMetadata::Withdrawal { withdrawal_id },
        }
        .into_pending(Utc::now());
        Self::insert_transaction_row(&mut db, &ledger_row).await?;

        let sql = format!(
            r#"
            INSERT INTO withdrawals (
                id, creator_id, amount, fee_amount, net_amount, currency, status,
                payment_method_id, transaction_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, NOW(), NOW())
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(withdrawal_id)
            .bind(new.creator_id)
            .bind(new.amount)
            .bind(new.fee_amount)
            .bind(new.amount - new.fee_amount)
            .bind(&new.currency)
            .bind(new.payment_method_id)
            .bind(ledger_row.id)
            .fetch_one(&mut *db)
            .await?;
        db.commit().await?;
        row.try_into()
    }

    async fn settle_withdrawal(
        &self,
        id: Uuid,
        target: WithdrawalStatus,
        reason: Option<&str>,
    ) -> StoreResult<Withdrawal> {
        if target == WithdrawalStatus::Pending {
            return Err(StoreError::Conflict(
                "withdrawals cannot be moved back to pending".to_string(),
            ));
        }

        let mut db = self.pool.begin().await?;
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE id = $1 FOR UPDATE",
            WITHDRAWAL_COLUMNS
        );
        let withdrawal: Withdrawal = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal {}", id)))?
            .try_into()?;

        if withdrawal.status == target {
            db.rollback().await?;
            return Ok(withdrawal);
        }
        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(StoreError::status_conflict("withdrawal", id, withdrawal.status));
        }

        if target.credits_back() {
            Self::credit_wallet(&mut db, withdrawal.creator_id, withdrawal.amount).await?;
            sqlx::query(
                r#"
                UPDATE transactions
                SET status = 'failed', failure_reason = $2, processed_at = NOW()
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(withdrawal.transaction_id)
            .bind(reason.unwrap_or(target.as_str()))
            .execute(&mut *db)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE transactions
                SET status = 'completed', platform_fee_amount = $2, net_amount = $3, processed_at = NOW()
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(withdrawal.transaction_id)
            .bind(withdrawal.fee_amount)
            .bind(withdrawal.net_amount)
            .execute(&mut *db)
            .await?;
        }

        let sql = format!(
            r#"
            UPDATE withdrawals SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(id)
            .bind(target.as_str())
            .bind(reason)
            .fetch_one(&mut *db)
            .await?;
        db.commit().await?;
        row.try_into()
    }

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<Withdrawal>> {
        let sql = format!("SELECT {} FROM withdrawals WHERE id = $1", WITHDRAWAL_COLUMNS);
        sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Withdrawal::try_from)
            .transpose()
    }

    async fn list_withdrawals(
        &self,
        creator_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Withdrawal>> {
        let sql = format!(
            r#"
            SELECT {} FROM withdrawals
            WHERE creator_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
            WITHDRAWAL_COLUMNS
        );
        sqlx::query_as::<_, WithdrawalRow>(&sql)
            .bind(creator_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Withdrawal::try_from)
            .collect()
    }

    async fn insert_payment_method(&self, new: NewPaymentMethod) -> StoreResult<PaymentMethod> {
        let mut db = self.pool.begin().await?;
        let has_any: bool =
            sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM payment_methods WHERE user_id = $1 AND deleted_at IS NULL)",
            )
                .bind(new.user_id)
                .fetch_one(&mut *db)
                .await?;

        let mut method = new.into_method(Utc::now());
        method.is_default = method.is_default || !has_any;
        if method.is_default {
            sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE user_id = $1")
                .bind(method.user_id)
                .execute(&mut *db)
                .await?;
        }

        let sql = format!(
            r#"
            INSERT INTO payment_methods (
                id, user_id, processor, kind, processor_reference, last_four, brand,
                is_default, is_verified, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            METHOD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(method.id)
            .bind(method.user_id)
            .bind(&method.processor)
            .bind(method.kind.as_str())
            .bind(&method.processor_reference)
            .bind(&method.last_four)
            .bind(&method.brand)
            .bind(method.is_default)
            .bind(method.is_verified)
            .bind(method.created_at)
            .fetch_one(&mut *db)
            .await
            .map_err(conflict_on_unique("payment method is already attached"))?;
        db.commit().await?;
        row.try_into()
    }

    async fn find_payment_method(&self, id: Uuid) -> StoreResult<Option<PaymentMethod>> {
        let sql = format!("SELECT {} FROM payment_methods WHERE id = $1 AND deleted_at IS NULL",
            METHOD_COLUMNS);
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentMethod::try_from)
            .transpose()
    }

    async fn list_payment_methods(&self, user_id: Uuid) -> StoreResult<Vec<PaymentMethod>> {
        let sql = format!(
            "SELECT {} FROM payment_methods WHERE user_id = $1 AND deleted_at IS NULL \
             ORDER BY is_default DESC, created_at DESC",
            METHOD_COLUMNS
        );
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(PaymentMethod::try_from)
            .collect()
    }

    async fn default_payment_method(&self, user_id: Uuid) -> StoreResult<Option<PaymentMethod>> {
        let sql = format!(
            "SELECT {} FROM payment_methods WHERE user_id = $1 AND is_default",
            METHOD_COLUMNS
        );
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(PaymentMethod::try_from)
            .transpose()
    }

    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<PaymentMethod> {
        let mut db = self.pool.begin().await?;
        let owned: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM payment_methods WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL)",
        )
        .bind(id)
        .bind(user_id)
        .fetch_one(&mut *db)
        .await?;
        if !owned {
            return Err(StoreError::NotFound(format!("payment method {}", id)));
        }

        // Clear first so the partial unique index never sees two defaults
        sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE user_id = $1 AND id <> $2")
            .bind(user_id)
            .bind(id)
            .execute(&mut *db)
            .await?;
        let sql = format!(
            "UPDATE payment_methods SET is_default = TRUE WHERE id = $1 RETURNING {}",
            METHOD_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(id)
            .fetch_one(&mut *db)
            .await?;
        db.commit().await?;
        row.try_into()
    }

    async fn update_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: &PaymentMethodPatch,
    ) -> StoreResult<PaymentMethod> {
        let sql = format!(
            r#"
            UPDATE payment_methods
            SET expires_at = COALESCE($3, expires_at),
                billing_address = COALESCE($4, billing_address),
                is_verified = COALESCE($5, is_verified)
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            RETURNING {}
            "#,
            METHOD_COLUMNS
        );
        sqlx::query_as::<_, PaymentMethodRow>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(patch.expires_at)
            .bind(patch.billing_address.as_ref().map(Json))
            .bind(patch.is_verified)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment method {}", id)))?
            .try_into()
    }

    async fn delete_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<PaymentMethod>> {
        let mut db = self.pool.begin().await?;
        let was_default: bool = sqlx::query_scalar(
            r#"
            SELECT is_default FROM payment_methods
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("payment method {}", id)))?;

        // Soft delete: past transactions and subscriptions still reference the row
        sqlx::query("UPDATE payment_methods SET deleted_at = NOW(), is_default = FALSE WHERE id = $1")
            .bind(id)
            .execute(&mut *db)
            .await?;

        let promoted = if was_default {
            let sql = format!(
                r#"
                UPDATE payment_methods SET is_default = TRUE
                WHERE id = (
                    SELECT id FROM payment_methods
                    WHERE user_id = $1 AND deleted_at IS NULL
                    ORDER BY created_at DESC
                    LIMIT 1
                )
                RETURNING {}
                "#,
                METHOD_COLUMNS
            );
            sqlx::query_as::<_, PaymentMethodRow>(&sql)
                .bind(user_id)
                .fetch_optional(&mut *db)
                .await?
                .map(PaymentMethod::try_from)
                .transpose()?
        } else {
            None
        };
        db.commit().await?;
        Ok(promoted)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
