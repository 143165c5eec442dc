//! In-process ledger store for tests and local development.
//!
//! Transactions and withdrawals each sit behind their own mutex; wallets are
//! serialized by their `DashMap` entry. Lock order is withdrawal, then
//! transaction, then wallet, and no map guard is held while a row mutex is
//! acquired.

use super::{
    Completion, LedgerStore, Reversal, StoreError, StoreResult, TransactionQuery,
};
use crate::domain::{
    Earnings, EarningsByKind, FeeRates, NewPaymentMethod, NewTransaction, NewWithdrawal,
    PaymentMethod, PaymentMethodPatch, RevenueShare, RevenueShareCalculator, Subscription,
    SubscriptionStatus, Transaction, TransactionKind, TransactionMetadata, TransactionStatus, Wallet,
    WalletError, Withdrawal, WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

type Cell<T> = Arc<Mutex<T>>;

#[derive(Default)]
pub struct MemoryLedgerStore {
    transactions: DashMap<Uuid, Cell<Transaction>>,
    processor_refs: DashMap<(String, String), Uuid>,
    /// original transaction id → reversal transaction id
    reversals: DashMap<Uuid, Uuid>,
    revenue_shares: DashMap<Uuid, RevenueShare>,
    wallets: DashMap<Uuid, Wallet>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    withdrawals: DashMap<Uuid, Cell<Withdrawal>>,
    payment_methods: RwLock<HashMap<Uuid, PaymentMethod>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a transaction's creation time, for window checks in tests
    pub fn backdate_transaction(&self, id: Uuid, created_at: DateTime<Utc>) -> bool {
        match self.transactions.get(&id).map(|e| e.value().clone()) {
            Some(cell) => {
                cell.lock().created_at = created_at;
                true
            }
            None => false,
        }
    }

    /// Move a transaction's settlement time, for window checks in tests
    pub fn backdate_settlement(&self, id: Uuid, processed_at: DateTime<Utc>) -> bool {
        match self.transactions.get(&id).map(|e| e.value().clone()) {
            Some(cell) => {
                cell.lock().processed_at = Some(processed_at);
                true
            }
            None => false,
        }
    }

    fn tx_cell(&self, id: Uuid) -> StoreResult<Cell<Transaction>> {
        self.transactions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", id)))
    }

    fn withdrawal_cell(&self, id: Uuid) -> StoreResult<Cell<Withdrawal>> {
        self.withdrawals
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal {}", id)))
    }

    /// Clone every transaction row without holding map guards while locking
    fn snapshot_transactions(&self) -> Vec<Transaction> {
        let cells: Vec<Cell<Transaction>> =
            self.transactions.iter().map(|e| e.value().clone()).collect();
        cells.iter().map(|cell| cell.lock().clone()).collect()
    }

    fn insert_row(&self, tx: Transaction) {
        self.transactions
            .insert(tx.id, Arc::new(Mutex::new(tx)));
    }

    fn credit_wallet(&self, user_id: Uuid, amount: i64) -> StoreResult<()> {
        let mut wallet = self
            .wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::empty(user_id));
        wallet.credit(amount).map(|_| ()).map_err(wallet_error)
    }

    fn debit_wallet(&self, user_id: Uuid, amount: i64) -> StoreResult<()> {
        let mut wallet = self
            .wallets
            .entry(user_id)
            .or_insert_with(|| Wallet::empty(user_id));
        wallet.debit(amount).map(|_| ()).map_err(wallet_error)
    }

    /// Claim `(processor, id)` for `owner`; returns whether this call inserted it
    fn reserve_reference(&self, processor: &str, reference: &str, owner: Uuid) -> StoreResult<bool> {
        match self
            .processor_refs
            .entry((processor.to_string(), reference.to_string()))
        {
            Entry::Occupied(existing) if *existing.get() != owner => {
                Err(StoreError::ProcessorReferenceConflict {
                    processor_transaction_id: reference.to_string(),
                    existing: *existing.get(),
                })
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(true)
            }
        }
    }
}

fn wallet_error(err: WalletError) -> StoreError {
    match err {
        WalletError::InsufficientBalance {
            available,
            requested,
        } => StoreError::InsufficientBalance {
            available,
            requested,
        },
        other => StoreError::Corrupt(other.to_string()),
    }
}

/// Version-checked write of a subscription row
fn write_subscription(
    subscriptions: &mut HashMap<Uuid, Subscription>,
    subscription: &Subscription,
) -> StoreResult<Subscription> {
    let stored = subscriptions
        .get(&subscription.id)
        .ok_or_else(|| StoreError::NotFound(format!("subscription {}", subscription.id)))?;
    if stored.version != subscription.version {
        return Err(StoreError::VersionConflict(subscription.id));
    }

    let clashes = subscriptions.values().any(|s| {
        s.id != subscription.id
            && ((subscription.status != SubscriptionStatus::Cancelled
                && s.status != SubscriptionStatus::Cancelled
                && s.fan_id == subscription.fan_id
                && s.creator_id == subscription.creator_id)
                || (subscription.processor_subscription_id.is_some()
                    && s.processor == subscription.processor
                    && s.processor_subscription_id == subscription.processor_subscription_id))
    });
    if clashes {
        return Err(StoreError::Conflict(format!(
            "subscription {} conflicts with an existing subscription",
            subscription.id
        )));
    }

    let mut updated = subscription.clone();
    updated.version += 1;
    updated.updated_at = Utc::now();
    subscriptions.insert(updated.id, updated.clone());
    Ok(updated)
}

fn paginate<T>(items: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_transaction(&self, new: NewTransaction) -> StoreResult<Transaction> {
        let tx = new.into_pending(Utc::now());
        self.insert_row(tx.clone());
        Ok(tx)
    }

    async fn find_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let cell = self.transactions.get(&id).map(|e| e.value().clone());
        Ok(cell.map(|c| c.lock().clone()))
    }

    async fn find_by_processor_reference(
        &self,
        processor: &str,
        processor_transaction_id: &str,
    ) -> StoreResult<Option<Transaction>> {
        let owner = self
            .processor_refs
            .get(&(processor.to_string(), processor_transaction_id.to_string()))
            .map(|e| *e.value());
        match owner {
            Some(id) => self.find_transaction(id).await,
            None => Ok(None),
        }
    }

    async fn complete_transaction(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
        rates: FeeRates,
    ) -> StoreResult<Completion> {
        let cell = self.tx_cell(id)?;
        let processor = cell.lock().processor.clone();

        // Resolve a foreign owner before taking our own row lock
        if let Some(owner) = self
            .find_by_processor_reference(&processor, processor_transaction_id)
            .await?
        {
            if owner.id != id {
                let amount = cell.lock().amount;
                if owner.status == TransactionStatus::Completed && owner.amount == amount {
                    return Ok(Completion::AlreadyCompleted(owner));
                }
                return Err(StoreError::ProcessorReferenceConflict {
                    processor_transaction_id: processor_transaction_id.to_string(),
                    existing: owner.id,
                });
            }
        }

        let mut tx = cell.lock();
        match tx.status {
            TransactionStatus::Pending => {}
            TransactionStatus::Completed
                if tx.processor_transaction_id.as_deref() == Some(processor_transaction_id) =>
            {
                return Ok(Completion::AlreadyCompleted(tx.clone()));
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

        let reserved = match self.reserve_reference(&tx.processor, processor_transaction_id, id) {
            Ok(reserved) => reserved,
            Err(StoreError::ProcessorReferenceConflict { existing, .. }) => {
                // Another row claimed the reference since the check above;
                // its lock is held until that completion settles
                let owner = self.tx_cell(existing)?.lock().clone();
                if owner.status == TransactionStatus::Completed && owner.amount == tx.amount {
                    return Ok(Completion::AlreadyCompleted(owner));
                }
                return Err(StoreError::ProcessorReferenceConflict {
                    processor_transaction_id: processor_transaction_id.to_string(),
                    existing,
                });
            }
            Err(e) => return Err(e),
        };
        let split = RevenueShareCalculator::compute(tx.amount, rates);
        if split.net > 0 {
            if let Err(e) = self.credit_wallet(credited, split.net) {
                if reserved {
                    self.processor_refs
                        .remove(&(tx.processor.clone(), processor_transaction_id.to_string()));
                }
                return Err(e);
            }
        }

        let now = Utc::now();
        tx.status = TransactionStatus::Completed;
        tx.processor_transaction_id = Some(processor_transaction_id.to_string());
        tx.platform_fee_amount = split.platform_fee;
        tx.processor_fee_amount = split.processor_fee;
        tx.net_amount = Some(split.net);
        tx.processed_at = Some(now);

        let share = RevenueShare::from_breakdown(credited, id, rates, &split, now);
        self.revenue_shares.insert(id, share.clone());

        Ok(Completion::Completed {
            transaction: tx.clone(),
            revenue_share: share,
        })
    }

    async fn fail_transaction(&self, id: Uuid, reason: &str) -> StoreResult<Transaction> {
        let cell = self.tx_cell(id)?;
        let mut tx = cell.lock();
        match tx.status {
            TransactionStatus::Failed => Ok(tx.clone()),
            TransactionStatus::Pending => {
                tx.status = TransactionStatus::Failed;
                tx.failure_reason = Some(reason.to_string());
                tx.processed_at = Some(Utc::now());
                Ok(tx.clone())
            }
            other => Err(StoreError::status_conflict("transaction", id, other)),
        }
    }

    async fn attach_processor_reference(
        &self,
        id: Uuid,
        processor_transaction_id: &str,
    ) -> StoreResult<Transaction> {
        let cell = self.tx_cell(id)?;
        let mut tx = cell.lock();
        if tx.status != TransactionStatus::Pending {
            return Err(StoreError::status_conflict("transaction", id, tx.status));
        }
        match tx.processor_transaction_id.as_deref() {
            Some(bound) if bound == processor_transaction_id => return Ok(tx.clone()),
            Some(bound) => {
                return Err(StoreError::status_conflict(
                    "transaction",
                    id,
                    format!("bound to processor transaction {}", bound),
                ))
            }
            None => {}
        }
        self.reserve_reference(&tx.processor, processor_transaction_id, id)?;
        tx.processor_transaction_id = Some(processor_transaction_id.to_string());
        Ok(tx.clone())
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

        let cell = self.tx_cell(id)?;
        let mut original = cell.lock();
        match original.status {
            TransactionStatus::Completed => {}
            TransactionStatus::Refunded | TransactionStatus::Chargeback => {
                let reversal_cell = self
                    .reversals
                    .get(&id)
                    .and_then(|r| self.transactions.get(r.value()).map(|e| e.value().clone()));
                return Ok(Reversal {
                    original: original.clone(),
                    reversal: reversal_cell.map(|c| c.lock().clone()),
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
                self.reversals.insert(id, row.id);
                self.insert_row(row.clone());
                Some(row)
            }
            _ => None,
        };

        original.status = target;
        Ok(Reversal {
            original: original.clone(),
            reversal,
            newly_reversed: true,
        })
    }

    async fn apply_reversal(&self, reversal_id: Uuid) -> StoreResult<Transaction> {
        let cell = self.tx_cell(reversal_id)?;
        let mut tx = cell.lock();
        if !tx.kind.is_reversal() {
            return Err(StoreError::Conflict(format!(
                "transaction {} is not a reversal",
                reversal_id
            )));
        }
        match tx.status {
            TransactionStatus::Completed => return Ok(tx.clone()),
            TransactionStatus::Pending => {}
            other => return Err(StoreError::status_conflict("transaction", reversal_id, other)),
        }

        self.debit_wallet(tx.payer_id, tx.amount)?;
        tx.status = TransactionStatus::Completed;
        tx.net_amount = Some(tx.amount);
        tx.processed_at = Some(Utc::now());
        Ok(tx.clone())
    }

    async fn list_pending_reversals(&self, limit: i64) -> StoreResult<Vec<Transaction>> {
        let mut pending: Vec<Transaction> = self
            .snapshot_transactions()
            .into_iter()
            .filter(|t| t.kind.is_reversal() && t.is_pending())
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(paginate(pending, 0, limit))
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        query: &TransactionQuery,
    ) -> StoreResult<Vec<Transaction>> {
        let mut rows: Vec<Transaction> = self
            .snapshot_transactions()
            .into_iter()
            .filter(|t| t.involves(user_id))
            .filter(|t| query.kind.map(|k| t.kind == k).unwrap_or(true))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(rows, query.offset, query.limit))
    }

    async fn has_completed_unlock(&self, payer_id: Uuid, content_id: Uuid) -> StoreResult<bool> {
        Ok(self.snapshot_transactions().iter().any(|t| {
            t.payer_id == payer_id
                && t.kind == TransactionKind::PpvUnlock
                && t.status == TransactionStatus::Completed
                && matches!(
                    &t.metadata,
                    TransactionMetadata::ContentUnlock { content_id: c, .. } if *c == content_id
                )
        }))
    }

    async fn find_revenue_share(&self, transaction_id: Uuid) -> StoreResult<Option<RevenueShare>> {
        Ok(self
            .revenue_shares
            .get(&transaction_id)
            .map(|e| e.value().clone()))
    }

    async fn wallet(&self, user_id: Uuid) -> StoreResult<Wallet> {
        Ok(self
            .wallets
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| Wallet::empty(user_id)))
    }

    async fn earnings(&self, user_id: Uuid, since: DateTime<Utc>) -> StoreResult<Earnings> {
        let transactions: HashMap<Uuid, Transaction> = self
            .snapshot_transactions()
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let mut earnings = Earnings {
            user_id,
            balance: self.wallet(user_id).await?.balance,
            ..Default::default()
        };
        let mut by_kind: BTreeMap<&'static str, EarningsByKind> = BTreeMap::new();

        let shares: Vec<RevenueShare> = self
            .revenue_shares
            .iter()
            .filter(|e| e.value().creator_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        for share in shares {
            let Some(tx) = transactions.get(&share.transaction_id) else {
                continue;
            };
            if tx.kind == TransactionKind::Deposit {
                continue;
            }
            earnings.lifetime_net += share.net_amount;
            if share.created_at >= since {
                earnings.monthly_net += share.net_amount;
            }
            let entry = by_kind.entry(tx.kind.as_str()).or_insert(EarningsByKind {
                kind: tx.kind,
                net: 0,
                count: 0,
            });
            entry.net += share.net_amount;
            entry.count += 1;
        }

        earnings.pending_gross = transactions
            .values()
            .filter(|t| t.recipient_id == Some(user_id) && t.is_pending() && t.kind.is_inbound())
            .map(|t| t.amount)
            .sum();
        earnings.breakdown = by_kind.into_values().collect();
        Ok(earnings)
    }

    async fn create_subscription(
        &self,
        subscription: Subscription,
        initial_charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)> {
        let mut subscriptions = self.subscriptions.write();
        let live_exists = subscriptions.values().any(|s| {
            s.fan_id == subscription.fan_id
                && s.creator_id == subscription.creator_id
                && s.status != SubscriptionStatus::Cancelled
        });
        if live_exists {
            return Err(StoreError::Conflict(
                "fan already has a live subscription to this creator".to_string(),
            ));
        }

        subscriptions.insert(subscription.id, subscription.clone());
        let charge = initial_charge.map(|new| {
            let tx = new.into_pending(Utc::now());
            self.insert_row(tx.clone());
            tx
        });
        Ok((subscription, charge))
    }

    async fn update_subscription(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        write_subscription(&mut self.subscriptions.write(), subscription)
    }

    async fn restart_subscription(
        &self,
        subscription: &Subscription,
        charge: Option<NewTransaction>,
    ) -> StoreResult<(Subscription, Option<Transaction>)> {
        // The charge row is inserted under the subscriptions lock so neither
        // write is visible without the other
        let mut subscriptions = self.subscriptions.write();
        let updated = write_subscription(&mut subscriptions, subscription)?;
        let charge = charge.map(|new| {
            let tx = new.into_pending(Utc::now());
            self.insert_row(tx.clone());
            tx
        });
        Ok((updated, charge))
    }

    async fn find_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        Ok(self.subscriptions.read().get(&id).cloned())
    }

    async fn find_subscription_for_pair(
        &self,
        fan_id: Uuid,
        creator_id: Uuid,
    ) -> StoreResult<Option<Subscription>> {
        let subscriptions = self.subscriptions.read();
        let mut pair: Vec<&Subscription> = subscriptions
            .values()
            .filter(|s| s.fan_id == fan_id && s.creator_id == creator_id)
            .collect();
        pair.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(pair
            .iter()
            .find(|s| s.status != SubscriptionStatus::Cancelled)
            .or_else(|| pair.first())
            .map(|s| (*s).clone()))
    }

    async fn find_subscription_by_processor_id(
        &self,
        processor: &str,
        processor_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .values()
            .find(|s| {
                s.processor == processor
                    && s.processor_subscription_id.as_deref() == Some(processor_subscription_id)
            })
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let mut rows: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.fan_id == user_id || s.creator_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(rows, offset, limit))
    }

    async fn list_lapsed_subscriptions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let mut rows: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| {
                s.status != SubscriptionStatus::Cancelled
                    && !s.auto_renew
                    && s.current_period_end <= now
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.current_period_end);
        Ok(paginate(rows, 0, limit))
    }

    async fn open_withdrawal(&self, new: NewWithdrawal) -> StoreResult<Withdrawal> {
        self.debit_wallet(new.creator_id, new.amount)?;

        let now = Utc::now();
        let withdrawal_id = Uuid::new_v4();
        let ledger_row = NewTransaction {
            payer_id: new.creator_id,
            recipient_id: None,
            kind: TransactionKind::Withdrawal,
            amount: new.amount,
            currency: new.currency.clone(),
            processor: new.processor,
            payment_method_id: Some(new.payment_method_id),
            metadata: TransactionMetadata::Withdrawal { withdrawal_id },
        }
        .into_pending(now);

        let withdrawal = Withdrawal {
            id: withdrawal_id,
            creator_id: new.creator_id,
            amount: new.amount,
            fee_amount: new.fee_amount,
            net_amount: new.amount - new.fee_amount,
            currency: new.currency,
            status: WithdrawalStatus::Pending,
            payment_method_id: new.payment_method_id,
            transaction_id: ledger_row.id,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.insert_row(ledger_row);
        self.withdrawals
            .insert(withdrawal.id, Arc::new(Mutex::new(withdrawal.clone())));
        Ok(withdrawal)
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

        let cell = self.withdrawal_cell(id)?;
        let mut withdrawal = cell.lock();
        if withdrawal.status == target {
            return Ok(withdrawal.clone());
        }
        if withdrawal.status != WithdrawalStatus::Pending {
            return Err(StoreError::status_conflict("withdrawal", id, withdrawal.status));
        }

        let tx_cell = self.tx_cell(withdrawal.transaction_id)?;
        let mut tx = tx_cell.lock();
        if target.credits_back() {
            self.credit_wallet(withdrawal.creator_id, withdrawal.amount)?;
            tx.status = TransactionStatus::Failed;
            tx.failure_reason = reason.map(str::to_string).or_else(|| Some(target.to_string()));
        } else {
            tx.status = TransactionStatus::Completed;
            tx.platform_fee_amount = withdrawal.fee_amount;
            tx.net_amount = Some(withdrawal.net_amount);
        }
        tx.processed_at = Some(Utc::now());

        withdrawal.status = target;
        withdrawal.failure_reason = reason.map(str::to_string);
        withdrawal.updated_at = Utc::now();
        Ok(withdrawal.clone())
    }

    async fn find_withdrawal(&self, id: Uuid) -> StoreResult<Option<Withdrawal>> {
        let cell = self.withdrawals.get(&id).map(|e| e.value().clone());
        Ok(cell.map(|c| c.lock().clone()))
    }

    async fn list_withdrawals(
        &self,
        creator_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<Vec<Withdrawal>> {
        let cells: Vec<Cell<Withdrawal>> =
            self.withdrawals.iter().map(|e| e.value().clone()).collect();
        let mut rows: Vec<Withdrawal> = cells
            .iter()
            .map(|c| c.lock().clone())
            .filter(|w| w.creator_id == creator_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(rows, offset, limit))
    }

    async fn insert_payment_method(&self, new: NewPaymentMethod) -> StoreResult<PaymentMethod> {
        let mut methods = self.payment_methods.write();
        if methods
            .values()
            .any(|m| m.processor == new.processor && m.processor_reference == new.processor_reference)
        {
            return Err(StoreError::Conflict(
                "payment method is already attached".to_string(),
            ));
        }

        let has_any = methods.values().any(|m| m.user_id == new.user_id);
        let mut method = new.into_method(Utc::now());
        method.is_default = method.is_default || !has_any;
        if method.is_default {
            for other in methods.values_mut().filter(|m| m.user_id == method.user_id) {
                other.is_default = false;
            }
        }
        methods.insert(method.id, method.clone());
        Ok(method)
    }

    async fn find_payment_method(&self, id: Uuid) -> StoreResult<Option<PaymentMethod>> {
        Ok(self.payment_methods.read().get(&id).cloned())
    }

    async fn list_payment_methods(&self, user_id: Uuid) -> StoreResult<Vec<PaymentMethod>> {
        let mut rows: Vec<PaymentMethod> = self
            .payment_methods
            .read()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(rows)
    }

    async fn default_payment_method(&self, user_id: Uuid) -> StoreResult<Option<PaymentMethod>> {
        Ok(self
            .payment_methods
            .read()
            .values()
            .find(|m| m.user_id == user_id && m.is_default)
            .cloned())
    }

    async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<PaymentMethod> {
        let mut methods = self.payment_methods.write();
        match methods.get(&id) {
            Some(m) if m.user_id == user_id => {}
            _ => return Err(StoreError::NotFound(format!("payment method {}", id))),
        }
        for method in methods.values_mut().filter(|m| m.user_id == user_id) {
            method.is_default = method.id == id;
        }
        methods
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("payment method {}", id)))
    }

    async fn update_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
        patch: &PaymentMethodPatch,
    ) -> StoreResult<PaymentMethod> {
        let mut methods = self.payment_methods.write();
        match methods.get_mut(&id) {
            Some(method) if method.user_id == user_id => {
                patch.apply(method);
                Ok(method.clone())
            }
            _ => Err(StoreError::NotFound(format!("payment method {}", id))),
        }
    }

    async fn delete_payment_method(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> StoreResult<Option<PaymentMethod>> {
        let mut methods = self.payment_methods.write();
        if !methods.get(&id).is_some_and(|m| m.user_id == user_id) {
            return Err(StoreError::NotFound(format!("payment method {}", id)));
        }
        let removed = methods
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment method {}", id)))?;
        if !removed.is_default {
            return Ok(None);
        }

        let next = methods
            .values_mut()
            .filter(|m| m.user_id == user_id)
            .max_by_key(|m| m.created_at);
        Ok(next.map(|m| {
            m.is_default = true;
            m.clone()
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
