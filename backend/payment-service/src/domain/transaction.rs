use super::string_enum;
use super::subscription::BillingCycle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Subscription,
    Tip,
    PpvUnlock,
    Withdrawal,
    Deposit,
    Refund,
    Chargeback,
}

string_enum!(TransactionKind, "transaction kind", {
    Subscription => "subscription",
    Tip => "tip",
    PpvUnlock => "ppv_unlock",
    Withdrawal => "withdrawal",
    Deposit => "deposit",
    Refund => "refund",
    Chargeback => "chargeback",
});

impl TransactionKind {
    /// Kinds where paying yourself is rejected
    pub fn requires_distinct_parties(&self) -> bool {
        matches!(
            self,
            TransactionKind::Subscription | TransactionKind::Tip | TransactionKind::PpvUnlock
        )
    }

    /// Kinds completed through `apply_reversal` rather than `complete_transaction`
    pub fn is_reversal(&self) -> bool {
        matches!(self, TransactionKind::Refund | TransactionKind::Chargeback)
    }

    /// Kinds that move money into a wallet when completed
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            TransactionKind::Subscription
                | TransactionKind::Tip
                | TransactionKind::PpvUnlock
                | TransactionKind::Deposit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Chargeback,
}

string_enum!(TransactionStatus, "transaction status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
    Chargeback => "chargeback",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Post,
    ShortVideo,
    Message,
}

string_enum!(ContentKind, "content kind", {
    Post => "post",
    ShortVideo => "short_video",
    Message => "message",
});

/// Per-kind details stored with a transaction (JSONB column)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionMetadata {
    Tip {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ContentUnlock {
        content_id: Uuid,
        content_kind: ContentKind,
    },
    Subscription {
        subscription_id: Uuid,
        billing_cycle: BillingCycle,
        renewal: bool,
        /// Period end the charge pays for; set on renewals
        #[serde(default, skip_serializing_if = "Option::is_none")]
        period_end: Option<DateTime<Utc>>,
    },
    Deposit,
    Withdrawal {
        withdrawal_id: Uuid,
    },
    Reversal {
        original_transaction_id: Uuid,
        reason: String,
    },
}

impl TransactionMetadata {
    pub fn matches_kind(&self, kind: TransactionKind) -> bool {
        matches!(
            (self, kind),
            (TransactionMetadata::Tip { .. }, TransactionKind::Tip)
                | (TransactionMetadata::ContentUnlock { .. }, TransactionKind::PpvUnlock)
                | (TransactionMetadata::Subscription { .. }, TransactionKind::Subscription)
                | (TransactionMetadata::Deposit, TransactionKind::Deposit)
                | (TransactionMetadata::Withdrawal { .. }, TransactionKind::Withdrawal)
                | (TransactionMetadata::Reversal { .. }, TransactionKind::Refund)
                | (TransactionMetadata::Reversal { .. }, TransactionKind::Chargeback)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub payer_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub processor: String,
    pub processor_transaction_id: Option<String>,
    pub payment_method_id: Option<Uuid>,
    pub platform_fee_amount: i64,
    pub processor_fee_amount: i64,
    pub net_amount: Option<i64>,
    pub metadata: TransactionMetadata,
    /// Original transaction of a refund or chargeback
    pub related_transaction_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn fee_amount(&self) -> i64 {
        self.platform_fee_amount + self.processor_fee_amount
    }

    /// Wallet credited when this transaction completes
    pub fn credited_party(&self) -> Option<Uuid> {
        match self.kind {
            TransactionKind::Deposit => Some(self.payer_id),
            TransactionKind::Subscription | TransactionKind::Tip | TransactionKind::PpvUnlock => {
                self.recipient_id
            }
            _ => None,
        }
    }

    pub fn subscription_id(&self) -> Option<Uuid> {
        match &self.metadata {
            TransactionMetadata::Subscription {
                subscription_id, ..
            } => Some(*subscription_id),
            _ => None,
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.payer_id == user_id || self.recipient_id == Some(user_id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }
}

/// Input for creating a pending transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub payer_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub amount: i64,
    pub currency: String,
    pub processor: String,
    pub payment_method_id: Option<Uuid>,
    pub metadata: TransactionMetadata,
}

impl NewTransaction {
    /// Build the pending row. Validation happens in the ledger service.
    pub fn into_pending(self, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            payer_id: self.payer_id,
            recipient_id: self.recipient_id,
            kind: self.kind,
            amount: self.amount,
            currency: self.currency,
            status: TransactionStatus::Pending,
            processor: self.processor,
            processor_transaction_id: None,
            payment_method_id: self.payment_method_id,
            platform_fee_amount: 0,
            processor_fee_amount: 0,
            net_amount: None,
            related_transaction_id: match &self.metadata {
                TransactionMetadata::Reversal {
                    original_transaction_id,
                    ..
                } => Some(*original_transaction_id),
                _ => None,
            },
            metadata: self.metadata,
            failure_reason: None,
            created_at: now,
            processed_at: None,
        }
    }
}
