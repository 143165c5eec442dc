use super::string_enum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processed,
    Cancelled,
    Failed,
}

string_enum!(WithdrawalStatus, "withdrawal status", {
    Pending => "pending",
    Processed => "processed",
    Cancelled => "cancelled",
    Failed => "failed",
});

impl WithdrawalStatus {
    /// Terminal states that return the held amount to the wallet
    pub fn credits_back(&self) -> bool {
        matches!(self, WithdrawalStatus::Cancelled | WithdrawalStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub creator_id: Uuid,
    /// Amount held from the wallet
    pub amount: i64,
    pub fee_amount: i64,
    /// Amount paid out
    pub net_amount: i64,
    pub currency: String,
    pub status: WithdrawalStatus,
    pub payment_method_id: Uuid,
    /// Ledger row of kind `withdrawal` mirroring this payout
    pub transaction_id: Uuid,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub creator_id: Uuid,
    pub amount: i64,
    pub fee_amount: i64,
    pub currency: String,
    pub processor: String,
    pub payment_method_id: Uuid,
}
