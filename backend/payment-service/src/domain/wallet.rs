use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::TransactionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("wallet amounts must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error("wallet balance would overflow")]
    Overflow,
}

/// Per-user balance in minor units. Never negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            balance: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn credit(&mut self, amount: i64) -> Result<i64, WalletError> {
        if amount <= 0 {
            return Err(WalletError::NonPositiveAmount(amount));
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(WalletError::Overflow)?;
        self.updated_at = Utc::now();
        Ok(self.balance)
    }

    /// Leaves the balance untouched when `amount` exceeds it
    pub fn debit(&mut self, amount: i64) -> Result<i64, WalletError> {
        if amount <= 0 {
            return Err(WalletError::NonPositiveAmount(amount));
        }
        if amount > self.balance {
            return Err(WalletError::InsufficientBalance {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        self.updated_at = Utc::now();
        Ok(self.balance)
    }
}

/// Summary returned by the earnings endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Earnings {
    pub user_id: Uuid,
    /// Withdrawable balance
    pub balance: i64,
    /// Net credited from revenue shares over the account's lifetime
    pub lifetime_net: i64,
    /// Net credited in the last month
    pub monthly_net: i64,
    /// Gross of inbound transactions still awaiting confirmation
    pub pending_gross: i64,
    pub breakdown: Vec<EarningsByKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsByKind {
    pub kind: TransactionKind,
    pub net: i64,
    pub count: i64,
}
