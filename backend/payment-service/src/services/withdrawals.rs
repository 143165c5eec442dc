/// Creator payouts
///
/// Requesting a withdrawal debits the wallet immediately; cancellation or a
/// failed payout credits the held amount back exactly once.
use crate::directory::UserDirectory;
use crate::domain::{
    is_valid_currency, limits, NewWithdrawal, RevenueShareCalculator, Withdrawal,
    WithdrawalStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::repository::LedgerStore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestWithdrawal {
    pub creator_id: Uuid,
    pub amount: i64,
    pub currency: Option<String>,
    pub payment_method_id: Uuid,
}

pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn UserDirectory>,
    fee_bps: u32,
    default_currency: String,
}

impl WithdrawalService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn UserDirectory>,
        fee_bps: u32,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            fee_bps,
            default_currency: default_currency.into(),
        }
    }

    pub async fn request(&self, request: RequestWithdrawal) -> ServiceResult<Withdrawal> {
        limits::check_amount("withdrawal", request.amount, &limits::WITHDRAWAL_AMOUNT)
            .map_err(ServiceError::Validation)?;
        let currency = request
            .currency
            .unwrap_or_else(|| self.default_currency.clone());
        if !is_valid_currency(&currency) {
            return Err(ServiceError::Validation(format!(
                "invalid currency code '{}'",
                currency
            )));
        }

        let account = self
            .directory
            .require_account(request.creator_id, "creator")
            .await?;
        if !account.is_active_creator() {
            return Err(ServiceError::Forbidden(
                "only active creators can withdraw".to_string(),
            ));
        }

        let method = match self
            .store
            .find_payment_method(request.payment_method_id)
            .await?
        {
            Some(method) if method.user_id == request.creator_id => method,
            _ => {
                return Err(ServiceError::NotFound(format!(
                    "payment method {}",
                    request.payment_method_id
                )))
            }
        };
        if !method.is_verified {
            return Err(ServiceError::Validation(
                "payout method is not verified".to_string(),
            ));
        }

        let fee_amount = RevenueShareCalculator::fee(request.amount, self.fee_bps);
        let withdrawal = self
            .store
            .open_withdrawal(NewWithdrawal {
                creator_id: request.creator_id,
                amount: request.amount,
                fee_amount,
                currency,
                processor: method.processor.clone(),
                payment_method_id: method.id,
            })
            .await?;

        metrics::record_wallet_movement("debit", withdrawal.amount);
        info!(
            withdrawal_id = %withdrawal.id,
            creator_id = %withdrawal.creator_id,
            amount = withdrawal.amount,
            fee = withdrawal.fee_amount,
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Creator-initiated cancellation of a pending withdrawal
    pub async fn cancel(&self, creator_id: Uuid, withdrawal_id: Uuid) -> ServiceResult<Withdrawal> {
        let withdrawal = self.get(creator_id, withdrawal_id).await?;
        match withdrawal.status {
            WithdrawalStatus::Pending => {}
            WithdrawalStatus::Cancelled => return Ok(withdrawal),
            other => {
                return Err(ServiceError::Conflict(format!(
                    "withdrawal {} is already {}",
                    withdrawal_id, other
                )))
            }
        }
        self.settle(withdrawal_id, WithdrawalStatus::Cancelled, None)
            .await
    }

    /// Payout confirmed by the payout rail
    pub async fn mark_processed(&self, withdrawal_id: Uuid) -> ServiceResult<Withdrawal> {
        self.settle(withdrawal_id, WithdrawalStatus::Processed, None)
            .await
    }

    /// Payout rejected; the held amount goes back to the wallet
    pub async fn mark_failed(&self, withdrawal_id: Uuid, reason: &str) -> ServiceResult<Withdrawal> {
        self.settle(withdrawal_id, WithdrawalStatus::Failed, Some(reason))
            .await
    }

    async fn settle(
        &self,
        withdrawal_id: Uuid,
        target: WithdrawalStatus,
        reason: Option<&str>,
    ) -> ServiceResult<Withdrawal> {
        let before = self.find(withdrawal_id).await?;
        let withdrawal = self
            .store
            .settle_withdrawal(withdrawal_id, target, reason)
            .await?;

        if before.status == WithdrawalStatus::Pending {
            if target.credits_back() {
                metrics::record_wallet_movement("credit", withdrawal.amount);
            }
            info!(
                withdrawal_id = %withdrawal_id,
                status = %target,
                "Withdrawal settled"
            );
        }
        Ok(withdrawal)
    }

    pub async fn get(&self, creator_id: Uuid, withdrawal_id: Uuid) -> ServiceResult<Withdrawal> {
        let withdrawal = self.find(withdrawal_id).await?;
        if withdrawal.creator_id != creator_id {
            return Err(ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)));
        }
        Ok(withdrawal)
    }

    pub async fn list(
        &self,
        creator_id: Uuid,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> ServiceResult<Vec<Withdrawal>> {
        let (offset, limit) = limits::page_window(page, limit).map_err(ServiceError::Validation)?;
        Ok(self.store.list_withdrawals(creator_id, offset, limit).await?)
    }

    async fn find(&self, withdrawal_id: Uuid) -> ServiceResult<Withdrawal> {
        self.store
            .find_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("withdrawal {}", withdrawal_id)))
    }
}
