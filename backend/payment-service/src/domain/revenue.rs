//! Fee and revenue split arithmetic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 100% in basis points
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Platform and processor rates applied to a gross amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    pub platform_bps: u32,
    pub processor_bps: u32,
}

impl FeeRates {
    pub const ZERO: FeeRates = FeeRates {
        platform_bps: 0,
        processor_bps: 0,
    };

    pub fn new(platform_bps: u32, processor_bps: u32) -> Result<Self, String> {
        let rates = Self {
            platform_bps,
            processor_bps,
        };
        rates.validate()?;
        Ok(rates)
    }

    pub fn validate(&self) -> Result<(), String> {
        let total = self.platform_bps as u64 + self.processor_bps as u64;
        if total > BPS_DENOMINATOR as u64 {
            return Err(format!(
                "fee rates sum to {} bps, more than {} bps",
                total, BPS_DENOMINATOR
            ));
        }
        Ok(())
    }
}

/// Result of splitting a gross amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub gross: i64,
    pub platform_fee: i64,
    pub processor_fee: i64,
    pub net: i64,
}

impl FeeBreakdown {
    pub fn total_fees(&self) -> i64 {
        self.platform_fee + self.processor_fee
    }
}

/// Stateless fee calculator.
///
/// Each fee is rounded half-up to the minor unit independently and the net
/// amount absorbs the remainder, so `net + platform_fee + processor_fee`
/// always equals `gross` exactly.
pub struct RevenueShareCalculator;

impl RevenueShareCalculator {
    pub fn compute(gross: i64, rates: FeeRates) -> FeeBreakdown {
        let platform_fee = Self::fee(gross, rates.platform_bps);
        let processor_fee = Self::fee(gross, rates.processor_bps);
        FeeBreakdown {
            gross,
            platform_fee,
            processor_fee,
            net: gross - platform_fee - processor_fee,
        }
    }

    /// `gross * bps / 10000`, rounded half-up. Non-positive amounts carry no fee.
    pub fn fee(gross: i64, bps: u32) -> i64 {
        if gross <= 0 || bps == 0 {
            return 0;
        }
        let scaled = gross as i128 * bps as i128 + (BPS_DENOMINATOR as i128 / 2);
        (scaled / BPS_DENOMINATOR as i128) as i64
    }
}

/// Immutable split record written together with a completed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueShare {
    pub id: Uuid,
    /// The credited party (creator, or the payer for deposits)
    pub creator_id: Uuid,
    pub transaction_id: Uuid,
    pub gross_amount: i64,
    pub platform_fee_rate_bps: u32,
    pub platform_fee_amount: i64,
    pub processor_fee_rate_bps: u32,
    pub processor_fee_amount: i64,
    pub net_amount: i64,
    pub created_at: DateTime<Utc>,
}

impl RevenueShare {
    pub fn from_breakdown(
        creator_id: Uuid,
        transaction_id: Uuid,
        rates: FeeRates,
        breakdown: &FeeBreakdown,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator_id,
            transaction_id,
            gross_amount: breakdown.gross,
            platform_fee_rate_bps: rates.platform_bps,
            platform_fee_amount: breakdown.platform_fee,
            processor_fee_rate_bps: rates.processor_bps,
            processor_fee_amount: breakdown.processor_fee,
            net_amount: breakdown.net,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates(platform: u32, processor: u32) -> FeeRates {
        FeeRates::new(platform, processor).unwrap()
    }

    #[test]
    fn test_monthly_subscription_split() {
        // $9.99 at 10% platform and 2.9% processor
        let split = RevenueShareCalculator::compute(999, rates(1000, 290));
        assert_eq!(split.platform_fee, 100);
        assert_eq!(split.processor_fee, 29);
        assert_eq!(split.net, 870);
    }

    #[test]
    fn test_fees_round_half_up() {
        // 2.5 rounds up to 3
        assert_eq!(RevenueShareCalculator::fee(25, 1000), 3);
        // 2.4 rounds down to 2
        assert_eq!(RevenueShareCalculator::fee(24, 1000), 2);
        // 28.971 rounds to 29
        assert_eq!(RevenueShareCalculator::fee(999, 290), 29);
    }

    #[test]
    fn test_split_always_sums_to_gross() {
        let r = rates(1000, 290);
        for gross in [1, 7, 99, 100, 101, 999, 1_234_567, 1_000_000] {
            let split = RevenueShareCalculator::compute(gross, r);
            assert_eq!(split.net + split.total_fees(), gross, "gross={}", gross);
            assert!(split.net >= 0);
        }
    }

    #[test]
    fn test_zero_rates() {
        let split = RevenueShareCalculator::compute(5_000, FeeRates::ZERO);
        assert_eq!(split.net, 5_000);
        assert_eq!(split.total_fees(), 0);
    }

    #[test]
    fn test_withdrawal_fee_two_percent() {
        assert_eq!(RevenueShareCalculator::fee(10_000, 200), 200);
        assert_eq!(RevenueShareCalculator::fee(1_025, 200), 21);
    }

    #[test]
    fn test_rates_must_not_exceed_full_amount() {
        assert!(FeeRates::new(9_000, 1_000).is_ok());
        assert!(FeeRates::new(9_000, 1_001).is_err());
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        let split = RevenueShareCalculator::compute(i64::MAX / 2, rates(1000, 290));
        assert_eq!(split.net + split.total_fees(), i64::MAX / 2);
    }
}
