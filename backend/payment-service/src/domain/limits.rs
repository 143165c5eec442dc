//! Amount bounds and business windows, in minor units where applicable

use std::ops::RangeInclusive;

/// $1.00 to $10,000.00
pub const TIP_AMOUNT: RangeInclusive<i64> = 100..=1_000_000;
pub const DEPOSIT_AMOUNT: RangeInclusive<i64> = 100..=1_000_000;
pub const SUBSCRIPTION_PRICE: RangeInclusive<i64> = 100..=1_000_000;
/// $10.00 to $10,000.00
pub const WITHDRAWAL_AMOUNT: RangeInclusive<i64> = 1_000..=1_000_000;

pub const WITHDRAWAL_FEE_BPS: u32 = 200;
pub const MAX_TRIAL_DAYS: u32 = 90;
pub const REFUND_WINDOW_DAYS: i64 = 30;
pub const MAX_TIP_MESSAGE_CHARS: usize = 500;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Format minor units as a decimal string for messages ("12.34")
pub fn format_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Check `amount` against `range`, producing a caller-facing message
pub fn check_amount(what: &str, amount: i64, range: &RangeInclusive<i64>) -> Result<(), String> {
    if range.contains(&amount) {
        Ok(())
    } else {
        Err(format!(
            "{} must be between {} and {}, got {}",
            what,
            format_minor(*range.start()),
            format_minor(*range.end()),
            format_minor(amount)
        ))
    }
}

/// Clamp pagination input: page is 1-based, limit defaults to 20 and caps at 100
pub fn page_window(page: Option<u32>, limit: Option<u32>) -> Result<(i64, i64), String> {
    let page = page.unwrap_or(1);
    if page == 0 {
        return Err("page must be at least 1".to_string());
    }
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(format!("limit must be between 1 and {}", MAX_PAGE_LIMIT));
    }
    let offset = (page as i64 - 1) * limit as i64;
    Ok((offset, limit as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(999), "9.99");
        assert_eq!(format_minor(100), "1.00");
        assert_eq!(format_minor(5), "0.05");
        assert_eq!(format_minor(-1_050), "-10.50");
    }

    #[test]
    fn test_amount_bounds() {
        assert!(check_amount("tip", 100, &TIP_AMOUNT).is_ok());
        assert!(check_amount("tip", 1_000_000, &TIP_AMOUNT).is_ok());
        let err = check_amount("tip", 99, &TIP_AMOUNT).unwrap_err();
        assert_eq!(err, "tip must be between 1.00 and 10000.00, got 0.99");
        assert!(check_amount("withdrawal", 999, &WITHDRAWAL_AMOUNT).is_err());
    }

    #[test]
    fn test_page_window() {
        assert_eq!(page_window(None, None).unwrap(), (0, 20));
        assert_eq!(page_window(Some(3), Some(10)).unwrap(), (20, 10));
        assert!(page_window(Some(0), None).is_err());
        assert!(page_window(None, Some(101)).is_err());
    }
}
