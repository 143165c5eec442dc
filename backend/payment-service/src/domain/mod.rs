//! Domain types for the payment ledger.
//!
//! Money is always an `i64` count of minor currency units and fee rates are
//! basis points. Nothing in this module performs I/O.

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// database and JSON spelling is snake_case.
macro_rules! string_enum {
    ($ty:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::domain::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err($crate::domain::ParseEnumError::new($label, other)),
                }
            }
        }
    };
}

pub(crate) use string_enum;

pub mod events;
pub mod limits;
pub mod payment_method;
pub mod revenue;
pub mod subscription;
pub mod transaction;
pub mod wallet;
pub mod withdrawal;

pub use events::{NormalizedEvent, WebhookEnvelope};
pub use payment_method::{NewPaymentMethod, PaymentMethod, PaymentMethodKind, PaymentMethodPatch};
pub use revenue::{FeeBreakdown, FeeRates, RevenueShare, RevenueShareCalculator};
pub use subscription::{BillingCycle, Subscription, SubscriptionAccess, SubscriptionStatus};
pub use transaction::{
    ContentKind, NewTransaction, Transaction, TransactionKind, TransactionMetadata,
    TransactionStatus,
};
pub use wallet::{Earnings, EarningsByKind, Wallet, WalletError};
pub use withdrawal::{NewWithdrawal, Withdrawal, WithdrawalStatus};

use thiserror::Error;

/// A stored enum column held a value this build does not know
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// ISO-4217 style check: three ASCII uppercase letters
pub fn is_valid_currency(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}
