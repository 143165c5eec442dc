//! Payment processor boundary.
//!
//! One [`ProcessorAdapter`] per processor. Callers never hold an adapter
//! directly: the [`ProcessorRegistry`] hands out [`GuardedProcessor`]s that
//! bound every outbound call with a timeout and a per-processor circuit
//! breaker. Charges are never retried automatically.

pub mod ccbill;
pub mod guard;
pub mod signature;
pub mod stripe;

pub use ccbill::CcbillProcessor;
pub use guard::{CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardedProcessor};
pub use stripe::StripeProcessor;

use crate::domain::{
    BillingCycle, PaymentMethod, PaymentMethodKind, Transaction, WebhookEnvelope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("processor call timed out after {0:?}")]
    Timeout(Duration),

    #[error("processor unavailable: {0}")]
    Unavailable(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("payment declined: {0}")]
    Declined(String),

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("malformed processor payload: {0}")]
    MalformedPayload(String),

    #[error("processor not configured: {0}")]
    NotConfigured(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl ProcessorError {
    /// Outage-class failures; these count against the circuit breaker
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProcessorError::Timeout(_)
                | ProcessorError::Unavailable(_)
                | ProcessorError::CircuitOpen(_)
        )
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            ProcessorError::Timeout(_) => "timeout",
            ProcessorError::Unavailable(_) => "unavailable",
            ProcessorError::CircuitOpen(_) => "circuit_open",
            ProcessorError::Declined(_) => "declined",
            ProcessorError::SignatureInvalid => "signature_invalid",
            ProcessorError::MalformedPayload(_) => "malformed",
            ProcessorError::NotConfigured(_) => "not_configured",
            ProcessorError::Unsupported(_) => "unsupported",
        }
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProcessorError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ProcessorError::MalformedPayload(err.to_string())
        } else {
            ProcessorError::Unavailable(err.to_string())
        }
    }
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Synchronous answer to a charge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded { processor_transaction_id: String },
    /// Accepted; the final result arrives by webhook
    Pending { processor_transaction_id: String },
}

impl ChargeOutcome {
    pub fn processor_transaction_id(&self) -> &str {
        match self {
            ChargeOutcome::Succeeded {
                processor_transaction_id,
            }
            | ChargeOutcome::Pending {
                processor_transaction_id,
            } => processor_transaction_id,
        }
    }
}

/// Processor view of a newly attached payment method
#[derive(Debug, Clone)]
pub struct AttachedMethod {
    pub processor_reference: String,
    pub kind: PaymentMethodKind,
    pub last_four: Option<String>,
    pub brand: Option<String>,
    pub is_verified: bool,
}

/// Everything a processor needs to set up a recurring charge
#[derive(Debug, Clone)]
pub struct RecurringRequest {
    pub subscription_id: Uuid,
    pub fan_id: Uuid,
    pub creator_id: Uuid,
    pub price: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub payment_method_reference: String,
    /// Ledger transaction of the first charge, echoed back by the sale webhook
    pub reference: Option<Uuid>,
    pub trial_end: Option<DateTime<Utc>>,
}

/// New terms for an existing recurring charge, applied from the next renewal
#[derive(Debug, Clone)]
pub struct RecurringUpdate {
    pub price: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    /// False stops renewal at period end; true lifts a pending stop
    pub auto_renew: bool,
}

#[async_trait]
pub trait ProcessorAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn attach_payment_method(
        &self,
        user_id: Uuid,
        token: &str,
        kind: PaymentMethodKind,
    ) -> ProcessorResult<AttachedMethod>;

    async fn charge(
        &self,
        transaction: &Transaction,
        method: &PaymentMethod,
    ) -> ProcessorResult<ChargeOutcome>;

    async fn refund(&self, transaction: &Transaction, reason: &str) -> ProcessorResult<()>;

    /// Release the stored method at the processor
    async fn detach_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()>;

    /// Confirm the stored method is still chargeable; `Declined` if not
    async fn verify_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()>;

    /// Returns the processor subscription id
    async fn create_recurring(&self, request: &RecurringRequest) -> ProcessorResult<String>;

    async fn cancel_recurring(
        &self,
        processor_subscription_id: &str,
        immediate: bool,
    ) -> ProcessorResult<()>;

    async fn update_recurring(
        &self,
        processor_subscription_id: &str,
        update: &RecurringUpdate,
    ) -> ProcessorResult<()>;

    /// Authenticate and normalize a raw webhook delivery
    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ProcessorResult<WebhookEnvelope>;
}

/// Processors by name, each behind its own guard
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<GuardedProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        adapter: Arc<dyn ProcessorAdapter>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) {
        let name = adapter.name().to_string();
        let guarded = GuardedProcessor::new(adapter, timeout, breaker);
        self.processors.insert(name, Arc::new(guarded));
    }

    pub fn get(&self, name: &str) -> Option<Arc<GuardedProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// Parse a decimal amount string ("9.99", "10", "0.5") into minor units.
/// At most two fractional digits are accepted.
pub(crate) fn parse_decimal_minor(value: &str) -> Option<i64> {
    let value = value.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if whole.is_empty() || fraction.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(cents)
}

/// Render minor units as a two-decimal string for processor APIs
pub(crate) fn minor_to_decimal(amount: i64) -> String {
    crate::domain::limits::format_minor(amount)
}
