//! Processor-independent webhook events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a processor notification means for the ledger.
///
/// `user_ref` is the ledger transaction id the processor echoes back; it is
/// kept as a string because it comes from outside and may be malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    SaleSucceeded {
        processor_tx_id: String,
        amount: i64,
        user_ref: String,
        /// Processor subscription created by this sale, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_ref: Option<String>,
    },
    SaleFailed {
        user_ref: String,
        reason: String,
    },
    RenewalSucceeded {
        subscription_id: String,
        amount: i64,
        processor_tx_id: String,
    },
    RenewalFailed {
        subscription_id: String,
        reason: String,
    },
    Cancelled {
        subscription_id: String,
    },
    Chargeback {
        processor_tx_id: String,
    },
    Refunded {
        processor_tx_id: String,
    },
    /// Event types the ledger does not act on
    Ignored {
        event_type: String,
    },
}

impl NormalizedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NormalizedEvent::SaleSucceeded { .. } => "sale_succeeded",
            NormalizedEvent::SaleFailed { .. } => "sale_failed",
            NormalizedEvent::RenewalSucceeded { .. } => "renewal_succeeded",
            NormalizedEvent::RenewalFailed { .. } => "renewal_failed",
            NormalizedEvent::Cancelled { .. } => "cancelled",
            NormalizedEvent::Chargeback { .. } => "chargeback",
            NormalizedEvent::Refunded { .. } => "refunded",
            NormalizedEvent::Ignored { .. } => "ignored",
        }
    }
}

/// A decoded and authenticated webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Processor-assigned id, unique per processor; the inbox dedup key
    pub event_id: String,
    /// Raw processor event type, for logs
    pub event_type: String,
    pub event: NormalizedEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbox_payload_shape() {
        let envelope = WebhookEnvelope {
            event_id: "evt_1".into(),
            event_type: "invoice.payment_succeeded".into(),
            event: NormalizedEvent::RenewalSucceeded {
                subscription_id: "sub_1".into(),
                amount: 999,
                processor_tx_id: "pi_1".into(),
            },
            occurred_at: None,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "event_id": "evt_1",
                "event_type": "invoice.payment_succeeded",
                "event": {
                    "type": "renewal_succeeded",
                    "subscription_id": "sub_1",
                    "amount": 999,
                    "processor_tx_id": "pi_1",
                }
            })
        );
        let back: WebhookEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }
}
