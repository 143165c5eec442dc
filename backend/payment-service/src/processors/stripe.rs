//! Stripe adapter over the REST API (form-encoded, bearer secret key).
//!
//! Stored payment method references have the form `cus_…:pm_…` because
//! Stripe only charges an attached payment method together with its
//! customer.

use super::signature::verify_stripe_header;
use super::{
    AttachedMethod, ChargeOutcome, ProcessorAdapter, ProcessorError, ProcessorResult,
    RecurringRequest, RecurringUpdate,
};
use crate::config::StripeConfig;
use crate::domain::{
    BillingCycle, NormalizedEvent, PaymentMethod, PaymentMethodKind, Transaction, WebhookEnvelope,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

pub const NAME: &str = "stripe";

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Customer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Card {
    brand: Option<String>,
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsBankAccount {
    last4: Option<String>,
    bank_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    customer: Option<String>,
    card: Option<Card>,
    us_bank_account: Option<UsBankAccount>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    metadata: HashMap<String, String>,
    last_payment_error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    #[serde(default)]
    items: Option<SubscriptionItems>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItems {
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Event {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: Option<i64>,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    id: String,
    subscription: Option<String>,
    payment_intent: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    billing_reason: Option<String>,
    subscription_details: Option<SubscriptionDetails>,
}

impl Invoice {
    fn ledger_reference(&self) -> Option<String> {
        self.subscription_details
            .as_ref()
            .and_then(|d| d.metadata.get("transaction_id").cloned())
    }

    fn processor_tx_id(&self) -> String {
        self.payment_intent.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// Charges and disputes both point at the payment intent
#[derive(Debug, Deserialize)]
struct PaymentIntentLink {
    payment_intent: Option<String>,
}

pub struct StripeProcessor {
    client: Client,
    config: StripeConfig,
}

impl StripeProcessor {
    pub fn new(config: StripeConfig) -> ProcessorResult<Self> {
        let client = Client::builder()
            .user_agent("payment-service")
            .build()
            .map_err(|e| ProcessorError::NotConfigured(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<String>,
    ) -> ProcessorResult<T> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.config.secret_key);
        if !form.is_empty() {
            request = request.form(form);
        }
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.json::<ApiErrorBody>().await.ok();
        Err(Self::map_error(status, body.map(|b| b.error)))
    }

    fn map_error(status: StatusCode, error: Option<ApiError>) -> ProcessorError {
        let message = error
            .as_ref()
            .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
            .unwrap_or_else(|| status.to_string());
        let is_card_error = error
            .as_ref()
            .and_then(|e| e.error_type.as_deref())
            .map(|t| t == "card_error")
            .unwrap_or(false);

        if status == StatusCode::PAYMENT_REQUIRED || is_card_error {
            ProcessorError::Declined(message)
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProcessorError::Unavailable(message)
        } else {
            ProcessorError::MalformedPayload(message)
        }
    }

    fn split_reference(reference: &str) -> ProcessorResult<(&str, &str)> {
        reference.split_once(':').ok_or_else(|| {
            ProcessorError::MalformedPayload(format!(
                "stripe payment method reference '{}' lacks a customer",
                reference
            ))
        })
    }

    fn interval(cycle: BillingCycle) -> &'static str {
        match cycle {
            BillingCycle::Monthly => "month",
            BillingCycle::Yearly => "year",
        }
    }

    fn normalize(event_type: &str, object: serde_json::Value) -> ProcessorResult<NormalizedEvent> {
        fn parse<T: DeserializeOwned>(object: serde_json::Value) -> ProcessorResult<T> {
            serde_json::from_value(object)
                .map_err(|e| ProcessorError::MalformedPayload(e.to_string()))
        }

        let ignored = || NormalizedEvent::Ignored {
            event_type: event_type.to_string(),
        };

        let event = match event_type {
            "payment_intent.succeeded" => {
                let intent: PaymentIntent = parse(object)?;
                // Intents created by invoices carry no ledger reference
                match intent.metadata.get("transaction_id") {
                    Some(reference) => NormalizedEvent::SaleSucceeded {
                        processor_tx_id: intent.id,
                        amount: intent.amount,
                        user_ref: reference.clone(),
                        subscription_ref: None,
                    },
                    None => ignored(),
                }
            }
            "payment_intent.payment_failed" => {
                let intent: PaymentIntent = parse(object)?;
                match intent.metadata.get("transaction_id") {
                    Some(reference) => NormalizedEvent::SaleFailed {
                        user_ref: reference.clone(),
                        reason: intent
                            .last_payment_error
                            .and_then(|e| e.message.or(e.code))
                            .unwrap_or_else(|| "payment_failed".to_string()),
                    },
                    None => ignored(),
                }
            }
            "invoice.payment_succeeded" => {
                let invoice: Invoice = parse(object)?;
                let subscription = match invoice.subscription.clone() {
                    Some(s) => s,
                    None => return Ok(ignored()),
                };
                if invoice.billing_reason.as_deref() == Some("subscription_create") {
                    match (invoice.ledger_reference(), invoice.amount_paid) {
                        // Trial invoices are zero-amount and have no charge to settle
                        (Some(reference), amount) if amount > 0 => NormalizedEvent::SaleSucceeded {
                            processor_tx_id: invoice.processor_tx_id(),
                            amount,
                            user_ref: reference,
                            subscription_ref: Some(subscription),
                        },
                        _ => ignored(),
                    }
                } else if invoice.amount_paid > 0 {
                    NormalizedEvent::RenewalSucceeded {
                        subscription_id: subscription,
                        amount: invoice.amount_paid,
                        processor_tx_id: invoice.processor_tx_id(),
                    }
                } else {
                    ignored()
                }
            }
            "invoice.payment_failed" => {
                let invoice: Invoice = parse(object)?;
                let subscription = match invoice.subscription.clone() {
                    Some(s) => s,
                    None => return Ok(ignored()),
                };
                if invoice.billing_reason.as_deref() == Some("subscription_create") {
                    match invoice.ledger_reference() {
                        Some(reference) => NormalizedEvent::SaleFailed {
                            user_ref: reference,
                            reason: "initial invoice payment failed".to_string(),
                        },
                        None => ignored(),
                    }
                } else {
                    NormalizedEvent::RenewalFailed {
                        subscription_id: subscription,
                        reason: "invoice payment failed".to_string(),
                    }
                }
            }
            "customer.subscription.deleted" => {
                let subscription: StripeSubscription = parse(object)?;
                NormalizedEvent::Cancelled {
                    subscription_id: subscription.id,
                }
            }
            "charge.refunded" => match parse::<PaymentIntentLink>(object)?.payment_intent {
                Some(processor_tx_id) => NormalizedEvent::Refunded { processor_tx_id },
                None => ignored(),
            },
            "charge.dispute.created" => match parse::<PaymentIntentLink>(object)?.payment_intent {
                Some(processor_tx_id) => NormalizedEvent::Chargeback { processor_tx_id },
                None => ignored(),
            },
            _ => ignored(),
        };
        Ok(event)
    }
}

#[async_trait]
impl ProcessorAdapter for StripeProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn attach_payment_method(
        &self,
        user_id: Uuid,
        token: &str,
        kind: PaymentMethodKind,
    ) -> ProcessorResult<AttachedMethod> {
        if kind == PaymentMethodKind::CryptoWallet {
            return Err(ProcessorError::Unsupported(
                "stripe does not hold crypto wallets".to_string(),
            ));
        }

        let customer: Customer = self
            .request(
                Method::POST,
                "/customers",
                &[("metadata[user_id]".to_string(), user_id.to_string())],
                Some(format!("customer-{}-{}", user_id, token)),
            )
            .await?;

        let method: StripePaymentMethod = self
            .request(
                Method::POST,
                &format!("/payment_methods/{}/attach", token),
                &[("customer".to_string(), customer.id.clone())],
                None,
            )
            .await?;

        let (last_four, brand) = match (&method.card, &method.us_bank_account) {
            (Some(card), _) => (card.last4.clone(), card.brand.clone()),
            (None, Some(bank)) => (bank.last4.clone(), bank.bank_name.clone()),
            (None, None) => (None, None),
        };

        debug!(user_id = %user_id, customer = %customer.id, "Stripe payment method attached");

        Ok(AttachedMethod {
            processor_reference: format!("{}:{}", customer.id, method.id),
            kind,
            last_four,
            brand,
            // Attach succeeds only for usable methods
            is_verified: true,
        })
    }

    async fn charge(
        &self,
        transaction: &Transaction,
        method: &PaymentMethod,
    ) -> ProcessorResult<ChargeOutcome> {
        let (customer, payment_method) = Self::split_reference(&method.processor_reference)?;
        let form = vec![
            ("amount".to_string(), transaction.amount.to_string()),
            ("currency".to_string(), transaction.currency.to_lowercase()),
            ("customer".to_string(), customer.to_string()),
            ("payment_method".to_string(), payment_method.to_string()),
            ("confirm".to_string(), "true".to_string()),
            ("off_session".to_string(), "true".to_string()),
            ("description".to_string(), transaction.kind.to_string()),
            ("metadata[transaction_id]".to_string(), transaction.id.to_string()),
            ("metadata[payer_id]".to_string(), transaction.payer_id.to_string()),
        ];

        let intent: PaymentIntent = self
            .request(
                Method::POST,
                "/payment_intents",
                &form,
                Some(transaction.id.to_string()),
            )
            .await?;

        match intent.status.as_str() {
            "succeeded" => Ok(ChargeOutcome::Succeeded {
                processor_transaction_id: intent.id,
            }),
            "processing" | "requires_capture" => Ok(ChargeOutcome::Pending {
                processor_transaction_id: intent.id,
            }),
            other => Err(ProcessorError::Declined(
                intent
                    .last_payment_error
                    .and_then(|e| e.message.or(e.code))
                    .unwrap_or_else(|| other.to_string()),
            )),
        }
    }

    async fn refund(&self, transaction: &Transaction, reason: &str) -> ProcessorResult<()> {
        let payment_intent = transaction.processor_transaction_id.as_deref().ok_or_else(|| {
            ProcessorError::MalformedPayload(format!(
                "transaction {} has no processor transaction id",
                transaction.id
            ))
        })?;

        let form = vec![
            ("payment_intent".to_string(), payment_intent.to_string()),
            ("amount".to_string(), transaction.amount.to_string()),
            ("reason".to_string(), "requested_by_customer".to_string()),
            ("metadata[transaction_id]".to_string(), transaction.id.to_string()),
            ("metadata[reason]".to_string(), reason.to_string()),
        ];
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/refunds",
                &form,
                Some(format!("refund-{}", transaction.id)),
            )
            .await?;
        Ok(())
    }

    async fn detach_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        let (_, payment_method) = Self::split_reference(&method.processor_reference)?;
        let _: StripePaymentMethod = self
            .request(
                Method::POST,
                &format!("/payment_methods/{}/detach", payment_method),
                &[],
                None,
            )
            .await?;
        Ok(())
    }

    async fn verify_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        let (customer, payment_method) = Self::split_reference(&method.processor_reference)?;
        let fetched: StripePaymentMethod = self
            .request(
                Method::GET,
                &format!("/payment_methods/{}", payment_method),
                &[],
                None,
            )
            .await?;
        if fetched.customer.as_deref() != Some(customer) {
            return Err(ProcessorError::Declined(format!(
                "payment method {} is no longer attached to {}",
                fetched.id, customer
            )));
        }
        Ok(())
    }

    async fn create_recurring(&self, request: &RecurringRequest) -> ProcessorResult<String> {
        let (customer, payment_method) = Self::split_reference(&request.payment_method_reference)?;
        let mut form = vec![
            ("customer".to_string(), customer.to_string()),
            ("default_payment_method".to_string(), payment_method.to_string()),
            (
                "items[0][price_data][currency]".to_string(),
                request.currency.to_lowercase(),
            ),
            (
                "items[0][price_data][product]".to_string(),
                self.config.subscription_product.clone(),
            ),
            (
                "items[0][price_data][unit_amount]".to_string(),
                request.price.to_string(),
            ),
            (
                "items[0][price_data][recurring][interval]".to_string(),
                Self::interval(request.billing_cycle).to_string(),
            ),
            ("metadata[subscription_id]".to_string(), request.subscription_id.to_string()),
            ("metadata[fan_id]".to_string(), request.fan_id.to_string()),
            ("metadata[creator_id]".to_string(), request.creator_id.to_string()),
        ];
        if let Some(reference) = request.reference {
            form.push(("metadata[transaction_id]".to_string(), reference.to_string()));
        }
        if let Some(trial_end) = request.trial_end {
            form.push(("trial_end".to_string(), trial_end.timestamp().to_string()));
        }

        let idempotency_key = request
            .reference
            .map(|r| format!("subscription-{}", r))
            .unwrap_or_else(|| format!("subscription-{}-trial", request.subscription_id));
        let subscription: StripeSubscription = self
            .request(Method::POST, "/subscriptions", &form, Some(idempotency_key))
            .await?;
        Ok(subscription.id)
    }

    async fn cancel_recurring(
        &self,
        processor_subscription_id: &str,
        immediate: bool,
    ) -> ProcessorResult<()> {
        let path = format!("/subscriptions/{}", processor_subscription_id);
        let _: serde_json::Value = if immediate {
            self.request(Method::DELETE, &path, &[], None).await?
        } else {
            self.request(
                Method::POST,
                &path,
                &[("cancel_at_period_end".to_string(), "true".to_string())],
                None,
            )
            .await?
        };
        Ok(())
    }

    async fn update_recurring(
        &self,
        processor_subscription_id: &str,
        update: &RecurringUpdate,
    ) -> ProcessorResult<()> {
        let path = format!("/subscriptions/{}", processor_subscription_id);
        let current: StripeSubscription = self.request(Method::GET, &path, &[], None).await?;
        let item = current
            .items
            .and_then(|items| items.data.into_iter().next())
            .ok_or_else(|| {
                ProcessorError::MalformedPayload(format!(
                    "stripe subscription {} has no items",
                    current.id
                ))
            })?;

        // New terms take effect at the next invoice
        let form = vec![
            ("items[0][id]".to_string(), item.id),
            (
                "items[0][price_data][currency]".to_string(),
                update.currency.to_lowercase(),
            ),
            (
                "items[0][price_data][product]".to_string(),
                self.config.subscription_product.clone(),
            ),
            (
                "items[0][price_data][unit_amount]".to_string(),
                update.price.to_string(),
            ),
            (
                "items[0][price_data][recurring][interval]".to_string(),
                Self::interval(update.billing_cycle).to_string(),
            ),
            ("proration_behavior".to_string(), "none".to_string()),
            (
                "cancel_at_period_end".to_string(),
                (!update.auto_renew).to_string(),
            ),
        ];
        let _: StripeSubscription = self.request(Method::POST, &path, &form, None).await?;
        Ok(())
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ProcessorResult<WebhookEnvelope> {
        let header = signature.ok_or(ProcessorError::SignatureInvalid)?;
        verify_stripe_header(
            &self.config.webhook_secret,
            payload,
            header,
            self.config.signature_tolerance_secs,
            Utc::now().timestamp(),
        )?;

        let event: Event = serde_json::from_slice(payload)
            .map_err(|e| ProcessorError::MalformedPayload(e.to_string()))?;
        let normalized = Self::normalize(&event.event_type, event.data.object)?;

        Ok(WebhookEnvelope {
            event_id: event.id,
            event_type: event.event_type,
            event: normalized,
            occurred_at: event
                .created
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::signature::stripe_header;
    use serde_json::json;

    fn processor() -> StripeProcessor {
        StripeProcessor::new(StripeConfig {
            secret_key: "sk_test".into(),
            webhook_secret: "whsec_test".into(),
            api_base: "http://127.0.0.1:9".into(),
            subscription_product: "prod_creator".into(),
            signature_tolerance_secs: 300,
        })
        .unwrap()
    }

    fn deliver(event: serde_json::Value) -> ProcessorResult<WebhookEnvelope> {
        let body = serde_json::to_vec(&event).unwrap();
        let header = stripe_header("whsec_test", &body, Utc::now().timestamp());
        processor().decode_webhook(&body, Some(&header))
    }

    #[test]
    fn test_payment_intent_succeeded_maps_to_sale() {
        let tx_id = Uuid::new_v4();
        let envelope = deliver(json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": {"object": {
                "id": "pi_1", "status": "succeeded", "amount": 500,
                "metadata": {"transaction_id": tx_id.to_string()}
            }}
        }))
        .unwrap();

        assert_eq!(envelope.event_id, "evt_1");
        assert_eq!(
            envelope.event,
            NormalizedEvent::SaleSucceeded {
                processor_tx_id: "pi_1".into(),
                amount: 500,
                user_ref: tx_id.to_string(),
                subscription_ref: None,
            }
        );
        assert!(envelope.occurred_at.is_some());
    }

    #[test]
    fn test_invoice_events_split_on_billing_reason() {
        let first = deliver(json!({
            "id": "evt_2",
            "type": "invoice.payment_succeeded",
            "data": {"object": {
                "id": "in_1", "subscription": "sub_1", "payment_intent": "pi_2",
                "amount_paid": 999, "billing_reason": "subscription_create",
                "subscription_details": {"metadata": {"transaction_id": "abc"}}
            }}
        }))
        .unwrap();
        assert!(matches!(
            first.event,
            NormalizedEvent::SaleSucceeded { ref subscription_ref, .. } if subscription_ref.as_deref() == Some("sub_1")
        ));

        let renewal = deliver(json!({
            "id": "evt_3",
            "type": "invoice.payment_succeeded",
            "data": {"object": {
                "id": "in_2", "subscription": "sub_1", "payment_intent": "pi_3",
                "amount_paid": 999, "billing_reason": "subscription_cycle"
            }}
        }))
        .unwrap();
        assert_eq!(
            renewal.event,
            NormalizedEvent::RenewalSucceeded {
                subscription_id: "sub_1".into(),
                amount: 999,
                processor_tx_id: "pi_3".into(),
            }
        );
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let envelope = deliver(json!({
            "id": "evt_4",
            "type": "customer.updated",
            "data": {"object": {"id": "cus_1"}}
        }))
        .unwrap();
        assert_eq!(envelope.event.name(), "ignored");
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let body = br#"{"id":"evt_5","type":"charge.refunded","data":{"object":{}}}"#;
        let header = stripe_header("wrong_secret", body, Utc::now().timestamp());
        assert!(matches!(
            processor().decode_webhook(body, Some(&header)),
            Err(ProcessorError::SignatureInvalid)
        ));
        assert!(matches!(
            processor().decode_webhook(body, None),
            Err(ProcessorError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_error_mapping() {
        let declined = StripeProcessor::map_error(
            StatusCode::PAYMENT_REQUIRED,
            Some(ApiError {
                error_type: Some("card_error".into()),
                code: Some("card_declined".into()),
                message: Some("Your card was declined.".into()),
            }),
        );
        assert!(matches!(declined, ProcessorError::Declined(_)));
        assert!(StripeProcessor::map_error(StatusCode::BAD_GATEWAY, None).is_transient());
    }
}
