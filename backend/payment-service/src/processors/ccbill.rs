//! CCBill adapter.
//!
//! Charges run against payment tokens created client-side and are always
//! confirmed asynchronously: `charge` returns `Pending` and the
//! `NewSaleSuccess` webhook settles the transaction. Webhooks are JSON with
//! an `X-CCBill-Signature` hex HMAC-SHA256 over the raw body, keyed by the
//! account salt. Amounts on the wire are decimal strings.

use super::signature::verify_hex;
use super::{
    minor_to_decimal, parse_decimal_minor, AttachedMethod, ChargeOutcome, ProcessorAdapter,
    ProcessorError, ProcessorResult, RecurringRequest, RecurringUpdate,
};
use crate::config::CcbillConfig;
use crate::domain::{
    BillingCycle, NormalizedEvent, PaymentMethod, PaymentMethodKind, Transaction, WebhookEnvelope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const NAME: &str = "ccbill";

/// Pass-through field carrying the ledger transaction id
const REFERENCE_FIELD: &str = "X-transaction_id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentToken {
    payment_token_id: String,
    card_type: Option<String>,
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeResponse {
    transaction_id: Option<String>,
    subscription_id: Option<String>,
    declined: Option<bool>,
    decline_text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PassThrough {
    name: &'static str,
    value: String,
}

/// Flat CCBill webhook body; which fields are present depends on the event
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody {
    event_type: String,
    event_id: Option<String>,
    timestamp: Option<String>,
    transaction_id: Option<String>,
    subscription_id: Option<String>,
    billed_initial_price: Option<String>,
    billed_recurring_price: Option<String>,
    accounting_amount: Option<String>,
    failure_reason: Option<String>,
    #[serde(rename = "X-transaction_id")]
    reference: Option<String>,
}

impl WebhookBody {
    fn require<'a>(value: &'a Option<String>, field: &str) -> ProcessorResult<&'a str> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProcessorError::MalformedPayload(format!("missing {}", field)))
    }

    fn amount(&self, primary: &Option<String>) -> ProcessorResult<i64> {
        let raw = primary
            .as_deref()
            .or(self.accounting_amount.as_deref())
            .ok_or_else(|| ProcessorError::MalformedPayload("missing amount".to_string()))?;
        parse_decimal_minor(raw)
            .ok_or_else(|| ProcessorError::MalformedPayload(format!("bad amount '{}'", raw)))
    }

    /// CCBill does not always send an event id; derive a stable one
    fn event_id(&self) -> String {
        if let Some(id) = self.event_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let subject = self
            .transaction_id
            .as_deref()
            .or(self.subscription_id.as_deref())
            .unwrap_or("-");
        match self.timestamp.as_deref() {
            Some(ts) => format!("{}:{}:{}", self.event_type, subject, ts),
            None => format!("{}:{}", self.event_type, subject),
        }
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    fn normalize(&self) -> ProcessorResult<NormalizedEvent> {
        let event = match self.event_type.as_str() {
            "NewSaleSuccess" => NormalizedEvent::SaleSucceeded {
                processor_tx_id: Self::require(&self.transaction_id, "transactionId")?.to_string(),
                amount: self.amount(&self.billed_initial_price)?,
                user_ref: Self::require(&self.reference, REFERENCE_FIELD)?.to_string(),
                subscription_ref: self.subscription_id.clone(),
            },
            "NewSaleFailure" => NormalizedEvent::SaleFailed {
                user_ref: Self::require(&self.reference, REFERENCE_FIELD)?.to_string(),
                reason: self
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "sale failed".to_string()),
            },
            "RenewalSuccess" => NormalizedEvent::RenewalSucceeded {
                subscription_id: Self::require(&self.subscription_id, "subscriptionId")?
                    .to_string(),
                amount: self.amount(&self.billed_recurring_price)?,
                processor_tx_id: Self::require(&self.transaction_id, "transactionId")?.to_string(),
            },
            "RenewalFailure" => NormalizedEvent::RenewalFailed {
                subscription_id: Self::require(&self.subscription_id, "subscriptionId")?
                    .to_string(),
                reason: self
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "renewal failed".to_string()),
            },
            "Cancellation" | "Expiration" => NormalizedEvent::Cancelled {
                subscription_id: Self::require(&self.subscription_id, "subscriptionId")?
                    .to_string(),
            },
            "Chargeback" => NormalizedEvent::Chargeback {
                processor_tx_id: Self::require(&self.transaction_id, "transactionId")?.to_string(),
            },
            "Refund" => NormalizedEvent::Refunded {
                processor_tx_id: Self::require(&self.transaction_id, "transactionId")?.to_string(),
            },
            other => NormalizedEvent::Ignored {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }
}

pub struct CcbillProcessor {
    client: Client,
    config: CcbillConfig,
}

impl CcbillProcessor {
    pub fn new(config: CcbillConfig) -> ProcessorResult<Self> {
        let client = Client::builder()
            .user_agent("payment-service")
            .build()
            .map_err(|e| ProcessorError::NotConfigured(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ProcessorResult<T> {
        let response = request
            .bearer_auth(&self.config.api_token)
            .header("Accept", "application/vnd.mcn.transaction-service.api.v.2+json")
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = response.text().await.unwrap_or_default();
        Err(if status == StatusCode::PAYMENT_REQUIRED {
            ProcessorError::Declined(message)
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProcessorError::Unavailable(format!("{}: {}", status, message))
        } else {
            ProcessorError::MalformedPayload(format!("{}: {}", status, message))
        })
    }

    fn period_days(cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }

    fn check_declined(response: &ChargeResponse) -> ProcessorResult<()> {
        if response.declined.unwrap_or(false) {
            return Err(ProcessorError::Declined(
                response
                    .decline_text
                    .clone()
                    .unwrap_or_else(|| "declined".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessorAdapter for CcbillProcessor {
    fn name(&self) -> &str {
        NAME
    }

    async fn attach_payment_method(
        &self,
        user_id: Uuid,
        token: &str,
        kind: PaymentMethodKind,
    ) -> ProcessorResult<AttachedMethod> {
        if kind != PaymentMethodKind::Card {
            return Err(ProcessorError::Unsupported(format!(
                "ccbill payment tokens are card-only, got {}",
                kind
            )));
        }

        let token: PaymentToken = self
            .send(self.client.get(self.url(&format!("/payment-tokens/{}", token))))
            .await?;
        tracing::debug!(user_id = %user_id, "CCBill payment token resolved");

        Ok(AttachedMethod {
            processor_reference: token.payment_token_id,
            kind,
            last_four: token.last4,
            brand: token.card_type,
            is_verified: true,
        })
    }

    async fn charge(
        &self,
        transaction: &Transaction,
        method: &PaymentMethod,
    ) -> ProcessorResult<ChargeOutcome> {
        let pass_through = vec![PassThrough {
            name: REFERENCE_FIELD,
            value: transaction.id.to_string(),
        }];
        let body = json!({
            "clientAccnum": self.config.account_number,
            "clientSubacc": self.config.subaccount,
            "initialPrice": minor_to_decimal(transaction.amount),
            "initialPeriod": 2,
            "currencyCode": transaction.currency,
            "passThroughInfo": pass_through,
        });
        let response: ChargeResponse = self
            .send(
                self.client
                    .post(self.url(&format!(
                        "/transactions/payment-tokens/{}",
                        method.processor_reference
                    )))
                    .json(&body),
            )
            .await?;
        Self::check_declined(&response)?;

        let processor_transaction_id = response.transaction_id.ok_or_else(|| {
            ProcessorError::MalformedPayload("charge response without transactionId".to_string())
        })?;
        Ok(ChargeOutcome::Pending {
            processor_transaction_id,
        })
    }

    async fn refund(&self, transaction: &Transaction, reason: &str) -> ProcessorResult<()> {
        let processor_tx = transaction.processor_transaction_id.as_deref().ok_or_else(|| {
            ProcessorError::MalformedPayload(format!(
                "transaction {} has no processor transaction id",
                transaction.id
            ))
        })?;
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(self.url(&format!("/transactions/{}/refunds", processor_tx)))
                    .json(&json!({
                        "amount": minor_to_decimal(transaction.amount),
                        "reason": reason,
                    })),
            )
            .await?;
        Ok(())
    }

    async fn detach_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        let _: serde_json::Value = self
            .send(self.client.delete(self.url(&format!(
                "/payment-tokens/{}",
                method.processor_reference
            ))))
            .await?;
        Ok(())
    }

    async fn verify_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        // A token that still resolves is still chargeable
        let token: PaymentToken = self
            .send(self.client.get(self.url(&format!(
                "/payment-tokens/{}",
                method.processor_reference
            ))))
            .await?;
        tracing::debug!(token = %token.payment_token_id, "CCBill payment token verified");
        Ok(())
    }

    async fn create_recurring(&self, request: &RecurringRequest) -> ProcessorResult<String> {
        let cycle_days = Self::period_days(request.billing_cycle);
        let (initial_price, initial_period) = match request.trial_end {
            Some(trial_end) => (0, (trial_end - Utc::now()).num_days().max(1)),
            None => (request.price, cycle_days),
        };

        let mut pass_through = vec![PassThrough {
            name: "X-subscription_id",
            value: request.subscription_id.to_string(),
        }];
        if let Some(reference) = request.reference {
            pass_through.push(PassThrough {
                name: REFERENCE_FIELD,
                value: reference.to_string(),
            });
        }

        let body = json!({
            "clientAccnum": self.config.account_number,
            "clientSubacc": self.config.subaccount,
            "initialPrice": minor_to_decimal(initial_price),
            "initialPeriod": initial_period,
            "recurringPrice": minor_to_decimal(request.price),
            "recurringPeriod": cycle_days,
            "rebills": 99,
            "currencyCode": request.currency,
            "passThroughInfo": pass_through,
        });
        let response: ChargeResponse = self
            .send(
                self.client
                    .post(self.url(&format!(
                        "/transactions/payment-tokens/{}",
                        request.payment_method_reference
                    )))
                    .json(&body),
            )
            .await?;
        Self::check_declined(&response)?;

        response.subscription_id.ok_or_else(|| {
            ProcessorError::MalformedPayload(
                "recurring response without subscriptionId".to_string(),
            )
        })
    }

    async fn cancel_recurring(
        &self,
        processor_subscription_id: &str,
        immediate: bool,
    ) -> ProcessorResult<()> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(self.url(&format!(
                        "/subscriptions/{}/cancel",
                        processor_subscription_id
                    )))
                    .json(&json!({ "expireImmediately": immediate })),
            )
            .await?;
        Ok(())
    }

    async fn update_recurring(
        &self,
        processor_subscription_id: &str,
        update: &RecurringUpdate,
    ) -> ProcessorResult<()> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .put(self.url(&format!("/subscriptions/{}", processor_subscription_id)))
                    .json(&json!({
                        "recurringPrice": minor_to_decimal(update.price),
                        "recurringPeriod": Self::period_days(update.billing_cycle),
                        "currencyCode": update.currency,
                        "autoRenew": update.auto_renew,
                    })),
            )
            .await?;
        Ok(())
    }

    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ProcessorResult<WebhookEnvelope> {
        let signature = signature.ok_or(ProcessorError::SignatureInvalid)?;
        verify_hex(&self.config.webhook_salt, payload, signature)?;

        let body: WebhookBody = serde_json::from_slice(payload)
            .map_err(|e| ProcessorError::MalformedPayload(e.to_string()))?;

        Ok(WebhookEnvelope {
            event_id: body.event_id(),
            event_type: body.event_type.clone(),
            event: body.normalize()?,
            occurred_at: body.occurred_at(),
        })
    }
}
