use super::string_enum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    BankAccount,
    CryptoWallet,
}

string_enum!(PaymentMethodKind, "payment method kind", {
    Card => "card",
    BankAccount => "bank_account",
    CryptoWallet => "crypto_wallet",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub processor: String,
    pub kind: PaymentMethodKind,
    /// Processor-side handle (Stripe payment method id, CCBill token)
    pub processor_reference: String,
    pub last_four: Option<String>,
    pub brand: Option<String>,
    pub is_default: bool,
    pub is_verified: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub billing_address: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Owner-editable fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct PaymentMethodPatch {
    pub expires_at: Option<DateTime<Utc>>,
    pub billing_address: Option<serde_json::Value>,
    pub is_verified: Option<bool>,
}

impl PaymentMethodPatch {
    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none() && self.billing_address.is_none() && self.is_verified.is_none()
    }

    pub fn apply(&self, method: &mut PaymentMethod) {
        if let Some(expires_at) = self.expires_at {
            method.expires_at = Some(expires_at);
        }
        if let Some(address) = &self.billing_address {
            method.billing_address = Some(address.clone());
        }
        if let Some(verified) = self.is_verified {
            method.is_verified = verified;
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentMethod {
    pub user_id: Uuid,
    pub processor: String,
    pub kind: PaymentMethodKind,
    pub processor_reference: String,
    pub last_four: Option<String>,
    pub brand: Option<String>,
    pub is_verified: bool,
    pub make_default: bool,
}

impl NewPaymentMethod {
    pub fn into_method(self, now: DateTime<Utc>) -> PaymentMethod {
        PaymentMethod {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            processor: self.processor,
            kind: self.kind,
            processor_reference: self.processor_reference,
            last_four: self.last_four,
            brand: self.brand,
            is_default: self.make_default,
            is_verified: self.is_verified,
            expires_at: None,
            billing_address: None,
            created_at: now,
        }
    }
}
