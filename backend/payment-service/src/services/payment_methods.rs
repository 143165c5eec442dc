/// Stored payment methods. Card data never reaches this service; the
/// processor exchanges a client-side token for a reusable reference.
use crate::domain::{NewPaymentMethod, PaymentMethod, PaymentMethodKind, PaymentMethodPatch};
use crate::error::{ServiceError, ServiceResult};
use crate::processors::{GuardedProcessor, ProcessorRegistry};
use crate::repository::LedgerStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AttachPaymentMethod {
    pub user_id: Uuid,
    pub processor: String,
    pub token: String,
    pub kind: PaymentMethodKind,
    pub make_default: bool,
}

/// Owner-editable details of a stored method
#[derive(Debug, Clone, Default)]
pub struct UpdatePaymentMethod {
    pub expires_at: Option<DateTime<Utc>>,
    pub billing_address: Option<serde_json::Value>,
}

pub struct PaymentMethodService {
    store: Arc<dyn LedgerStore>,
    processors: ProcessorRegistry,
}

impl PaymentMethodService {
    pub fn new(store: Arc<dyn LedgerStore>, processors: ProcessorRegistry) -> Self {
        Self { store, processors }
    }

    /// Exchange the token with the processor and store the result. The first
    /// method a user attaches becomes the default.
    pub async fn attach(&self, request: AttachPaymentMethod) -> ServiceResult<PaymentMethod> {
        let token = request.token.trim();
        if token.is_empty() {
            return Err(ServiceError::Validation(
                "payment method token is required".to_string(),
            ));
        }
        let processor = self
            .processors
            .get(&request.processor)
            .ok_or_else(|| ServiceError::UnknownProcessor(request.processor.clone()))?;

        let attached = processor
            .attach_payment_method(request.user_id, token, request.kind)
            .await?;

        let method = self
            .store
            .insert_payment_method(NewPaymentMethod {
                user_id: request.user_id,
                processor: request.processor,
                kind: attached.kind,
                processor_reference: attached.processor_reference,
                last_four: attached.last_four,
                brand: attached.brand,
                is_verified: attached.is_verified,
                make_default: request.make_default,
            })
            .await?;

        info!(
            payment_method_id = %method.id,
            user_id = %method.user_id,
            processor = %method.processor,
            kind = %method.kind,
            "Payment method attached"
        );
        Ok(method)
    }

    /// Default first, then newest
    pub async fn list(&self, user_id: Uuid) -> ServiceResult<Vec<PaymentMethod>> {
        Ok(self.store.list_payment_methods(user_id).await?)
    }

    pub async fn set_default(&self, user_id: Uuid, method_id: Uuid) -> ServiceResult<PaymentMethod> {
        Ok(self
            .store
            .set_default_payment_method(user_id, method_id)
            .await?)
    }

    pub async fn update(
        &self,
        user_id: Uuid,
        method_id: Uuid,
        changes: UpdatePaymentMethod,
    ) -> ServiceResult<PaymentMethod> {
        if let Some(address) = &changes.billing_address {
            if !address.is_object() {
                return Err(ServiceError::Validation(
                    "billing address must be an object".to_string(),
                ));
            }
        }
        let patch = PaymentMethodPatch {
            expires_at: changes.expires_at,
            billing_address: changes.billing_address,
            is_verified: None,
        };
        if patch.is_empty() {
            return Err(ServiceError::Validation("nothing to update".to_string()));
        }

        let method = self
            .store
            .update_payment_method(user_id, method_id, &patch)
            .await?;
        info!(payment_method_id = %method.id, user_id = %user_id, "Payment method updated");
        Ok(method)
    }

    /// Detach at the processor, then drop the method from the user's list.
    /// Returns the method promoted to default, if the removed one was the
    /// default and another remains.
    pub async fn delete(&self, user_id: Uuid, method_id: Uuid) -> ServiceResult<Option<PaymentMethod>> {
        let method = self.owned(user_id, method_id).await?;
        self.processor(&method)?
            .detach_payment_method(&method)
            .await?;

        let promoted = self.store.delete_payment_method(user_id, method_id).await?;
        info!(
            payment_method_id = %method_id,
            user_id = %user_id,
            promoted_default = ?promoted.as_ref().map(|m| m.id),
            "Payment method removed"
        );
        Ok(promoted)
    }

    /// Re-check the method with its processor. A decline leaves the stored
    /// flag untouched.
    pub async fn verify(&self, user_id: Uuid, method_id: Uuid) -> ServiceResult<PaymentMethod> {
        let method = self.owned(user_id, method_id).await?;
        if let Err(e) = self.processor(&method)?.verify_payment_method(&method).await {
            warn!(payment_method_id = %method_id, error = %e, "Payment method verification failed");
            return Err(e.into());
        }

        let patch = PaymentMethodPatch {
            is_verified: Some(true),
            ..PaymentMethodPatch::default()
        };
        let verified = self
            .store
            .update_payment_method(user_id, method_id, &patch)
            .await?;
        info!(payment_method_id = %method_id, user_id = %user_id, "Payment method verified");
        Ok(verified)
    }

    async fn owned(&self, user_id: Uuid, method_id: Uuid) -> ServiceResult<PaymentMethod> {
        match self.store.find_payment_method(method_id).await? {
            Some(method) if method.user_id == user_id => Ok(method),
            _ => Err(ServiceError::NotFound(format!("payment method {}", method_id))),
        }
    }

    fn processor(&self, method: &PaymentMethod) -> ServiceResult<Arc<GuardedProcessor>> {
        self.processors
            .get(&method.processor)
            .ok_or_else(|| ServiceError::UnknownProcessor(method.processor.clone()))
    }
}
