use super::validate;
use crate::domain::PaymentMethodKind;
use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::{AttachPaymentMethod, PaymentMethodService, UpdatePaymentMethod};
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct AttachPaymentMethodRequest {
    #[validate(length(min = 1, max = 32))]
    pub processor: String,
    /// Client-side token from the processor's SDK
    #[validate(length(min = 1, max = 512))]
    pub token: String,
    #[serde(default = "default_kind")]
    pub kind: PaymentMethodKind,
    #[serde(default)]
    pub make_default: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePaymentMethodRequest {
    pub expires_at: Option<DateTime<Utc>>,
    pub billing_address: Option<serde_json::Value>,
}

fn default_kind() -> PaymentMethodKind {
    PaymentMethodKind::Card
}

/// POST /api/v1/payment-methods
pub async fn attach_payment_method(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
    req: web::Json<AttachPaymentMethodRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let method = service
        .attach(AttachPaymentMethod {
            user_id: user.0,
            processor: req.processor,
            token: req.token,
            kind: req.kind,
            make_default: req.make_default,
        })
        .await?;
    Ok(HttpResponse::Created().json(method))
}

/// GET /api/v1/payment-methods
pub async fn list_payment_methods(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
) -> Result<HttpResponse, ServiceError> {
    let methods = service.list(user.0).await?;
    Ok(HttpResponse::Ok().json(methods))
}

/// PUT /api/v1/payment-methods/{id}/default
pub async fn set_default_payment_method(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let method = service.set_default(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(method))
}

/// PATCH /api/v1/payment-methods/{id}
pub async fn update_payment_method(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
    path: web::Path<Uuid>,
    req: web::Json<UpdatePaymentMethodRequest>,
) -> Result<HttpResponse, ServiceError> {
    let req = req.into_inner();
    let method = service
        .update(
            user.0,
            path.into_inner(),
            UpdatePaymentMethod {
                expires_at: req.expires_at,
                billing_address: req.billing_address,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(method))
}

/// DELETE /api/v1/payment-methods/{id}
pub async fn delete_payment_method(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let promoted = service.delete(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "deleted": true,
        "default_payment_method_id": promoted.map(|m| m.id),
    })))
}

/// POST /api/v1/payment-methods/{id}/verify
pub async fn verify_payment_method(
    service: web::Data<Arc<PaymentMethodService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let method = service.verify(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(method))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/payment-methods")
            .route("", web::post().to(attach_payment_method))
            .route("", web::get().to(list_payment_methods))
            .route("/{id}", web::patch().to(update_payment_method))
            .route("/{id}", web::delete().to(delete_payment_method))
            .route("/{id}/default", web::put().to(set_default_payment_method))
            .route("/{id}/verify", web::post().to(verify_payment_method)),
    );
}
