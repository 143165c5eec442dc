use super::validate;
use crate::domain::{ContentKind, Transaction, TransactionStatus};
use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::{Deposit, PaymentService, PurchaseContent, SendTip};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct TipRequest {
    pub recipient_id: Uuid,
    /// Minor units
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[validate(length(max = 500))]
    pub message: Option<String>,
    pub payment_method_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub content_id: Uuid,
    pub content_kind: ContentKind,
    pub amount: i64,
    pub payment_method_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DepositRequest {
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub processor: Option<String>,
    pub payment_method_id: Option<Uuid>,
}

/// Settled charges answer 201, charges awaiting the processor 202
fn payment_response(tx: Transaction) -> HttpResponse {
    match tx.status {
        TransactionStatus::Pending => HttpResponse::Accepted().json(tx),
        _ => HttpResponse::Created().json(tx),
    }
}

/// POST /api/v1/payments/tips
pub async fn send_tip(
    service: web::Data<Arc<PaymentService>>,
    user: UserId,
    req: web::Json<TipRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let tx = service
        .send_tip(SendTip {
            payer_id: user.0,
            recipient_id: req.recipient_id,
            amount: req.amount,
            currency: req.currency,
            message: req.message,
            payment_method_id: req.payment_method_id,
        })
        .await?;
    Ok(payment_response(tx))
}

/// POST /api/v1/payments/purchases
pub async fn purchase_content(
    service: web::Data<Arc<PaymentService>>,
    user: UserId,
    req: web::Json<PurchaseRequest>,
) -> Result<HttpResponse, ServiceError> {
    let req = req.into_inner();
    let tx = service
        .purchase_content(PurchaseContent {
            payer_id: user.0,
            content_id: req.content_id,
            content_kind: req.content_kind,
            amount: req.amount,
            payment_method_id: req.payment_method_id,
        })
        .await?;
    Ok(payment_response(tx))
}

/// POST /api/v1/payments/deposits
pub async fn deposit(
    service: web::Data<Arc<PaymentService>>,
    user: UserId,
    req: web::Json<DepositRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let tx = service
        .deposit(Deposit {
            payer_id: user.0,
            amount: req.amount,
            currency: req.currency,
            processor: req.processor,
            payment_method_id: req.payment_method_id,
        })
        .await?;
    Ok(payment_response(tx))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/payments")
            .route("/tips", web::post().to(send_tip))
            .route("/purchases", web::post().to(purchase_content))
            .route("/deposits", web::post().to(deposit)),
    );
}
