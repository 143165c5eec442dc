use super::validate;
use crate::domain::TransactionKind;
use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::{LedgerService, PaymentService};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct TransactionListQuery {
    pub kind: Option<TransactionKind>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 255))]
    pub reason: String,
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    transaction: crate::domain::Transaction,
    reversal: Option<crate::domain::Transaction>,
}

/// GET /api/v1/transactions?kind=&page=&limit=
pub async fn list_transactions(
    ledger: web::Data<Arc<LedgerService>>,
    user: UserId,
    query: web::Query<TransactionListQuery>,
) -> Result<HttpResponse, ServiceError> {
    let transactions = ledger
        .list_transactions(user.0, query.kind, query.page, query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(transactions))
}

/// GET /api/v1/transactions/{id}
pub async fn get_transaction(
    ledger: web::Data<Arc<LedgerService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let tx = ledger.get_transaction(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(tx))
}

/// POST /api/v1/transactions/{id}/refund
pub async fn request_refund(
    payments: web::Data<Arc<PaymentService>>,
    user: UserId,
    path: web::Path<Uuid>,
    req: web::Json<RefundRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let reversal = payments
        .request_refund(user.0, path.into_inner(), &req.reason)
        .await?;
    Ok(HttpResponse::Ok().json(RefundResponse {
        transaction: reversal.original,
        reversal: reversal.reversal,
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/transactions")
            .route("", web::get().to(list_transactions))
            .route("/{id}", web::get().to(get_transaction))
            .route("/{id}/refund", web::post().to(request_refund)),
    );
}
