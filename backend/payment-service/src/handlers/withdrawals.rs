use super::{validate, PageQuery};
use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::{RequestWithdrawal, WithdrawalService};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawalRequest {
    /// Minor units held from the wallet; the fee is taken out of it
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub payment_method_id: Uuid,
}

/// POST /api/v1/withdrawals
pub async fn request_withdrawal(
    service: web::Data<Arc<WithdrawalService>>,
    user: UserId,
    req: web::Json<WithdrawalRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let withdrawal = service
        .request(RequestWithdrawal {
            creator_id: user.0,
            amount: req.amount,
            currency: req.currency,
            payment_method_id: req.payment_method_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(withdrawal))
}

/// GET /api/v1/withdrawals
pub async fn list_withdrawals(
    service: web::Data<Arc<WithdrawalService>>,
    user: UserId,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ServiceError> {
    let withdrawals = service.list(user.0, query.page, query.limit).await?;
    Ok(HttpResponse::Ok().json(withdrawals))
}

/// GET /api/v1/withdrawals/{id}
pub async fn get_withdrawal(
    service: web::Data<Arc<WithdrawalService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let withdrawal = service.get(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(withdrawal))
}

/// POST /api/v1/withdrawals/{id}/cancel
pub async fn cancel_withdrawal(
    service: web::Data<Arc<WithdrawalService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let withdrawal = service.cancel(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(withdrawal))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/withdrawals")
            .route("", web::post().to(request_withdrawal))
            .route("", web::get().to(list_withdrawals))
            .route("/{id}", web::get().to(get_withdrawal))
            .route("/{id}/cancel", web::post().to(cancel_withdrawal)),
    );
}
