use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::LedgerService;
use actix_web::{web, HttpResponse};
use std::sync::Arc;

/// GET /api/v1/earnings
pub async fn get_earnings(
    ledger: web::Data<Arc<LedgerService>>,
    user: UserId,
) -> Result<HttpResponse, ServiceError> {
    let earnings = ledger.earnings(user.0).await?;
    Ok(HttpResponse::Ok().json(earnings))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/earnings", web::get().to(get_earnings));
}
