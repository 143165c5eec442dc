use crate::metrics;
use crate::repository::LedgerStore;
use crate::services::WebhookReconciler;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok", "service": "payment-service" }))
}

/// GET /health/ready
///
/// Ready when the database answers. Inbox backlog is reported but does not
/// make the instance unready.
pub async fn readiness(
    store: web::Data<Arc<dyn LedgerStore>>,
    reconciler: web::Data<Arc<WebhookReconciler>>,
) -> HttpResponse {
    if let Err(e) = store.ping().await {
        tracing::warn!(error = %e, "Readiness check failed: database unavailable");
        return HttpResponse::ServiceUnavailable().json(json!({
            "status": "unavailable",
            "database": "down",
        }));
    }

    match reconciler.stats().await {
        Ok(stats) => HttpResponse::Ok().json(json!({
            "status": "ready",
            "database": "up",
            "webhook_inbox": stats,
        })),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read webhook inbox stats");
            HttpResponse::Ok().json(json!({ "status": "ready", "database": "up" }))
        }
    }
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/health/ready", web::get().to(readiness))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}
