/// Processor webhook receiver
///
/// Unauthenticated: each processor signs its deliveries and the adapter
/// verifies the signature before anything is stored. A 200 means the event
/// is durably queued, whether or not it could be applied yet.
use crate::error::ServiceError;
use crate::services::{IngestOutcome, WebhookReconciler};
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use std::sync::Arc;

/// Headers that carry a delivery signature, by processor
const SIGNATURE_HEADERS: &[&str] = &["Stripe-Signature", "X-CCBill-Signature"];

fn signature_header(req: &HttpRequest) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| req.headers().get(*name))
        .and_then(|value| value.to_str().ok())
}

/// POST /api/v1/webhooks/{processor}
pub async fn receive_webhook(
    reconciler: web::Data<Arc<WebhookReconciler>>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ServiceError> {
    let processor = path.into_inner();
    let outcome = reconciler
        .ingest(&processor, &body, signature_header(&req))
        .await?;

    let response = match outcome {
        IngestOutcome::Queued {
            event_id,
            disposition,
        } => json!({
            "received": true,
            "event_id": event_id,
            "status": disposition.label(),
        }),
        IngestOutcome::Duplicate { event_id } => json!({
            "received": true,
            "event_id": event_id,
            "status": "duplicate",
        }),
    };
    Ok(HttpResponse::Ok().json(response))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/webhooks").route("/{processor}", web::post().to(receive_webhook)),
    );
}
