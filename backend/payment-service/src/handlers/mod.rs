/// HTTP handlers for payment-service API
///
/// Everything under `/api/v1` requires a bearer token except the processor
/// webhooks, which authenticate by signature.
pub mod earnings;
pub mod health;
pub mod payment_methods;
pub mod payments;
pub mod subscriptions;
pub mod transactions;
pub mod webhooks;
pub mod withdrawals;

use crate::error::ServiceError;
use crate::middleware::{JwtAuthMiddleware, JwtVerifier};
use crate::repository::LedgerStore;
use crate::services::{
    LedgerService, PaymentMethodService, PaymentService, SubscriptionService, WebhookReconciler,
    WithdrawalService,
};
use actix_web::web;
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

/// Services shared by all workers of the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub ledger: Arc<LedgerService>,
    pub payments: Arc<PaymentService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub payment_methods: Arc<PaymentMethodService>,
    pub reconciler: Arc<WebhookReconciler>,
    pub verifier: Arc<JwtVerifier>,
    pub default_currency: String,
}

/// Currency used when a request leaves it out
#[derive(Debug, Clone)]
pub struct DefaultCurrency(pub String);

/// Register app data and every route
pub fn configure(cfg: &mut web::ServiceConfig, state: &AppState) {
    cfg.app_data(web::Data::new(Arc::clone(&state.store)))
        .app_data(web::Data::new(Arc::clone(&state.ledger)))
        .app_data(web::Data::new(Arc::clone(&state.payments)))
        .app_data(web::Data::new(Arc::clone(&state.subscriptions)))
        .app_data(web::Data::new(Arc::clone(&state.withdrawals)))
        .app_data(web::Data::new(Arc::clone(&state.payment_methods)))
        .app_data(web::Data::new(Arc::clone(&state.reconciler)))
        .app_data(web::Data::new(DefaultCurrency(state.default_currency.clone())));

    health::register_routes(cfg);
    // Registered before the authenticated scope so the longer prefix wins
    webhooks::register_routes(cfg);

    cfg.service(
        web::scope("/api/v1")
            .wrap(JwtAuthMiddleware::new(Arc::clone(&state.verifier)))
            .configure(payment_methods::register_routes)
            .configure(payments::register_routes)
            .configure(transactions::register_routes)
            .configure(subscriptions::register_routes)
            .configure(withdrawals::register_routes)
            .configure(earnings::register_routes),
    );
}

/// `?page=&limit=` on list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// Run `validator` checks, mapping failures to a 400
pub(crate) fn validate<T: Validate>(request: &T) -> Result<(), ServiceError> {
    request
        .validate()
        .map_err(|e| ServiceError::Validation(e.to_string()))
}
