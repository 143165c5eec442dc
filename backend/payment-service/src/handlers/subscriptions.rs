use super::{validate, DefaultCurrency, PageQuery};
use crate::domain::BillingCycle;
use crate::error::ServiceError;
use crate::middleware::UserId;
use crate::services::{
    CreateSubscription, SubscriptionService, SubscriptionStarted, UpdateSubscription,
};
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub creator_id: Uuid,
    /// Minor units per billing cycle
    pub price: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub billing_cycle: BillingCycle,
    #[validate(range(max = 90))]
    pub trial_days: Option<u32>,
    pub payment_method_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateSubscriptionRequest {
    #[validate(range(min = 1))]
    pub price: Option<i64>,
    pub billing_cycle: Option<BillingCycle>,
    pub auto_renew: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Serialize)]
struct SubscriptionResponse {
    subscription: crate::domain::Subscription,
    initial_charge: Option<crate::domain::Transaction>,
}

impl From<SubscriptionStarted> for SubscriptionResponse {
    fn from(started: SubscriptionStarted) -> Self {
        Self {
            subscription: started.subscription,
            initial_charge: started.initial_charge,
        }
    }
}

/// POST /api/v1/subscriptions
pub async fn create_subscription(
    service: web::Data<Arc<SubscriptionService>>,
    default_currency: web::Data<DefaultCurrency>,
    user: UserId,
    req: web::Json<CreateSubscriptionRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let started = service
        .create(CreateSubscription {
            fan_id: user.0,
            creator_id: req.creator_id,
            price: req.price,
            currency: req.currency.unwrap_or_else(|| default_currency.0.clone()),
            billing_cycle: req.billing_cycle,
            trial_days: req.trial_days,
            payment_method_id: req.payment_method_id,
        })
        .await?;
    Ok(HttpResponse::Created().json(SubscriptionResponse::from(started)))
}

/// GET /api/v1/subscriptions
pub async fn list_subscriptions(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ServiceError> {
    let subscriptions = service.list(user.0, query.page, query.limit).await?;
    Ok(HttpResponse::Ok().json(subscriptions))
}

/// GET /api/v1/subscriptions/{id}
pub async fn get_subscription(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let subscription = service.get(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(subscription))
}

/// PATCH /api/v1/subscriptions/{id}
pub async fn update_subscription(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    path: web::Path<Uuid>,
    req: web::Json<UpdateSubscriptionRequest>,
) -> Result<HttpResponse, ServiceError> {
    validate(&*req)?;
    let req = req.into_inner();
    let subscription = service
        .update(
            user.0,
            path.into_inner(),
            UpdateSubscription {
                price: req.price,
                billing_cycle: req.billing_cycle,
                auto_renew: req.auto_renew,
            },
        )
        .await?;
    Ok(HttpResponse::Ok().json(subscription))
}

/// GET /api/v1/subscriptions/{id}/status
pub async fn subscription_status(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let access = service.status(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(access))
}

/// POST /api/v1/subscriptions/{id}/cancel
pub async fn cancel_subscription(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    path: web::Path<Uuid>,
    req: Option<web::Json<CancelRequest>>,
) -> Result<HttpResponse, ServiceError> {
    let immediate = req.map(|r| r.immediate).unwrap_or(false);
    let subscription = service
        .cancel(user.0, path.into_inner(), immediate)
        .await?;
    Ok(HttpResponse::Ok().json(subscription))
}

/// POST /api/v1/subscriptions/{id}/reactivate
pub async fn reactivate_subscription(
    service: web::Data<Arc<SubscriptionService>>,
    user: UserId,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ServiceError> {
    let started = service.reactivate(user.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(SubscriptionResponse::from(started)))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/subscriptions")
            .route("", web::post().to(create_subscription))
            .route("", web::get().to(list_subscriptions))
            .route("/{id}", web::get().to(get_subscription))
            .route("/{id}", web::patch().to(update_subscription))
            .route("/{id}/status", web::get().to(subscription_status))
            .route("/{id}/cancel", web::post().to(cancel_subscription))
            .route("/{id}/reactivate", web::post().to(reactivate_subscription)),
    );
}
