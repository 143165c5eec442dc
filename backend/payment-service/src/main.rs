/// Payment Service - HTTP Server
///
/// Ledger API, processor webhooks, and the background jobs that retry
/// deferred webhook deliveries and sweep lapsed subscriptions.
use actix_web::{middleware as actix_middleware, App, HttpServer};
use anyhow::{Context, Result};
use payment_service::directory::{PgContentCatalog, PgUserDirectory};
use payment_service::handlers::{self, AppState};
use payment_service::middleware::JwtVerifier;
use payment_service::notifications::{
    LogNotificationSink, NotificationSink, OutboxNotificationSink,
};
use payment_service::processors::{
    CcbillProcessor, CircuitBreakerConfig, ProcessorRegistry, StripeProcessor,
};
use payment_service::repository::{LedgerStore, PgLedgerStore};
use payment_service::services::{
    LedgerService, PaymentMethodService, PaymentService, SubscriptionService, WebhookReconciler,
    WithdrawalService,
};
use payment_service::workers::{
    start_subscription_sweep, start_webhook_retry, SubscriptionSweep, SweepConfig,
    WebhookRetryConfig,
};
use payment_service::Config;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};
use webhook_inbox::{InboxStore, PgInbox};

fn init_tracing(log_format: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "payment_service=info,info".into());
    if log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn build_processors(config: &Config) -> Result<ProcessorRegistry> {
    let breaker = CircuitBreakerConfig {
        failure_threshold: config.processors.breaker_failure_threshold,
        open_timeout: Duration::from_secs(config.processors.breaker_open_secs),
        ..CircuitBreakerConfig::default()
    };
    let timeout = config.processors.call_timeout();
    let mut registry = ProcessorRegistry::new();

    if let Some(stripe) = &config.processors.stripe {
        let adapter = StripeProcessor::new(stripe.clone()).context("Failed to build Stripe client")?;
        registry.register(Arc::new(adapter), timeout, breaker.clone());
        info!("✅ Stripe processor registered");
    }
    if let Some(ccbill) = &config.processors.ccbill {
        let adapter = CcbillProcessor::new(ccbill.clone()).context("Failed to build CCBill client")?;
        registry.register(Arc::new(adapter), timeout, breaker.clone());
        info!("✅ CCBill processor registered");
    }
    if registry.is_empty() {
        warn!("No payment processors configured; requests that need a processor will be rejected");
    }
    Ok(registry)
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.app.log_format);

    info!("Starting payment-service (env: {})", config.app.env);

    let pg_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.database.max_lifetime_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!(
        "✅ Database pool initialized with {} max connections",
        config.database.max_connections
    );

    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("✅ Database migrations completed");

    let processors = build_processors(&config)?;

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pg_pool.clone()));
    let inbox: Arc<dyn InboxStore> = Arc::new(PgInbox::new(pg_pool.clone()));
    let directory = Arc::new(PgUserDirectory::new(pg_pool.clone()));
    let catalog = Arc::new(PgContentCatalog::new(pg_pool.clone()));
    let notifier: Arc<dyn NotificationSink> = match config.app.notification_sink.as_str() {
        "outbox" => Arc::new(OutboxNotificationSink::new(pg_pool.clone())),
        _ => Arc::new(LogNotificationSink::default()),
    };

    let ledger = Arc::new(LedgerService::new(
        Arc::clone(&store),
        config.fees.clone(),
        notifier,
    ));
    let subscriptions = Arc::new(SubscriptionService::new(
        Arc::clone(&ledger),
        processors.clone(),
        directory.clone(),
    ));
    let payments = Arc::new(PaymentService::new(
        Arc::clone(&ledger),
        processors.clone(),
        directory.clone(),
        catalog,
        config.app.default_currency.clone(),
    ));
    let withdrawals = Arc::new(WithdrawalService::new(
        Arc::clone(&store),
        directory,
        config.fees.withdrawal_fee_bps,
        config.app.default_currency.clone(),
    ));
    let payment_methods = Arc::new(PaymentMethodService::new(
        Arc::clone(&store),
        processors.clone(),
    ));
    let reconciler = Arc::new(WebhookReconciler::new(
        Arc::clone(&ledger),
        Arc::clone(&subscriptions),
        processors,
        Arc::clone(&inbox),
        config.webhooks.retry_policy(),
        config.webhooks.lease(),
    ));
    let verifier = Arc::new(JwtVerifier::new(
        &config.auth.jwt_secret,
        config.auth.jwt_issuer.as_deref(),
    ));

    let state = AppState {
        store,
        ledger: Arc::clone(&ledger),
        payments,
        subscriptions: Arc::clone(&subscriptions),
        withdrawals,
        payment_methods,
        reconciler: Arc::clone(&reconciler),
        verifier,
        default_currency: config.app.default_currency.clone(),
    };

    let bind_address = format!("{}:{}", config.app.host, config.app.http_port);
    let server = HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .wrap(actix_middleware::Logger::default())
            .configure(move |cfg| handlers::configure(cfg, &state))
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .shutdown_timeout(30)
    .run();

    // Workers loop until aborted; the server stops itself on SIGINT/SIGTERM
    let mut workers = JoinSet::new();

    let retry_config = WebhookRetryConfig::from(&config.workers);
    workers.spawn(start_webhook_retry(Arc::clone(&reconciler), retry_config));
    info!("✅ Webhook retry worker started");

    let sweep = Arc::new(SubscriptionSweep::new(
        ledger,
        subscriptions,
        inbox,
        SweepConfig::from_config(&config.workers, &config.webhooks),
    ));
    workers.spawn(start_subscription_sweep(sweep));
    info!("✅ Subscription sweep started");

    info!("🎉 payment-service listening on {}", bind_address);
    let result = server.await.context("HTTP server error");

    info!("🛑 payment-service shutting down");
    workers.shutdown().await;
    result
}
