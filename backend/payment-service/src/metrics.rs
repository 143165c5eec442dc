use actix_web::HttpResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    static ref TRANSACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_transactions_total",
        "Ledger transaction state changes",
        &["kind", "outcome"]
    )
    .expect("payment_transactions_total metric can be created");

    static ref LEDGER_AMOUNT_MINOR_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_ledger_amount_minor_total",
        "Minor units moved through wallets",
        &["direction"]
    )
    .expect("payment_ledger_amount_minor_total metric can be created");

    static ref WEBHOOK_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_webhook_events_total",
        "Webhook deliveries by processor and disposition",
        &["processor", "disposition"]
    )
    .expect("payment_webhook_events_total metric can be created");

    static ref INTEGRITY_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_integrity_errors_total",
        "Ledger integrity violations detected",
        &["operation"]
    )
    .expect("payment_integrity_errors_total metric can be created");

    static ref PROCESSOR_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_processor_calls_total",
        "Outbound processor calls",
        &["processor", "operation", "result"]
    )
    .expect("payment_processor_calls_total metric can be created");

    static ref PROCESSOR_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "payment_processor_call_duration_seconds",
        "Outbound processor call latency",
        &["processor", "operation"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("payment_processor_call_duration_seconds metric can be created");

    static ref CIRCUIT_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "payment_circuit_breaker_transitions_total",
        "Processor circuit breaker state transitions",
        &["processor", "to"]
    )
    .expect("payment_circuit_breaker_transitions_total metric can be created");

    static ref INBOX_BACKLOG: IntGaugeVec = register_int_gauge_vec!(
        "payment_webhook_inbox_entries",
        "Webhook inbox entries by status",
        &["status"]
    )
    .expect("payment_webhook_inbox_entries metric can be created");
}

pub fn record_transaction(kind: &str, outcome: &str) {
    TRANSACTIONS_TOTAL.with_label_values(&[kind, outcome]).inc();
}

pub fn record_wallet_movement(direction: &str, amount: i64) {
    if amount > 0 {
        LEDGER_AMOUNT_MINOR_TOTAL
            .with_label_values(&[direction])
            .inc_by(amount as u64);
    }
}

pub fn record_webhook(processor: &str, disposition: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[processor, disposition])
        .inc();
}

pub fn record_integrity_error(operation: &str) {
    INTEGRITY_ERRORS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn observe_processor_call(processor: &str, operation: &str, result: &str, elapsed: Duration) {
    PROCESSOR_CALLS_TOTAL
        .with_label_values(&[processor, operation, result])
        .inc();
    PROCESSOR_CALL_DURATION
        .with_label_values(&[processor, operation])
        .observe(elapsed.as_secs_f64());
}

pub fn record_circuit_transition(processor: &str, to: &str) {
    CIRCUIT_TRANSITIONS_TOTAL
        .with_label_values(&[processor, to])
        .inc();
}

pub fn set_inbox_backlog(pending: i64, dead: i64) {
    INBOX_BACKLOG.with_label_values(&["pending"]).set(pending);
    INBOX_BACKLOG.with_label_values(&["dead"]).set(dead);
}

/// Handler that serialises Prometheus metrics in text format.
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
