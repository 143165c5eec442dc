//! Webhook inbox poller
//!
//! Deliveries that could not be applied when they arrived (unknown
//! subscription, pending transaction, processor hiccup) stay in the inbox
//! with a backoff. This job claims the due ones and runs them through the
//! reconciler again.

use crate::config::WorkerConfig;
use crate::metrics;
use crate::services::WebhookReconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Clone)]
pub struct WebhookRetryConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

impl From<&WorkerConfig> for WebhookRetryConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            enabled: config.webhook_retry_enabled,
            poll_interval: Duration::from_secs(config.webhook_poll_interval_secs.max(1)),
            batch_size: config.webhook_batch_size.max(1),
        }
    }
}

pub async fn start_webhook_retry(reconciler: Arc<WebhookReconciler>, config: WebhookRetryConfig) {
    if !config.enabled {
        tracing::info!("Webhook retry worker disabled by configuration");
        return;
    }

    tracing::info!(
        interval_secs = config.poll_interval.as_secs(),
        batch_size = config.batch_size,
        "Starting webhook retry worker"
    );

    let mut consecutive_failures = 0u32;

    loop {
        match reconciler.drain_due(config.batch_size).await {
            Ok(claimed) => {
                if consecutive_failures > 0 {
                    tracing::info!(
                        previous_failures = consecutive_failures,
                        "Webhook inbox reachable again"
                    );
                }
                consecutive_failures = 0;

                if claimed > 0 {
                    tracing::debug!(claimed, "Processed due webhook entries");
                }

                if let Ok(stats) = reconciler.stats().await {
                    metrics::set_inbox_backlog(stats.pending, stats.dead);
                }

                // A full batch means more are probably due; skip the wait
                if claimed >= config.batch_size {
                    continue;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!(
                        consecutive_failures,
                        error = %e,
                        "Webhook retry worker: CRITICAL - multiple consecutive failures"
                    );
                } else {
                    tracing::warn!(
                        consecutive_failures,
                        error = %e,
                        "Webhook retry worker: drain failed"
                    );
                }
            }
        }

        sleep(config.poll_interval).await;
    }
}
