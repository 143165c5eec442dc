//! Periodic ledger housekeeping
//!
//! - ends subscriptions whose cancellation took effect at period end
//! - retries refund/chargeback debits that were parked for lack of balance
//! - prunes processed webhook inbox rows past retention

use crate::config::{WebhookConfig, WorkerConfig};
use crate::error::ServiceResult;
use crate::services::{LedgerService, SubscriptionService};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use webhook_inbox::InboxStore;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
    pub inbox_retention_days: i64,
}

impl SweepConfig {
    pub fn from_config(workers: &WorkerConfig, webhooks: &WebhookConfig) -> Self {
        Self {
            enabled: workers.sweep_enabled,
            interval: Duration::from_secs(workers.sweep_interval_secs.max(1)),
            batch_size: workers.sweep_batch_size.max(1),
            inbox_retention_days: webhooks.retention_days,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub subscriptions_expired: usize,
    pub reversals_applied: usize,
    pub inbox_rows_pruned: u64,
}

pub struct SubscriptionSweep {
    ledger: Arc<LedgerService>,
    subscriptions: Arc<SubscriptionService>,
    inbox: Arc<dyn InboxStore>,
    config: SweepConfig,
}

impl SubscriptionSweep {
    pub fn new(
        ledger: Arc<LedgerService>,
        subscriptions: Arc<SubscriptionService>,
        inbox: Arc<dyn InboxStore>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            inbox,
            config,
        }
    }

    /// One pass over all three chores. Stops at the first storage error.
    pub async fn run_once(&self) -> ServiceResult<SweepReport> {
        let now = Utc::now();
        let subscriptions_expired = self
            .subscriptions
            .finalize_expired(now, self.config.batch_size)
            .await?;
        let reversals_applied = self
            .ledger
            .retry_pending_reversals(self.config.batch_size)
            .await?;

        // Zero or negative retention keeps everything
        let inbox_rows_pruned = if self.config.inbox_retention_days > 0 {
            let cutoff = now - ChronoDuration::days(self.config.inbox_retention_days);
            self.inbox.cleanup_processed(cutoff).await?
        } else {
            0
        };

        Ok(SweepReport {
            subscriptions_expired,
            reversals_applied,
            inbox_rows_pruned,
        })
    }
}

pub async fn start_subscription_sweep(sweep: Arc<SubscriptionSweep>) {
    if !sweep.config.enabled {
        tracing::info!("Subscription sweep disabled by configuration");
        return;
    }

    tracing::info!(
        interval_secs = sweep.config.interval.as_secs(),
        batch_size = sweep.config.batch_size,
        "Starting subscription sweep"
    );

    let mut consecutive_failures = 0u32;

    loop {
        match sweep.run_once().await {
            Ok(report) => {
                consecutive_failures = 0;
                if report != SweepReport::default() {
                    tracing::info!(
                        subscriptions_expired = report.subscriptions_expired,
                        reversals_applied = report.reversals_applied,
                        inbox_rows_pruned = report.inbox_rows_pruned,
                        "Subscription sweep completed"
                    );
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!(
                        consecutive_failures,
                        error = %e,
                        "Subscription sweep: CRITICAL - multiple consecutive failures"
                    );
                } else {
                    tracing::warn!(consecutive_failures, error = %e, "Subscription sweep failed");
                }
            }
        }

        sleep(sweep.config.interval).await;
    }
}
