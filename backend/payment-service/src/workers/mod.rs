//! Background jobs
//!
//! Both jobs are idempotent, so running more than one replica only costs
//! duplicate work. Inbox claims are leased, so two pollers never dispatch the
//! same entry at once.

pub mod subscription_sweep;
pub mod webhook_retry;

pub use subscription_sweep::{start_subscription_sweep, SweepConfig, SweepReport, SubscriptionSweep};
pub use webhook_retry::{start_webhook_retry, WebhookRetryConfig};
