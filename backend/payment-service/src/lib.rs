//! Payment Service Library
//!
//! Wallet ledger, tips, pay-per-view unlocks, creator subscriptions and
//! withdrawals for the creator platform. Card processors (Stripe, CCBill)
//! sit behind [`processors::ProcessorAdapter`]; their webhooks are
//! reconciled through the durable inbox in the `webhook-inbox` crate.

pub mod config;
pub mod directory;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod notifications;
pub mod processors;
pub mod repository;
pub mod services;
pub mod workers;

pub use config::Config;
pub use error::{ServiceError, ServiceResult};
