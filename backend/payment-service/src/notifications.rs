//! Payment receipts.
//!
//! Receipts are fire-and-forget: a failing sink is logged and never affects
//! the ledger operation that produced the receipt.

use crate::domain::{Transaction, TransactionKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_id: Uuid,
    pub kind: TransactionKind,
    pub payer_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub amount: i64,
    pub net_amount: Option<i64>,
    pub currency: String,
    pub issued_at: DateTime<Utc>,
}

impl Receipt {
    pub fn for_transaction(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            kind: tx.kind,
            payer_id: tx.payer_id,
            recipient_id: tx.recipient_id,
            amount: tx.amount,
            net_amount: tx.net_amount,
            currency: tx.currency.clone(),
            issued_at: tx.processed_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn event_type(&self) -> String {
        format!("payment.{}.completed", self.kind)
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_receipt(&self, receipt: &Receipt) -> anyhow::Result<()>;
}

/// Send a receipt in the background
pub fn dispatch(sink: Arc<dyn NotificationSink>, receipt: Receipt) {
    tokio::spawn(async move {
        if let Err(e) = sink.send_receipt(&receipt).await {
            warn!(
                transaction_id = %receipt.transaction_id,
                error = %e,
                "Failed to deliver payment receipt"
            );
        }
    });
}

/// Default sink; receipts only show up in the logs
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send_receipt(&self, receipt: &Receipt) -> anyhow::Result<()> {
        info!(
            transaction_id = %receipt.transaction_id,
            kind = %receipt.kind,
            payer_id = %receipt.payer_id,
            amount = receipt.amount,
            currency = %receipt.currency,
            "Payment receipt"
        );
        Ok(())
    }
}

/// Writes receipts to `outbox_events` for the platform's outbox relay
#[derive(Clone)]
pub struct OutboxNotificationSink {
    pool: PgPool,
}

impl OutboxNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for OutboxNotificationSink {
    async fn send_receipt(&self, receipt: &Receipt) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                metadata,
                created_at,
                published_at,
                retry_count,
                last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, 0, NULL)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind("transaction")
        .bind(receipt.transaction_id)
        .bind(receipt.event_type())
        .bind(serde_json::to_value(receipt)?)
        .bind(json!({ "service": "payment-service" }))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
