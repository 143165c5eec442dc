//! PostgreSQL inbox backed by the `webhook_inbox` table

use crate::{
    to_chrono, validate_event_id, Enqueued, InboxEntry, InboxError, InboxResult, InboxStats,
    InboxStatus, InboxStore, NewInboxEntry,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, source, event_id, event_type, payload, status, attempts, \
     next_attempt_at, last_error, received_at, processed_at";

#[derive(Debug, FromRow)]
struct InboxRow {
    id: Uuid,
    source: String,
    event_id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InboxRow> for InboxEntry {
    type Error = InboxError;

    fn try_from(row: InboxRow) -> Result<Self, Self::Error> {
        Ok(InboxEntry {
            id: row.id,
            source: row.source,
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse::<InboxStatus>()?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

/// Inbox stored in PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so several replicas can drain the
/// same table without blocking on each other.
#[derive(Clone)]
pub struct PgInbox {
    pool: PgPool,
}

impl PgInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_key(&self, source: &str, event_id: &str) -> InboxResult<Option<InboxEntry>> {
        let sql = format!(
            "SELECT {} FROM webhook_inbox WHERE source = $1 AND event_id = $2",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(source)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load inbox entry")?;

        row.map(InboxEntry::try_from).transpose()
    }
}

#[async_trait]
impl InboxStore for PgInbox {
    async fn enqueue(&self, entry: NewInboxEntry) -> InboxResult<Enqueued> {
        validate_event_id(&entry.event_id)?;

        // ON CONFLICT DO NOTHING returns no row for a redelivery
        let sql = format!(
            r#"
            INSERT INTO webhook_inbox
                (id, source, event_id, event_type, payload, status, attempts, next_attempt_at, received_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, NOW())
            ON CONFLICT (source, event_id) DO NOTHING
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );
        let inserted = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.source)
            .bind(&entry.event_id)
            .bind(&entry.event_type)
            .bind(&entry.payload)
            .bind(entry.available_at)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to insert inbox entry")?;

        match inserted {
            Some(row) => {
                info!(
                    source = %entry.source,
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    "Webhook event queued"
                );
                Ok(Enqueued::New(row.try_into()?))
            }
            None => {
                debug!(
                    source = %entry.source,
                    event_id = %entry.event_id,
                    "Webhook event already queued (duplicate)"
                );
                let existing = self
                    .fetch_by_key(&entry.source, &entry.event_id)
                    .await?
                    .ok_or_else(|| {
                        InboxError::Corrupt(format!(
                            "conflicting inbox row for {}/{} vanished",
                            entry.source, entry.event_id
                        ))
                    })?;
                Ok(Enqueued::Duplicate(existing))
            }
        }
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> InboxResult<Vec<InboxEntry>> {
        let sql = format!(
            r#"
            UPDATE webhook_inbox
            SET next_attempt_at = $2
            WHERE id IN (
                SELECT id FROM webhook_inbox
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );
        let rows = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(now)
            .bind(now + to_chrono(lease))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to claim due inbox entries")?;

        rows.into_iter().map(InboxEntry::try_from).collect()
    }

    async fn mark_processed(&self, id: Uuid) -> InboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_inbox
            SET status = 'processed', processed_at = NOW(), last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark inbox entry processed")?;

        if result.rows_affected() == 0 {
            return Err(InboxError::NotFound(id));
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> InboxResult<InboxEntry> {
        let sql = format!(
            r#"
            UPDATE webhook_inbox
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(id)
            .bind(error)
            .bind(next_attempt_at)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to schedule inbox retry")?
            .ok_or(InboxError::NotFound(id))?;

        row.try_into()
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> InboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_inbox
            SET status = 'dead', attempts = attempts + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to dead-letter inbox entry")?;

        if result.rows_affected() == 0 {
            return Err(InboxError::NotFound(id));
        }
        warn!(entry_id = %id, error = %error, "Webhook event dead-lettered");
        Ok(())
    }

    async fn find(&self, source: &str, event_id: &str) -> InboxResult<Option<InboxEntry>> {
        self.fetch_by_key(source, event_id).await
    }

    async fn stats(&self) -> InboxResult<InboxStats> {
        let (pending, dead, oldest): (i64, i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'dead'),
                MIN(received_at) FILTER (WHERE status = 'pending')
            FROM webhook_inbox
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read inbox stats")?;

        Ok(InboxStats {
            pending,
            dead,
            oldest_pending_age_seconds: oldest
                .map(|t| (Utc::now() - t).num_seconds().max(0))
                .unwrap_or(0),
        })
    }

    async fn cleanup_processed(&self, older_than: DateTime<Utc>) -> InboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_inbox
            WHERE status = 'processed' AND processed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("Failed to clean up processed inbox entries")?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted_count = deleted, "Cleaned up processed webhook events");
        }
        Ok(deleted)
    }
}
