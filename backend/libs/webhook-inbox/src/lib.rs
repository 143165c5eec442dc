//! # Webhook Inbox Library
//!
//! Durable inbox for asynchronous notifications from payment processors.
//! Every decoded webhook is stored under `(source, event_id)` before any
//! business logic runs, so the HTTP endpoint can acknowledge the processor as
//! soon as the row is committed and duplicate deliveries are detected by the
//! unique key instead of by the handler.
//!
//! ## Lifecycle
//!
//! ```text
//!  enqueue ──► pending ──(dispatch ok)──────────► processed
//!                 │  ▲
//!                 │  └──(not yet known: schedule_retry)
//!                 └─────(permanent / exhausted)──► dead
//! ```
//!
//! Entries are claimed with a lease: `claim_due` pushes `next_attempt_at`
//! forward so that two workers never dispatch the same entry at once. An entry
//! whose worker crashed becomes visible again when the lease runs out.
//!
//! ## Usage
//!
//! ```ignore
//! use webhook_inbox::{Enqueued, InboxStore, NewInboxEntry, PgInbox};
//!
//! # async fn example(pool: sqlx::PgPool) -> webhook_inbox::InboxResult<()> {
//! let inbox = PgInbox::new(pool);
//! let entry = NewInboxEntry::new("stripe", "evt_123", "invoice.payment_succeeded", payload);
//! match inbox.enqueue(entry).await? {
//!     Enqueued::New(entry) => dispatch(entry).await,
//!     Enqueued::Duplicate(_) => { /* already received, acknowledge */ }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Database Migration
//!
//! The owning service creates the `webhook_inbox` table; see the payment
//! service migrations for the schema and indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

mod error;
pub mod memory;
pub mod postgres;

pub use error::{InboxError, InboxResult};
pub use memory::MemoryInbox;
pub use postgres::PgInbox;

/// Maximum length of an event id (matches the VARCHAR(255) column)
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Processing state of an inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Processed,
    Dead,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Processed => "processed",
            InboxStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboxStatus {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InboxStatus::Pending),
            "processed" => Ok(InboxStatus::Processed),
            "dead" => Ok(InboxStatus::Dead),
            other => Err(InboxError::Corrupt(format!("unknown inbox status '{}'", other))),
        }
    }
}

/// An event about to be stored
#[derive(Debug, Clone)]
pub struct NewInboxEntry {
    /// Sender of the event (processor name)
    pub source: String,
    /// Sender-assigned event id, unique per source
    pub event_id: String,
    /// Sender-specific event type, kept for operators
    pub event_type: String,
    /// Decoded event body
    pub payload: serde_json::Value,
    /// The entry is not claimable before this instant
    pub available_at: DateTime<Utc>,
}

impl NewInboxEntry {
    pub fn new(
        source: impl Into<String>,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source: source.into(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            available_at: Utc::now(),
        }
    }

    /// Hide the entry from `claim_due` for `lease`, used when the receiver
    /// dispatches the entry inline right after enqueueing it.
    pub fn leased_for(mut self, lease: Duration) -> Self {
        self.available_at = Utc::now() + to_chrono(lease);
        self
    }
}

/// A stored inbox entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: Uuid,
    pub source: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: InboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Result of an enqueue
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// First delivery of this event
    New(InboxEntry),
    /// The event was received before; carries the stored entry
    Duplicate(InboxEntry),
}

impl Enqueued {
    pub fn entry(&self) -> &InboxEntry {
        match self {
            Enqueued::New(entry) | Enqueued::Duplicate(entry) => entry,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Enqueued::Duplicate(_))
    }
}

/// Counts used by the health endpoint and the retry worker logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub pending: i64,
    pub dead: i64,
    /// Age in seconds of the oldest pending entry, 0 when none
    pub oldest_pending_age_seconds: i64,
}

/// Storage backend for the inbox
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Store an event unless `(source, event_id)` already exists
    async fn enqueue(&self, entry: NewInboxEntry) -> InboxResult<Enqueued>;

    /// Claim up to `limit` pending entries due at `now`, leasing them until
    /// `now + lease`
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> InboxResult<Vec<InboxEntry>>;

    async fn mark_processed(&self, id: Uuid) -> InboxResult<()>;

    /// Record a failed attempt and make the entry due again at `next_attempt_at`
    async fn schedule_retry(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> InboxResult<InboxEntry>;

    /// Stop retrying the entry; it stays in the table for inspection
    async fn mark_dead(&self, id: Uuid, error: &str) -> InboxResult<()>;

    async fn find(&self, source: &str, event_id: &str) -> InboxResult<Option<InboxEntry>>;

    async fn stats(&self) -> InboxResult<InboxStats>;

    /// Delete processed entries older than `older_than`. Dead entries are kept.
    async fn cleanup_processed(&self, older_than: DateTime<Utc>) -> InboxResult<u64>;
}

/// Backoff schedule for entries that could not be applied yet
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Attempts after which an entry is dead-lettered
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            max_attempts: 12,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts made so far
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now + to_chrono(self.delay_for(attempts))
    }
}

pub(crate) fn validate_event_id(event_id: &str) -> InboxResult<()> {
    if event_id.is_empty() {
        return Err(InboxError::InvalidEventId("event id is empty".to_string()));
    }
    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(InboxError::InvalidEventId(format!(
            "event id exceeds {} characters",
            MAX_EVENT_ID_LEN
        )));
    }
    Ok(())
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
