//! In-process inbox for tests and local development

use crate::{
    to_chrono, validate_event_id, Enqueued, InboxEntry, InboxError, InboxResult, InboxStats,
    InboxStatus, InboxStore, NewInboxEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, InboxEntry>,
    by_key: HashMap<(String, String), Uuid>,
}

/// Inbox held in memory. One mutex guards both indexes, so enqueue and
/// claim are atomic with respect to each other.
#[derive(Default)]
pub struct MemoryInbox {
    inner: Mutex<Inner>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, oldest first
    pub fn entries(&self) -> Vec<InboxEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<InboxEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.received_at);
        entries
    }

    /// Make an entry due immediately, regardless of its backoff
    pub fn expedite(&self, id: Uuid) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.next_attempt_at = Utc::now();
        }
    }
}

#[async_trait]
impl InboxStore for MemoryInbox {
    async fn enqueue(&self, entry: NewInboxEntry) -> InboxResult<Enqueued> {
        validate_event_id(&entry.event_id)?;

        let mut inner = self.inner.lock();
        let key = (entry.source.clone(), entry.event_id.clone());
        if let Some(id) = inner.by_key.get(&key).copied() {
            let existing = inner
                .entries
                .get(&id)
                .cloned()
                .ok_or(InboxError::NotFound(id))?;
            return Ok(Enqueued::Duplicate(existing));
        }

        let stored = InboxEntry {
            id: Uuid::new_v4(),
            source: entry.source,
            event_id: entry.event_id,
            event_type: entry.event_type,
            payload: entry.payload,
            status: InboxStatus::Pending,
            attempts: 0,
            next_attempt_at: entry.available_at,
            last_error: None,
            received_at: Utc::now(),
            processed_at: None,
        };
        inner.by_key.insert(key, stored.id);
        inner.entries.insert(stored.id, stored.clone());
        Ok(Enqueued::New(stored))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> InboxResult<Vec<InboxEntry>> {
        let mut inner = self.inner.lock();
        let mut due: Vec<&mut InboxEntry> = inner
            .entries
            .values_mut()
            .filter(|e| e.status == InboxStatus::Pending && e.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|e| e.next_attempt_at);

        let leased_until = now + to_chrono(lease);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|entry| {
                entry.next_attempt_at = leased_until;
                entry.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, id: Uuid) -> InboxResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&id).ok_or(InboxError::NotFound(id))?;
        entry.status = InboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        entry.last_error = None;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> InboxResult<InboxEntry> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .filter(|e| e.status == InboxStatus::Pending)
            .ok_or(InboxError::NotFound(id))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = next_attempt_at;
        Ok(entry.clone())
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> InboxResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&id).ok_or(InboxError::NotFound(id))?;
        entry.status = InboxStatus::Dead;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(())
    }

    async fn find(&self, source: &str, event_id: &str) -> InboxResult<Option<InboxEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_key
            .get(&(source.to_string(), event_id.to_string()))
            .and_then(|id| inner.entries.get(id))
            .cloned())
    }

    async fn stats(&self) -> InboxResult<InboxStats> {
        let inner = self.inner.lock();
        let now = Utc::now();
        let mut stats = InboxStats::default();
        for entry in inner.entries.values() {
            match entry.status {
                InboxStatus::Pending => {
                    stats.pending += 1;
                    let age = (now - entry.received_at).num_seconds().max(0);
                    stats.oldest_pending_age_seconds = stats.oldest_pending_age_seconds.max(age);
                }
                InboxStatus::Dead => stats.dead += 1,
                InboxStatus::Processed => {}
            }
        }
        Ok(stats)
    }

    async fn cleanup_processed(&self, older_than: DateTime<Utc>) -> InboxResult<u64> {
        let mut inner = self.inner.lock();
        let expired: Vec<Uuid> = inner
            .entries
            .values()
            .filter(|e| {
                e.status == InboxStatus::Processed
                    && e.processed_at.map(|at| at < older_than).unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();

        for id in &expired {
            if let Some(entry) = inner.entries.remove(id) {
                inner.by_key.remove(&(entry.source, entry.event_id));
            }
        }
        Ok(expired.len() as u64)
    }
}
