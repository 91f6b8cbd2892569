use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::durable::{
    EventStore, OutageKey, OutageRecord, StoredEvent, UsageRow, UsageRowKey, UsageStore,
};
use crate::Result;

/// In-memory durable store. Backs tests and dry-run deployments; semantics
/// match the MySQL backend row for row.
#[derive(Default)]
pub struct MemoryStore {
    usage: Mutex<HashMap<UsageRowKey, UsageRow>>,
    events: Mutex<Vec<StoredEvent>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current usage rows, for assertions.
    #[must_use]
    pub fn usage_rows(&self) -> Vec<UsageRow> {
        self.usage
            .lock()
            .expect("usage lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Current event rows, for assertions.
    #[must_use]
    pub fn event_rows(&self) -> Vec<StoredEvent> {
        self.events.lock().expect("events lock poisoned").clone()
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn upsert_usage(&self, row: &UsageRow) -> Result<()> {
        self.usage
            .lock()
            .expect("usage lock poisoned")
            .insert(row.key(), row.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_outage(&self, record: &OutageRecord) -> Result<()> {
        let mut events = self.events.lock().expect("events lock poisoned");
        if let Some(open) = events
            .iter_mut()
            .find(|e| e.record.key == record.key && !e.record.status && e.record.end_time.is_none())
        {
            // The open-outage uniqueness constraint: refresh, don't duplicate.
            open.record.error = record.error.clone();
            open.record.vote_data = record.vote_data.clone();
            return Ok(());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        events.push(StoredEvent {
            id,
            record: record.clone(),
        });
        Ok(())
    }

    async fn close_outage(&self, key: &OutageKey) -> Result<bool> {
        let mut events = self.events.lock().expect("events lock poisoned");
        let mut closed = false;
        for event in events.iter_mut() {
            if event.record.key == *key && !event.record.status && event.record.end_time.is_none() {
                event.record.end_time = Some(Utc::now());
                event.record.status = true;
                closed = true;
            }
        }
        Ok(closed)
    }

    async fn find_open_outage(&self, key: &OutageKey) -> Result<Option<StoredEvent>> {
        let events = self.events.lock().expect("events lock poisoned");
        Ok(events
            .iter()
            .find(|e| e.record.key == *key && !e.record.status && e.record.end_time.is_none())
            .cloned())
    }

    async fn close_event(&self, id: i64, end_time: DateTime<Utc>) -> Result<()> {
        let mut events = self.events.lock().expect("events lock poisoned");
        if let Some(event) = events.iter_mut().find(|e| e.id == id) {
            event.record.end_time = Some(end_time);
            event.record.status = true;
        }
        Ok(())
    }

    async fn delete_event(&self, id: i64) -> Result<()> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .retain(|e| e.id != id);
        Ok(())
    }

    async fn fetch_events(
        &self,
        member: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>> {
        let events = self.events.lock().expect("events lock poisoned");
        Ok(events
            .iter()
            .filter(|e| member.is_none_or(|m| e.record.key.member == m))
            .filter(|e| {
                let opened_before_end = e.record.start_time <= end;
                let still_relevant = e.record.end_time.is_none_or(|t| t >= start);
                opened_before_end && still_relevant
            })
            .cloned()
            .collect())
    }
}
