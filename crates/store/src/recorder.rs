use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::durable::{EventStore, OutageKey, OutageRecord};
use crate::results::Transition;

/// Outages shorter than this are deleted instead of closed; probe flaps are
/// not worth a persisted row.
const SHORT_FLAP: Duration = Duration::from_secs(30);

/// Writes official status transitions to the durable event store.
///
/// Failures are logged and swallowed: a broken store must not stall the
/// official surface.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn EventStore>,
}

impl EventRecorder {
    /// Creates a recorder over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Records one transition.
    ///
    /// Offline opens an event row unless one is already open for the key.
    /// Online closes the open row, or deletes it when the outage lasted
    /// under [`SHORT_FLAP`].
    pub async fn record(&self, transition: &Transition) {
        let key = transition.outage_key();
        if transition.status {
            self.close_or_suppress(&key).await;
        } else {
            self.open(&key, transition).await;
        }
    }

    async fn open(&self, key: &OutageKey, transition: &Transition) {
        match self.store.find_open_outage(key).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let record = OutageRecord {
                    key: key.clone(),
                    status: false,
                    start_time: Utc::now(),
                    end_time: None,
                    error: transition.error.clone(),
                    vote_data: None,
                    extra: transition.data.clone(),
                };
                if let Err(err) = self.store.insert_outage(&record).await {
                    error!(%err, member = %key.member, "failed to open outage event");
                } else {
                    info!(member = %key.member, check = %key.check_name, ipv6 = key.is_ipv6,
                        "recorded offline event");
                }
            }
            Err(err) => error!(%err, "failed to look up open outage"),
        }
    }

    async fn close_or_suppress(&self, key: &OutageKey) {
        let open = match self.store.find_open_outage(key).await {
            Ok(open) => open,
            Err(err) => {
                error!(%err, "failed to look up open outage");
                return;
            }
        };
        let Some(event) = open else { return };

        let now = Utc::now();
        let age = now
            .signed_duration_since(event.record.start_time)
            .to_std()
            .unwrap_or_default();
        if age < SHORT_FLAP {
            if let Err(err) = self.store.delete_event(event.id).await {
                error!(%err, "failed to delete short-flap event");
            } else {
                info!(member = %key.member, check = %key.check_name,
                    "deleted short-duration offline event");
            }
            return;
        }

        if let Err(err) = self.store.close_event(event.id, now).await {
            error!(%err, "failed to close outage event");
        } else {
            info!(member = %key.member, check = %key.check_name, "closed offline event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use geofleet_config::CheckKind;

    fn transition(status: bool) -> Transition {
        Transition {
            kind: CheckKind::Endpoint,
            check_name: "wss".into(),
            member: "m1".into(),
            domain: "rpc.example.net".into(),
            endpoint: "wss://rpc.example.net".into(),
            status,
            error: "connection refused".into(),
            data: None,
            is_ipv6: false,
        }
    }

    #[tokio::test]
    async fn offline_opens_one_event() {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone());

        recorder.record(&transition(false)).await;
        recorder.record(&transition(false)).await;
        assert_eq!(store.event_rows().len(), 1);
    }

    #[tokio::test]
    async fn short_flap_leaves_no_row() {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone());

        recorder.record(&transition(false)).await;
        recorder.record(&transition(true)).await;
        assert!(store.event_rows().is_empty());
    }

    #[tokio::test]
    async fn long_outage_is_closed_not_deleted() {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::new(store.clone());

        recorder.record(&transition(false)).await;
        {
            // Age the open row past the flap window.
            let key = transition(false).outage_key();
            let open = store.find_open_outage(&key).await.unwrap().unwrap();
            store.delete_event(open.id).await.unwrap();
            let mut aged = open.record.clone();
            aged.start_time = Utc::now() - chrono::Duration::minutes(5);
            store.insert_outage(&aged).await.unwrap();
        }

        recorder.record(&transition(true)).await;
        let rows = store.event_rows();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].record.end_time.is_some());
    }
}
