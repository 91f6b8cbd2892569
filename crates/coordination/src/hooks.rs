//! Role-specific finalize hooks.

use std::sync::Arc;

use async_trait::async_trait;
use geofleet_config::{CheckKind, ConfigHandle};
use geofleet_notifier::{Notifier, OutageNotice};
use geofleet_store::{EventStore, OfficialStore, OutageKey, OutageRecord};
use tracing::{debug, error, warn};

use crate::engine::FinalizeHook;
use crate::messages::FinalizeMessage;

/// Hook for roles that take no action on finalization.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreFinalize;

#[async_trait]
impl FinalizeHook for IgnoreFinalize {
    async fn on_finalize(&self, _message: &FinalizeMessage) {}
}

/// Monitor hook: apply the agreed result to the official surface, resolving
/// check, member and service from the config snapshot.
pub struct MonitorFinalizeHook {
    config: ConfigHandle,
    official: Arc<OfficialStore>,
}

impl MonitorFinalizeHook {
    /// Creates the hook.
    #[must_use]
    pub fn new(config: ConfigHandle, official: Arc<OfficialStore>) -> Self {
        Self { config, official }
    }
}

#[async_trait]
impl FinalizeHook for MonitorFinalizeHook {
    async fn on_finalize(&self, message: &FinalizeMessage) {
        if !message.passed {
            return;
        }
        let proposal = &message.proposal;
        debug!(id = %proposal.id, member = %proposal.member_name,
            status = proposal.proposed_status, "applying official change");

        let snapshot = self.config.get();
        let Some(check) = snapshot.check(&proposal.check_name, proposal.check_type) else {
            warn!(check = %proposal.check_name, kind = %proposal.check_type,
                "finalized check not in config, skipping");
            return;
        };
        let Some(member) = snapshot.member(&proposal.member_name) else {
            warn!(member = %proposal.member_name, "finalized member not in config, skipping");
            return;
        };
        let service = match proposal.check_type {
            CheckKind::Site => None,
            CheckKind::Domain | CheckKind::Endpoint => {
                snapshot.service_for_domain(&proposal.domain_name)
            }
        };

        match proposal.check_type {
            CheckKind::Site => {
                self.official
                    .apply_site(
                        check,
                        member,
                        proposal.proposed_status,
                        &proposal.error_text,
                        proposal.data.clone(),
                        proposal.is_ipv6,
                    )
                    .await;
            }
            CheckKind::Domain => {
                self.official
                    .apply_domain(
                        check,
                        member,
                        service,
                        &proposal.domain_name,
                        proposal.proposed_status,
                        &proposal.error_text,
                        proposal.data.clone(),
                        proposal.is_ipv6,
                    )
                    .await;
            }
            CheckKind::Endpoint => {
                self.official
                    .apply_endpoint(
                        check,
                        member,
                        service,
                        &proposal.domain_name,
                        &proposal.endpoint,
                        proposal.proposed_status,
                        &proposal.error_text,
                        proposal.data.clone(),
                        proposal.is_ipv6,
                    )
                    .await;
            }
        }
    }
}

/// Collator hook: persist the outcome and drive outage notifications.
/// Offline decisions open an outage row and announce; online decisions
/// close the open row and clear the announcement.
pub struct CollatorFinalizeHook {
    events: Arc<dyn EventStore>,
    notifier: Arc<Notifier>,
}

impl CollatorFinalizeHook {
    /// Creates the hook.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>, notifier: Arc<Notifier>) -> Self {
        Self { events, notifier }
    }
}

#[async_trait]
impl FinalizeHook for CollatorFinalizeHook {
    async fn on_finalize(&self, message: &FinalizeMessage) {
        if !message.passed {
            return;
        }
        let proposal = &message.proposal;
        let key = OutageKey {
            kind: proposal.check_type,
            check_name: proposal.check_name.clone(),
            check_url: proposal.check_url(),
            domain: proposal.domain_name.clone(),
            member: proposal.member_name.clone(),
            is_ipv6: proposal.is_ipv6,
        };
        let notice = OutageNotice {
            member: key.member.clone(),
            check_kind: key.kind.as_str().to_owned(),
            check_name: key.check_name.clone(),
            domain: key.domain.clone(),
            endpoint: key.check_url.clone(),
            is_ipv6: key.is_ipv6,
            error: proposal.error_text.clone(),
        };

        if proposal.proposed_status {
            match self.events.close_outage(&key).await {
                Ok(closed) => {
                    debug!(member = %key.member, closed, "outage closed");
                    self.notifier.notify_online(&notice).await;
                }
                Err(err) => error!(%err, member = %key.member, "failed to close outage"),
            }
        } else {
            let record = OutageRecord {
                key: key.clone(),
                status: false,
                start_time: message.decided_at,
                end_time: None,
                error: proposal.error_text.clone(),
                vote_data: None,
                extra: proposal.data.clone(),
            };
            match self.events.insert_outage(&record).await {
                Ok(()) => {
                    debug!(member = %key.member, "outage recorded");
                    self.notifier.notify_offline(&notice).await;
                }
                Err(err) => error!(%err, member = %key.member, "failed to record outage"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Proposal;
    use chrono::Utc;
    use geofleet_notifier::{Error as NotifyError, MessageId, NoMentions, NotifyTransport};
    use geofleet_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        sends: AtomicUsize,
        edits: AtomicUsize,
    }

    #[async_trait]
    impl NotifyTransport for CountingTransport {
        fn ready(&self) -> bool {
            true
        }

        async fn send(&self, _body: &str, _html: &str) -> Result<MessageId, NotifyError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(format!("$msg{n}"))
        }

        async fn edit(&self, _id: &MessageId, _body: &str, _html: &str) -> Result<(), NotifyError> {
            self.edits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn finalize(status: bool, passed: bool) -> FinalizeMessage {
        FinalizeMessage {
            proposal: Proposal {
                id: "p1".into(),
                sender_node_id: "monitor-1".into(),
                check_type: CheckKind::Endpoint,
                check_name: "wss".into(),
                member_name: "m1".into(),
                domain_name: "rpc.example.net".into(),
                endpoint: "wss://rpc.example.net".into(),
                proposed_status: status,
                error_text: "refused".into(),
                data: None,
                is_ipv6: false,
                timestamp: Utc::now(),
            },
            passed,
            decided_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn collator_hook_records_and_announces_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&transport) as Arc<dyn NotifyTransport>,
            Arc::new(NoMentions),
        ));
        let hook = CollatorFinalizeHook::new(store.clone(), notifier);

        // Offline decision: one row, one alert; replays stay deduplicated.
        hook.on_finalize(&finalize(false, true)).await;
        hook.on_finalize(&finalize(false, true)).await;
        assert_eq!(store.event_rows().len(), 1);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);

        // Recovery: the open row closes and the alert is edited in place.
        hook.on_finalize(&finalize(true, true)).await;
        let rows = store.event_rows();
        assert!(rows[0].record.end_time.is_some());
        assert_eq!(transport.edits.load(Ordering::SeqCst), 1);

        // The key cleared: a new outage may announce again.
        hook.on_finalize(&finalize(false, true)).await;
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn monitor_hook_applies_official_state() {
        let dir = std::env::temp_dir().join(format!("geofleet-hook-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("monitor.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&serde_json::json!({
                "system": { "node_id": "monitor-1" },
                "nats": { "url": "nats://localhost:4222" },
                "checks": [
                    { "name": "wss", "kind": "endpoint", "timeout_secs": 10 }
                ],
                "members": { "m1": { "name": "m1" } }
            }))
            .unwrap(),
        )
        .await
        .unwrap();
        let config = ConfigHandle::load(&path).await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let official = Arc::new(OfficialStore::new(geofleet_store::EventRecorder::new(
            store.clone(),
        )));
        let hook = MonitorFinalizeHook::new(config, Arc::clone(&official));

        hook.on_finalize(&finalize(false, true)).await;

        let key = geofleet_store::StatusKey {
            kind: CheckKind::Endpoint,
            check_name: "wss",
            member: "m1",
            domain: "rpc.example.net",
            endpoint: "wss://rpc.example.net",
            is_ipv6: false,
        };
        use geofleet_store::LocalStatus;
        assert_eq!(official.surface().local_status(&key), Some(false));
        assert_eq!(store.event_rows().len(), 1);

        // A decision about an unconfigured member is skipped, not applied.
        let mut unknown = finalize(false, true);
        unknown.proposal.member_name = "ghost".into();
        hook.on_finalize(&unknown).await;
        assert_eq!(store.event_rows().len(), 1);
    }

    #[tokio::test]
    async fn failed_rounds_change_nothing() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&transport) as Arc<dyn NotifyTransport>,
            Arc::new(NoMentions),
        ));
        let hook = CollatorFinalizeHook::new(store.clone(), notifier);

        hook.on_finalize(&finalize(false, false)).await;
        assert!(store.event_rows().is_empty());
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }
}
