//! Fleet scatter/gather over the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use geofleet_cluster::{Node, Registry, Role};
use geofleet_coordination::{
    gather_downtime, gather_usage, subjects, DowntimeRequest, Error, UsageCollator, UsageRequest,
    UsageResponder,
};
use geofleet_messaging::Transport;
use geofleet_messaging_memory::MemoryTransport;
use geofleet_store::{MemoryStore, Result as StoreResult, UsageRow, UsageSource, UsageStore};

struct FixedUsage(Vec<UsageRow>);

#[async_trait]
impl UsageSource for FixedUsage {
    async fn usage(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
        _domain: Option<&str>,
        _member: Option<&str>,
        _country: Option<&str>,
    ) -> StoreResult<Vec<UsageRow>> {
        Ok(self.0.clone())
    }
}

fn usage_row(node: &str, hits: u64) -> UsageRow {
    UsageRow {
        date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        node_id: node.into(),
        domain: "d.example".into(),
        member: "m1".into(),
        asn: "AS1".into(),
        network_name: "N1".into(),
        country_code: "US".into(),
        country_name: "United States".into(),
        is_ipv6: false,
        hits,
    }
}

fn registry_with_dns(peers: &[&str]) -> Arc<Registry> {
    let registry = Arc::new(Registry::new(
        Node::new("collator-1", Role::Collator),
        Duration::from_secs(600),
        Duration::from_secs(900),
    ));
    for peer in peers {
        registry.add_or_merge(Node::new(*peer, Role::Dns));
        registry.mark_heard(&(*peer).into());
    }
    registry
}

async fn attach_dns_responder(bus: &MemoryTransport, node_id: &str, rows: Vec<UsageRow>) {
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let responder = Arc::new(UsageResponder::new(
        node_id,
        Arc::clone(&transport),
        Arc::new(FixedUsage(rows)),
    ));
    let handler_responder = Arc::clone(&responder);
    // Leak the subscription for the duration of the test process.
    let subscription = transport
        .subscribe(
            subjects::USAGE_REQUEST,
            geofleet_messaging::handler_fn(move |message| {
                let responder = Arc::clone(&handler_responder);
                async move {
                    responder.handle(&message).await;
                }
            }),
        )
        .await
        .unwrap();
    std::mem::forget(subscription);
}

fn todays_request() -> UsageRequest {
    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    UsageRequest {
        start_date: today.clone(),
        end_date: today,
        ..UsageRequest::default()
    }
}

#[tokio::test(start_paused = true)]
async fn usage_gather_merges_hits_across_nodes() {
    let bus = MemoryTransport::new();
    attach_dns_responder(&bus, "dns-1", vec![usage_row("dns-1", 7)]).await;
    attach_dns_responder(&bus, "dns-2", vec![usage_row("dns-2", 5)]).await;

    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let registry = registry_with_dns(&["dns-1", "dns-2"]);

    let outcome = gather_usage(
        &transport,
        &registry,
        &todays_request(),
        Duration::from_secs(20),
        None,
    )
    .await
    .unwrap();

    assert!(outcome.complete);
    assert_eq!(outcome.responders, 2);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].hits, 12);
}

#[tokio::test(start_paused = true)]
async fn gather_without_peers_fails_fast() {
    let bus = MemoryTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let registry = registry_with_dns(&[]);

    let err = gather_usage(
        &transport,
        &registry,
        &todays_request(),
        Duration::from_secs(1),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NoPeers { role: Role::Dns }));
}

#[tokio::test(start_paused = true)]
async fn gather_times_out_with_partial_results() {
    let bus = MemoryTransport::new();
    attach_dns_responder(&bus, "dns-1", vec![usage_row("dns-1", 3)]).await;
    // dns-2 is believed active but never answers.

    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let registry = registry_with_dns(&["dns-1", "dns-2"]);

    let outcome = gather_usage(
        &transport,
        &registry,
        &todays_request(),
        Duration::from_secs(2),
        None,
    )
    .await
    .unwrap();

    assert!(!outcome.complete);
    assert_eq!(outcome.responders, 1);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].hits, 3);
}

#[tokio::test(start_paused = true)]
async fn downtime_gather_without_monitors_fails_fast() {
    let bus = MemoryTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let registry = registry_with_dns(&["dns-1"]);

    let err = gather_downtime(
        &transport,
        &registry,
        &DowntimeRequest {
            start_time: Utc::now() - chrono::Duration::hours(24),
            end_time: Utc::now(),
            member_name: String::new(),
        },
        Duration::from_secs(1),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        Error::NoPeers {
            role: Role::Monitor
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn collator_collection_is_idempotent() {
    let bus = MemoryTransport::new();
    let mut row_a = usage_row("dns-1", 7);
    row_a.domain = "a.example".into();
    let mut row_b = usage_row("dns-2", 5);
    row_b.domain = "b.example".into();
    attach_dns_responder(&bus, "dns-1", vec![row_a]).await;
    attach_dns_responder(&bus, "dns-2", vec![row_b]).await;

    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let registry = registry_with_dns(&["dns-1", "dns-2"]);
    let store = Arc::new(MemoryStore::new());
    let collator = UsageCollator::new(
        Arc::clone(&transport),
        Arc::clone(&registry),
        Arc::clone(&store) as Arc<dyn UsageStore>,
    );

    collator.collect_once(None).await;
    let mut first = store.usage_rows();
    first.sort_by(|a, b| a.domain.cmp(&b.domain));
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].hits, 7);
    assert_eq!(first[1].hits, 5);

    // Re-running the same hour converges on the same totals.
    collator.collect_once(None).await;
    let second = store.usage_rows();
    assert_eq!(second.len(), 2);
    assert_eq!(second.iter().map(|r| r.hits).sum::<u64>(), 12);
}
