//! Scatter/gather request-reply across the fleet.
//!
//! A request is published with an ephemeral reply inbox; responses are
//! collected per origin (first one wins) until every expected peer answered
//! or the caller's deadline passed. Timeouts and cancellations return the
//! partial result with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use geofleet_cluster::{Registry, Role};
use geofleet_messaging::Transport;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::messages::{
    DowntimeEvent, DowntimeRequest, DowntimeResponse, UsageRequest, UsageResponse,
    WireUsageRecord,
};
use crate::subjects;
use crate::{Error, Result};

/// How often the gather loop re-checks the response count.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one gather round.
#[derive(Clone, Debug)]
pub struct GatherOutcome<T> {
    /// Aggregated items.
    pub items: Vec<T>,
    /// How many distinct peers answered.
    pub responders: usize,
    /// False when the round ended on timeout or cancellation.
    pub complete: bool,
}

/// Gathers usage from every active DNS node and merges the records,
/// summing hits per identity tuple.
///
/// # Errors
///
/// [`Error::NoPeers`] when no DNS node is active; transport errors when the
/// subscribe or publish fails.
pub async fn gather_usage(
    transport: &Arc<dyn Transport>,
    registry: &Registry,
    request: &UsageRequest,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<GatherOutcome<WireUsageRecord>> {
    let expected = registry.count_active(Role::Dns);
    if expected == 0 {
        return Err(Error::NoPeers { role: Role::Dns });
    }
    debug!(expected, "gathering usage from dns nodes");

    let payload = Bytes::from(serde_json::to_vec(request)?);
    let (responses, complete) = collect_responses::<UsageResponse>(
        transport,
        registry,
        subjects::USAGE_REQUEST,
        subjects::USAGE_REPLY_TAG,
        payload,
        expected,
        timeout,
        cancel,
        |response| (response.node_id.clone(), response.error.clone()),
    )
    .await?;

    let responders = responses.len();
    let items = merge_usage(
        responses
            .into_iter()
            .map(|(origin, response)| (origin, response.usage_records)),
    );
    Ok(GatherOutcome {
        items,
        responders,
        complete,
    })
}

/// Gathers downtime events from every active monitor; flat-appends,
/// keeping offline events only.
///
/// # Errors
///
/// [`Error::NoPeers`] when no monitor is active; transport errors when the
/// subscribe or publish fails.
pub async fn gather_downtime(
    transport: &Arc<dyn Transport>,
    registry: &Registry,
    request: &DowntimeRequest,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<GatherOutcome<DowntimeEvent>> {
    let expected = registry.count_active(Role::Monitor);
    if expected == 0 {
        return Err(Error::NoPeers {
            role: Role::Monitor,
        });
    }
    debug!(expected, "gathering downtime from monitors");

    let payload = Bytes::from(serde_json::to_vec(request)?);
    let (responses, complete) = collect_responses::<DowntimeResponse>(
        transport,
        registry,
        subjects::DOWNTIME_REQUEST,
        subjects::DOWNTIME_REPLY_TAG,
        payload,
        expected,
        timeout,
        cancel,
        |response| (response.node_id.clone(), response.error.clone()),
    )
    .await?;

    let responders = responses.len();
    let items = responses
        .into_values()
        .flat_map(|response| response.events)
        .filter(|event| !event.status)
        .collect();
    Ok(GatherOutcome {
        items,
        responders,
        complete,
    })
}

/// Identity tuple usage records are merged on. A value-typed key; the ipv6
/// flag is part of the identity so both address families survive the merge.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct UsageMergeKey {
    date: String,
    domain: String,
    member: String,
    country_code: String,
    asn: String,
    network_name: String,
    country_name: String,
    is_ipv6: bool,
}

/// Merges per-origin record lists, summing hits per identity tuple. Records
/// without a node id inherit their response's origin.
#[must_use]
pub fn merge_usage(
    responses: impl IntoIterator<Item = (String, Vec<WireUsageRecord>)>,
) -> Vec<WireUsageRecord> {
    let mut merged: HashMap<UsageMergeKey, WireUsageRecord> = HashMap::new();
    for (origin, records) in responses {
        for mut record in records {
            if record.node_id.is_empty() {
                record.node_id = origin.clone();
            }
            let key = UsageMergeKey {
                date: record.date.clone(),
                domain: record.domain.clone(),
                member: record.member_name.clone(),
                country_code: record.country_code.clone(),
                asn: record.asn.clone(),
                network_name: record.network_name.clone(),
                country_name: record.country_name.clone(),
                is_ipv6: record.is_ipv6,
            };
            merged
                .entry(key)
                .and_modify(|existing| existing.hits += record.hits)
                .or_insert(record);
        }
    }
    merged.into_values().collect()
}

#[allow(clippy::too_many_arguments)]
async fn collect_responses<R>(
    transport: &Arc<dyn Transport>,
    registry: &Registry,
    subject: &str,
    reply_tag: &str,
    payload: Bytes,
    expected: usize,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    origin_and_error: fn(&R) -> (String, Option<String>),
) -> Result<(HashMap<String, R>, bool)>
where
    R: DeserializeOwned + Send + 'static,
{
    let inbox = format!(
        "_INBOX.{}.{}.{}",
        registry.self_id(),
        reply_tag,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );

    let responses: Arc<Mutex<HashMap<String, R>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&responses);
    let subscription = transport
        .subscribe(
            &inbox,
            geofleet_messaging::handler_fn(move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    let response: R = match serde_json::from_slice(&message.payload) {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(%err, "dropping malformed gather response");
                            return;
                        }
                    };
                    let (origin, error) = origin_and_error(&response);
                    if let Some(error) = error {
                        warn!(%origin, %error, "peer answered with an error");
                    }
                    let mut responses = sink.lock().expect("gather lock poisoned");
                    if responses.contains_key(&origin) {
                        warn!(%origin, "duplicate gather response ignored");
                    } else {
                        responses.insert(origin, response);
                    }
                }
            }),
        )
        .await?;

    if let Err(err) = transport
        .publish_with_reply(subject, &inbox, payload)
        .await
    {
        let _ = subscription.unsubscribe().await;
        return Err(err.into());
    }

    let cancel = cancel.cloned().unwrap_or_default();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    let complete = loop {
        tokio::select! {
            () = &mut deadline => {
                let got = responses.lock().expect("gather lock poisoned").len();
                warn!(got, expected, "gather timed out, returning partial result");
                break false;
            }
            () = cancel.cancelled() => {
                let got = responses.lock().expect("gather lock poisoned").len();
                warn!(got, expected, "gather cancelled, returning partial result");
                break false;
            }
            _ = ticker.tick() => {
                if responses.lock().expect("gather lock poisoned").len() >= expected {
                    break true;
                }
            }
        }
    };

    if let Err(err) = subscription.unsubscribe().await {
        warn!(%err, "failed to tear down gather inbox");
    }

    let map = Arc::try_unwrap(responses)
        .map_or_else(
            |arc| std::mem::take(&mut *arc.lock().expect("gather lock poisoned")),
            |mutex| mutex.into_inner().expect("gather lock poisoned"),
        );
    Ok((map, complete))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hits: u64, node: &str, ipv6: bool) -> WireUsageRecord {
        WireUsageRecord {
            date: "2025-01-01".into(),
            node_id: node.into(),
            domain: "d.example".into(),
            member_name: "m1".into(),
            asn: "AS1".into(),
            network_name: "N1".into(),
            country_code: "US".into(),
            country_name: "United States".into(),
            is_ipv6: ipv6,
            hits,
        }
    }

    #[test]
    fn merge_sums_hits_across_origins() {
        let merged = merge_usage(vec![
            ("dns-1".to_owned(), vec![record(7, "dns-1", false)]),
            ("dns-2".to_owned(), vec![record(5, "dns-2", false)]),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].hits, 12);
    }

    #[test]
    fn merge_keeps_address_families_apart() {
        let merged = merge_usage(vec![(
            "dns-1".to_owned(),
            vec![record(7, "dns-1", false), record(5, "dns-1", true)],
        )]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_fills_missing_node_ids_from_the_origin() {
        let merged = merge_usage(vec![("dns-9".to_owned(), vec![record(3, "", false)])]);
        assert_eq!(merged[0].node_id, "dns-9");
    }
}
