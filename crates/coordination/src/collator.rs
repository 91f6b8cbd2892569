//! Services that run only on collator nodes: the hourly usage puller and
//! the audit-cache janitor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use geofleet_cluster::Registry;
use geofleet_messaging::Transport;
use geofleet_store::{store_usage_batch, UsageRow, UsageStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::messages::{UsageRequest, UsageResponse, WireUsageRecord};
use crate::proposal_cache::ProposalCache;
use crate::scatter::gather_usage;
use crate::Error;

/// Deadline for one fleet usage gather.
const GATHER_TIMEOUT: Duration = Duration::from_secs(20);

/// Cadence of the audit-cache janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Hourly usage collation: pull totals from every DNS node at the top of
/// each UTC hour and upsert them idempotently. Re-running an hour within
/// the same day converges on the same stored totals because `hits` is
/// replaced, never accumulated.
pub struct UsageCollator {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    store: Arc<dyn UsageStore>,
    cache: Arc<ProposalCache>,
}

impl UsageCollator {
    /// Creates the collator.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
        store: Arc<dyn UsageStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            store,
            cache: Arc::new(ProposalCache::new()),
        })
    }

    /// The proposal audit cache fed by the collator's router module.
    #[must_use]
    pub fn cache(&self) -> Arc<ProposalCache> {
        Arc::clone(&self.cache)
    }

    /// Launches the hourly collection loop, aligned to UTC top-of-hour.
    #[must_use]
    pub fn start_hourly(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let collator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = until_next_hour(Utc::now());
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                collator.collect_once(Some(&shutdown)).await;
            }
        })
    }

    /// Launches the janitor expiring stale audit-cache proposals.
    #[must_use]
    pub fn start_janitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let collator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => collator.cache.expire_stale(),
                }
            }
        })
    }

    /// One collection round: gather today's totals from the fleet and
    /// upsert them. Skipped (and retried next hour) when no DNS peer is
    /// active; row failures are accumulated, never aborting the batch.
    pub async fn collect_once(&self, cancel: Option<&CancellationToken>) {
        let period = Utc::now().date_naive();
        let request = UsageRequest {
            start_date: period.format("%Y-%m-%d").to_string(),
            end_date: period.format("%Y-%m-%d").to_string(),
            ..UsageRequest::default()
        };

        let outcome = match gather_usage(
            &self.transport,
            &self.registry,
            &request,
            GATHER_TIMEOUT,
            cancel,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(Error::NoPeers { .. }) => {
                info!("no active dns nodes, skipping this hour");
                return;
            }
            Err(err) => {
                error!(%err, "fleet usage gather failed");
                return;
            }
        };

        if outcome.items.is_empty() {
            info!("no usage data returned from dns nodes");
            return;
        }

        let rows = convert_records(outcome.items, "");
        if rows.is_empty() {
            warn!("all gathered usage records had unparseable dates");
            return;
        }

        match store_usage_batch(self.store.as_ref(), &rows).await {
            Ok(()) => info!(rows = rows.len(), %period, "stored fleet usage"),
            Err(err) => error!(%err, "fleet usage batch completed with errors"),
        }
    }

    /// Ingests a usage response that arrived outside a gather round (the
    /// broadcast data subject, or a straggling reply). Idempotent: rows key
    /// on the full identity tuple.
    pub async fn ingest_usage_payload(&self, payload: &[u8]) {
        let response: UsageResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "malformed usage data payload");
                return;
            }
        };
        if response.usage_records.is_empty() {
            return;
        }

        let rows = convert_records(response.usage_records, &response.node_id);
        if rows.is_empty() {
            warn!(node = %response.node_id, "no valid usage records to store");
            return;
        }
        if let Err(err) = store_usage_batch(self.store.as_ref(), &rows).await {
            error!(%err, node = %response.node_id, "usage ingest completed with errors");
        }
    }
}

fn convert_records(records: Vec<WireUsageRecord>, fallback_node: &str) -> Vec<UsageRow> {
    records
        .into_iter()
        .filter_map(|record| {
            let Some(date) = parse_date_flexible(&record.date) else {
                warn!(date = %record.date, "skipping usage record with invalid date");
                return None;
            };
            let node_id = if record.node_id.is_empty() {
                fallback_node.to_owned()
            } else {
                record.node_id
            };
            Some(UsageRow {
                date,
                node_id,
                domain: record.domain,
                member: record.member_name,
                asn: record.asn,
                network_name: record.network_name,
                country_code: record.country_code,
                country_name: record.country_name,
                is_ipv6: record.is_ipv6,
                hits: record.hits,
            })
        })
        .collect()
}

/// Peers have emitted several date shapes over time; accept them all.
fn parse_date_flexible(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(raw) {
        return Some(datetime.date_naive());
    }
    if let Ok(datetime) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(datetime.date());
    }
    None
}

/// Time left until the next UTC top-of-hour.
fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let seconds_into_hour = now.timestamp().rem_euclid(3600).unsigned_abs();
    Duration::from_secs(3600 - seconds_into_hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn flexible_date_parsing() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert_eq!(parse_date_flexible("2025-01-02"), Some(expected));
        assert_eq!(parse_date_flexible(" 2025-01-02 "), Some(expected));
        assert_eq!(
            parse_date_flexible("2025-01-02T03:04:05Z"),
            Some(expected)
        );
        assert_eq!(
            parse_date_flexible("2025-01-02 03:04:05"),
            Some(expected)
        );
        assert_eq!(parse_date_flexible(""), None);
        assert_eq!(parse_date_flexible("02/01/2025"), None);
    }

    #[test]
    fn next_hour_alignment() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 15, 30).unwrap();
        assert_eq!(until_next_hour(now), Duration::from_secs(44 * 60 + 30));

        let on_the_hour = Utc.with_ymd_and_hms(2025, 1, 2, 3, 0, 0).unwrap();
        assert_eq!(until_next_hour(on_the_hour), Duration::from_secs(3600));
    }
}
