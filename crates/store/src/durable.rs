use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use geofleet_config::CheckKind;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{Error, Result};

/// One day of usage for one client population slice, as persisted in the
/// `requests` table. Everything except `hits` is identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    /// UTC day the hits were counted on.
    pub date: NaiveDate,
    /// DNS node that counted the hits.
    pub node_id: String,
    /// Service domain queried.
    pub domain: String,
    /// Member the query was routed to.
    pub member: String,
    /// Client autonomous system number.
    pub asn: String,
    /// Client network name.
    pub network_name: String,
    /// Client country code.
    pub country_code: String,
    /// Client country name.
    pub country_name: String,
    /// Whether the query arrived over IPv6.
    pub is_ipv6: bool,
    /// Total hits for this identity tuple. Replaced on upsert, never summed.
    pub hits: u64,
}

/// The identity portion of a [`UsageRow`].
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct UsageRowKey {
    /// UTC day.
    pub date: NaiveDate,
    /// Counting DNS node.
    pub node_id: String,
    /// Service domain.
    pub domain: String,
    /// Member name.
    pub member: String,
    /// Client ASN.
    pub asn: String,
    /// Client network name.
    pub network_name: String,
    /// Client country code.
    pub country_code: String,
    /// Client country name.
    pub country_name: String,
    /// IPv6 flag.
    pub is_ipv6: bool,
}

impl UsageRow {
    /// The row's identity tuple.
    #[must_use]
    pub fn key(&self) -> UsageRowKey {
        UsageRowKey {
            date: self.date,
            node_id: self.node_id.clone(),
            domain: self.domain.clone(),
            member: self.member.clone(),
            asn: self.asn.clone(),
            network_name: self.network_name.clone(),
            country_code: self.country_code.clone(),
            country_name: self.country_name.clone(),
            is_ipv6: self.is_ipv6,
        }
    }
}

/// Identity of a distinct outage, used for open-row lookups and
/// notification deduplication.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct OutageKey {
    /// What kind of check failed.
    pub kind: CheckKind,
    /// Check name.
    pub check_name: String,
    /// Probed URL (endpoint URL, domain name, or empty for site checks).
    pub check_url: String,
    /// Service domain, when applicable.
    pub domain: String,
    /// Member name.
    pub member: String,
    /// IPv6 flag.
    pub is_ipv6: bool,
}

/// One row of the `member_events` table.
#[derive(Clone, Debug)]
pub struct OutageRecord {
    /// Outage identity.
    pub key: OutageKey,
    /// False while the member is offline.
    pub status: bool,
    /// When the outage opened (UTC).
    pub start_time: DateTime<Utc>,
    /// When the outage closed; `None` while open.
    pub end_time: Option<DateTime<Utc>>,
    /// Error text from the failing check.
    pub error: String,
    /// Per-node votes at finalization time.
    pub vote_data: Option<HashMap<String, bool>>,
    /// Check-specific diagnostic payload.
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

/// A persisted event with its row id.
#[derive(Clone, Debug)]
pub struct StoredEvent {
    /// Backend row id.
    pub id: i64,
    /// The event payload.
    pub record: OutageRecord,
}

/// Durable, idempotent persistence of usage totals.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Inserts or replaces the row identified by [`UsageRow::key`]. `hits`
    /// is REPLACED on conflict so replaying a period converges instead of
    /// compounding.
    async fn upsert_usage(&self, row: &UsageRow) -> Result<()>;
}

/// Durable persistence of outage events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Opens an outage row. When an open row for the same key already
    /// exists, the error and vote data are refreshed instead of inserting a
    /// duplicate.
    async fn insert_outage(&self, record: &OutageRecord) -> Result<()>;

    /// Closes the open outage for `key`, setting `end_time` to now. Returns
    /// whether a row was closed.
    async fn close_outage(&self, key: &OutageKey) -> Result<bool>;

    /// The currently open offline row for `key`, if any.
    async fn find_open_outage(&self, key: &OutageKey) -> Result<Option<StoredEvent>>;

    /// Closes one event by row id.
    async fn close_event(&self, id: i64, end_time: DateTime<Utc>) -> Result<()>;

    /// Removes one event by row id (short-flap suppression).
    async fn delete_event(&self, id: i64) -> Result<()>;

    /// Events overlapping the window, optionally filtered by member.
    async fn fetch_events(
        &self,
        member: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>>;
}

/// Upserts a batch of usage rows. Row failures are logged and accumulated;
/// the batch never aborts early.
///
/// # Errors
///
/// Returns [`Error::Batch`] when at least one row failed.
pub async fn store_usage_batch(store: &dyn UsageStore, rows: &[UsageRow]) -> Result<()> {
    let mut failed = 0;
    let mut first = String::new();
    for row in rows {
        if let Err(err) = store.upsert_usage(row).await {
            error!(domain = %row.domain, member = %row.member, %err, "usage upsert failed");
            if failed == 0 {
                first = err.to_string();
            }
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(Error::Batch { failed, first });
    }
    Ok(())
}
