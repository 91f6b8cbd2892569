use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::durable::UsageRow;
use crate::Result;

/// Client-IP enrichment used while counting DNS usage.
pub trait GeoIp: Send + Sync {
    /// ISO country code for the client, when known.
    fn country_code(&self, ip: IpAddr) -> Option<String>;

    /// Country name for the client, when known.
    fn country_name(&self, ip: IpAddr) -> Option<String>;

    /// Autonomous system number and network name, when known.
    fn asn_and_network(&self, ip: IpAddr) -> Option<(String, String)>;
}

/// GeoIP provider that knows nothing. Usage is still counted, attributed to
/// empty network fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullGeoIp;

impl GeoIp for NullGeoIp {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    fn country_name(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    fn asn_and_network(&self, _ip: IpAddr) -> Option<(String, String)> {
        None
    }
}

/// Entry served by [`StaticGeoIp`].
#[derive(Clone, Debug)]
pub struct GeoEntry {
    /// ISO country code.
    pub country_code: String,
    /// Country name.
    pub country_name: String,
    /// Autonomous system number.
    pub asn: String,
    /// Network name.
    pub network_name: String,
}

/// Fixed-table GeoIP provider for tests and offline use.
#[derive(Clone, Debug, Default)]
pub struct StaticGeoIp {
    entries: HashMap<IpAddr, GeoEntry>,
}

impl StaticGeoIp {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one client address.
    pub fn insert(&mut self, ip: IpAddr, entry: GeoEntry) {
        self.entries.insert(ip, entry);
    }
}

impl GeoIp for StaticGeoIp {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        self.entries.get(&ip).map(|e| e.country_code.clone())
    }

    fn country_name(&self, ip: IpAddr) -> Option<String> {
        self.entries.get(&ip).map(|e| e.country_name.clone())
    }

    fn asn_and_network(&self, ip: IpAddr) -> Option<(String, String)> {
        self.entries
            .get(&ip)
            .map(|e| (e.asn.clone(), e.network_name.clone()))
    }
}

/// Source of local usage records, queried by the fleet usage responder.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Usage rows within `[start, end]`, optionally filtered.
    async fn usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        domain: Option<&str>,
        member: Option<&str>,
        country: Option<&str>,
    ) -> Result<Vec<UsageRow>>;
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct LedgerKey {
    date: NaiveDate,
    domain: String,
    member: String,
    asn: String,
    network_name: String,
    country_code: String,
    country_name: String,
    is_ipv6: bool,
}

/// Per-day in-memory usage counters kept by DNS nodes.
///
/// Every answered query bumps one counter keyed by the full identity tuple;
/// the hourly collator pulls these through the usage responder. The ipv6
/// flag is carried end to end.
pub struct UsageLedger {
    node_id: String,
    geoip: Arc<dyn GeoIp>,
    counters: RwLock<HashMap<LedgerKey, u64>>,
}

impl UsageLedger {
    /// Creates a ledger counting on behalf of `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>, geoip: Arc<dyn GeoIp>) -> Self {
        Self {
            node_id: node_id.into(),
            geoip,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Counts one answered query for today (UTC).
    pub fn record_query(&self, client: IpAddr, domain: &str, member: &str, is_ipv6: bool) {
        let (asn, network_name) = self.geoip.asn_and_network(client).unwrap_or_default();
        let key = LedgerKey {
            date: Utc::now().date_naive(),
            domain: domain.to_owned(),
            member: member.to_owned(),
            asn,
            network_name,
            country_code: self.geoip.country_code(client).unwrap_or_default(),
            country_name: self.geoip.country_name(client).unwrap_or_default(),
            is_ipv6,
        };
        *self
            .counters
            .write()
            .expect("ledger lock poisoned")
            .entry(key)
            .or_insert(0) += 1;
    }

    /// Drops counters for days before `cutoff`; collected days no longer
    /// need local copies.
    pub fn prune_before(&self, cutoff: NaiveDate) {
        self.counters
            .write()
            .expect("ledger lock poisoned")
            .retain(|key, _| key.date >= cutoff);
    }
}

#[async_trait]
impl UsageSource for UsageLedger {
    async fn usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        domain: Option<&str>,
        member: Option<&str>,
        country: Option<&str>,
    ) -> Result<Vec<UsageRow>> {
        let counters = self.counters.read().expect("ledger lock poisoned");
        Ok(counters
            .iter()
            .filter(|(key, _)| key.date >= start && key.date <= end)
            .filter(|(key, _)| domain.is_none_or(|d| key.domain.eq_ignore_ascii_case(d)))
            .filter(|(key, _)| member.is_none_or(|m| key.member == m))
            .filter(|(key, _)| country.is_none_or(|c| key.country_code.eq_ignore_ascii_case(c)))
            .map(|(key, hits)| UsageRow {
                date: key.date,
                node_id: self.node_id.clone(),
                domain: key.domain.clone(),
                member: key.member.clone(),
                asn: key.asn.clone(),
                network_name: key.network_name.clone(),
                country_code: key.country_code.clone(),
                country_name: key.country_name.clone(),
                is_ipv6: key.is_ipv6,
                hits: *hits,
            })
            .collect())
    }
}
