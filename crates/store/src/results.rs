use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use geofleet_config::{Check, CheckKind, Member, Service};
use serde::Serialize;

use crate::durable::OutageKey;
use crate::recorder::EventRecorder;

/// Free-form diagnostic payload attached to probe results.
pub type ProbeData = HashMap<String, serde_json::Value>;

/// The latest result one member produced for a check target.
#[derive(Clone, Debug, Serialize)]
pub struct ProbeResult {
    /// The member probed.
    pub member: Member,
    /// True when online.
    pub status: bool,
    /// When the probe ran (UTC).
    pub checktime: DateTime<Utc>,
    /// Error text for failed probes.
    pub error: String,
    /// Check-specific diagnostics.
    pub data: Option<ProbeData>,
    /// Address family probed.
    pub is_ipv6: bool,
}

/// Per-member results for one site check.
#[derive(Clone, Debug, Serialize)]
pub struct SiteResult {
    /// The check configuration.
    pub check: Check,
    /// Address family.
    pub is_ipv6: bool,
    /// One entry per member.
    pub results: Vec<ProbeResult>,
}

/// Per-member results for one domain check.
#[derive(Clone, Debug, Serialize)]
pub struct DomainResult {
    /// The check configuration.
    pub check: Check,
    /// Owning service, when resolvable from config.
    pub service: Option<Service>,
    /// Service domain probed.
    pub domain: String,
    /// Address family.
    pub is_ipv6: bool,
    /// One entry per member.
    pub results: Vec<ProbeResult>,
}

/// Per-member results for one endpoint check.
#[derive(Clone, Debug, Serialize)]
pub struct EndpointResult {
    /// The check configuration.
    pub check: Check,
    /// Owning service, when resolvable from config.
    pub service: Option<Service>,
    /// Service domain the endpoint belongs to.
    pub domain: String,
    /// The RPC URL probed.
    pub rpc_url: String,
    /// Address family.
    pub is_ipv6: bool,
    /// One entry per member.
    pub results: Vec<ProbeResult>,
}

/// Key addressing one member's latest result on a surface.
#[derive(Clone, Copy, Debug)]
pub struct StatusKey<'a> {
    /// Check kind.
    pub kind: CheckKind,
    /// Check name.
    pub check_name: &'a str,
    /// Member name.
    pub member: &'a str,
    /// Service domain; empty for site checks.
    pub domain: &'a str,
    /// Endpoint URL; empty except for endpoint checks.
    pub endpoint: &'a str,
    /// Address family.
    pub is_ipv6: bool,
}

/// Local observations consulted before casting a consensus vote.
pub trait LocalStatus: Send + Sync {
    /// The member's latest locally observed status, or `None` when this node
    /// has no observation for the key (the voter then abstains).
    fn local_status(&self, key: &StatusKey<'_>) -> Option<bool>;
}

/// A status transition observed while updating the official surface.
#[derive(Clone, Debug)]
pub struct Transition {
    /// Check kind.
    pub kind: CheckKind,
    /// Check name.
    pub check_name: String,
    /// Member name.
    pub member: String,
    /// Service domain; empty for site checks.
    pub domain: String,
    /// Endpoint URL; empty except for endpoint checks.
    pub endpoint: String,
    /// The new status.
    pub status: bool,
    /// Error text accompanying the new status.
    pub error: String,
    /// Diagnostics accompanying the new status.
    pub data: Option<ProbeData>,
    /// Address family.
    pub is_ipv6: bool,
}

impl Transition {
    /// The outage identity this transition opens or closes.
    #[must_use]
    pub fn outage_key(&self) -> OutageKey {
        let check_url = match self.kind {
            CheckKind::Endpoint => self.endpoint.clone(),
            CheckKind::Domain => self.domain.clone(),
            CheckKind::Site => String::new(),
        };
        OutageKey {
            kind: self.kind,
            check_name: self.check_name.clone(),
            check_url,
            domain: self.domain.clone(),
            member: self.member.clone(),
            is_ipv6: self.is_ipv6,
        }
    }
}

#[derive(Default)]
struct Surfaces {
    sites: Vec<SiteResult>,
    domains: Vec<DomainResult>,
    endpoints: Vec<EndpointResult>,
}

/// One result surface (local or official): latest per-member results keyed
/// by check target and address family.
///
/// Writers serialize behind the lock; readers get consistent snapshots.
#[derive(Default)]
pub struct ResultSurface {
    inner: RwLock<Surfaces>,
}

impl ResultSurface {
    /// An empty surface.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates a site-check result. Returns the transition when the member's
    /// status changed, or on first insertion of an offline result.
    pub fn update_site(
        &self,
        check: &Check,
        member: &Member,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) -> Option<Transition> {
        let result = new_result(member, status, error, data.clone(), is_ipv6);
        let mut inner = self.inner.write().expect("surface lock poisoned");

        let idx = inner
            .sites
            .iter()
            .position(|s| s.check.name == check.name && s.is_ipv6 == is_ipv6)
            .unwrap_or_else(|| {
                inner.sites.push(SiteResult {
                    check: check.clone(),
                    is_ipv6,
                    results: Vec::new(),
                });
                inner.sites.len() - 1
            });

        let changed = upsert_member(&mut inner.sites[idx].results, result);
        transition_for(changed, status, || Transition {
            kind: CheckKind::Site,
            check_name: check.name.clone(),
            member: member.name.clone(),
            domain: String::new(),
            endpoint: String::new(),
            status,
            error: error.to_owned(),
            data,
            is_ipv6,
        })
    }

    /// Updates a domain-check result.
    #[allow(clippy::too_many_arguments)]
    pub fn update_domain(
        &self,
        check: &Check,
        member: &Member,
        service: Option<&Service>,
        domain: &str,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) -> Option<Transition> {
        let result = new_result(member, status, error, data.clone(), is_ipv6);
        let mut inner = self.inner.write().expect("surface lock poisoned");

        let idx = inner
            .domains
            .iter()
            .position(|d| d.check.name == check.name && d.domain == domain && d.is_ipv6 == is_ipv6)
            .unwrap_or_else(|| {
                inner.domains.push(DomainResult {
                    check: check.clone(),
                    service: service.cloned(),
                    domain: domain.to_owned(),
                    is_ipv6,
                    results: Vec::new(),
                });
                inner.domains.len() - 1
            });

        let changed = upsert_member(&mut inner.domains[idx].results, result);
        transition_for(changed, status, || Transition {
            kind: CheckKind::Domain,
            check_name: check.name.clone(),
            member: member.name.clone(),
            domain: domain.to_owned(),
            endpoint: String::new(),
            status,
            error: error.to_owned(),
            data,
            is_ipv6,
        })
    }

    /// Updates an endpoint-check result.
    #[allow(clippy::too_many_arguments)]
    pub fn update_endpoint(
        &self,
        check: &Check,
        member: &Member,
        service: Option<&Service>,
        domain: &str,
        endpoint: &str,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) -> Option<Transition> {
        let result = new_result(member, status, error, data.clone(), is_ipv6);
        let mut inner = self.inner.write().expect("surface lock poisoned");

        let idx = inner
            .endpoints
            .iter()
            .position(|e| {
                e.check.name == check.name
                    && e.domain == domain
                    && e.rpc_url == endpoint
                    && e.is_ipv6 == is_ipv6
            })
            .unwrap_or_else(|| {
                inner.endpoints.push(EndpointResult {
                    check: check.clone(),
                    service: service.cloned(),
                    domain: domain.to_owned(),
                    rpc_url: endpoint.to_owned(),
                    is_ipv6,
                    results: Vec::new(),
                });
                inner.endpoints.len() - 1
            });

        let changed = upsert_member(&mut inner.endpoints[idx].results, result);
        transition_for(changed, status, || Transition {
            kind: CheckKind::Endpoint,
            check_name: check.name.clone(),
            member: member.name.clone(),
            domain: domain.to_owned(),
            endpoint: endpoint.to_owned(),
            status,
            error: error.to_owned(),
            data,
            is_ipv6,
        })
    }

    /// A consistent copy of all three result lists.
    #[must_use]
    pub fn snapshot(&self) -> (Vec<SiteResult>, Vec<DomainResult>, Vec<EndpointResult>) {
        let inner = self.inner.read().expect("surface lock poisoned");
        (
            inner.sites.clone(),
            inner.domains.clone(),
            inner.endpoints.clone(),
        )
    }
}

impl LocalStatus for ResultSurface {
    fn local_status(&self, key: &StatusKey<'_>) -> Option<bool> {
        let inner = self.inner.read().expect("surface lock poisoned");
        let results = match key.kind {
            CheckKind::Site => inner
                .sites
                .iter()
                .find(|s| s.check.name == key.check_name && s.is_ipv6 == key.is_ipv6)
                .map(|s| &s.results),
            CheckKind::Domain => inner
                .domains
                .iter()
                .find(|d| {
                    d.check.name == key.check_name
                        && d.domain == key.domain
                        && d.is_ipv6 == key.is_ipv6
                })
                .map(|d| &d.results),
            CheckKind::Endpoint => inner
                .endpoints
                .iter()
                .find(|e| {
                    e.check.name == key.check_name
                        && e.domain == key.domain
                        && e.rpc_url == key.endpoint
                        && e.is_ipv6 == key.is_ipv6
                })
                .map(|e| &e.results),
        }?;
        results
            .iter()
            .find(|r| r.member.name == key.member)
            .map(|r| r.status)
    }
}

/// The official surface plus the event recorder fed by its transitions.
pub struct OfficialStore {
    surface: ResultSurface,
    recorder: EventRecorder,
}

impl OfficialStore {
    /// Creates an official store recording transitions through `recorder`.
    #[must_use]
    pub fn new(recorder: EventRecorder) -> Self {
        Self {
            surface: ResultSurface::new(),
            recorder,
        }
    }

    /// Read access to the underlying surface.
    #[must_use]
    pub fn surface(&self) -> &ResultSurface {
        &self.surface
    }

    /// Applies an agreed site result and records any transition.
    pub async fn apply_site(
        &self,
        check: &Check,
        member: &Member,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) {
        if let Some(transition) = self
            .surface
            .update_site(check, member, status, error, data, is_ipv6)
        {
            self.recorder.record(&transition).await;
        }
    }

    /// Applies an agreed domain result and records any transition.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_domain(
        &self,
        check: &Check,
        member: &Member,
        service: Option<&Service>,
        domain: &str,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) {
        if let Some(transition) = self
            .surface
            .update_domain(check, member, service, domain, status, error, data, is_ipv6)
        {
            self.recorder.record(&transition).await;
        }
    }

    /// Applies an agreed endpoint result and records any transition.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_endpoint(
        &self,
        check: &Check,
        member: &Member,
        service: Option<&Service>,
        domain: &str,
        endpoint: &str,
        status: bool,
        error: &str,
        data: Option<ProbeData>,
        is_ipv6: bool,
    ) {
        if let Some(transition) = self.surface.update_endpoint(
            check, member, service, domain, endpoint, status, error, data, is_ipv6,
        ) {
            self.recorder.record(&transition).await;
        }
    }
}

fn new_result(
    member: &Member,
    status: bool,
    error: &str,
    data: Option<ProbeData>,
    is_ipv6: bool,
) -> ProbeResult {
    ProbeResult {
        member: member.clone(),
        status,
        checktime: Utc::now(),
        error: error.to_owned(),
        data,
        is_ipv6,
    }
}

enum MemberChange {
    FirstInsert,
    Flipped,
    Unchanged,
}

fn upsert_member(results: &mut Vec<ProbeResult>, result: ProbeResult) -> MemberChange {
    match results
        .iter_mut()
        .find(|r| r.member.name == result.member.name)
    {
        None => {
            results.push(result);
            MemberChange::FirstInsert
        }
        Some(existing) => {
            let flipped = existing.status != result.status;
            *existing = result;
            if flipped {
                MemberChange::Flipped
            } else {
                MemberChange::Unchanged
            }
        }
    }
}

fn transition_for(
    change: MemberChange,
    status: bool,
    make: impl FnOnce() -> Transition,
) -> Option<Transition> {
    match change {
        // A first observation only matters when it is already offline.
        MemberChange::FirstInsert if !status => Some(make()),
        MemberChange::Flipped => Some(make()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    fn check(kind: CheckKind) -> Check {
        Check {
            name: "probe".into(),
            enabled: true,
            kind,
            timeout_secs: 10,
            minimum_interval_secs: 0,
            extra_options: HashMap::new(),
        }
    }

    fn member(name: &str) -> Member {
        Member {
            name: name.into(),
            service_address: None,
            ipv6: false,
            override_disabled: false,
            override_time: None,
        }
    }

    #[test]
    fn first_online_insert_is_not_a_transition() {
        let surface = ResultSurface::new();
        let t = surface.update_site(
            &check(CheckKind::Site),
            &member("m1"),
            true,
            "",
            None,
            false,
        );
        assert!(t.is_none());
    }

    #[test]
    fn first_offline_insert_is_a_transition() {
        let surface = ResultSurface::new();
        let t = surface.update_site(
            &check(CheckKind::Site),
            &member("m1"),
            false,
            "down",
            None,
            false,
        );
        assert!(t.is_some());
    }

    #[test]
    fn flips_are_transitions_and_repeats_are_not() {
        let surface = ResultSurface::new();
        let c = check(CheckKind::Domain);
        let m = member("m1");

        surface.update_domain(&c, &m, None, "d.example", true, "", None, false);
        let flip = surface.update_domain(&c, &m, None, "d.example", false, "err", None, false);
        assert!(flip.is_some());
        let repeat = surface.update_domain(&c, &m, None, "d.example", false, "err", None, false);
        assert!(repeat.is_none());
    }

    #[test]
    fn status_lookup_distinguishes_address_families() {
        let surface = ResultSurface::new();
        let c = check(CheckKind::Endpoint);
        let m = member("m1");

        surface.update_endpoint(&c, &m, None, "d.example", "wss://e", true, "", None, false);
        surface.update_endpoint(&c, &m, None, "d.example", "wss://e", false, "err", None, true);

        let v4 = StatusKey {
            kind: CheckKind::Endpoint,
            check_name: "probe",
            member: "m1",
            domain: "d.example",
            endpoint: "wss://e",
            is_ipv6: false,
        };
        assert_eq!(surface.local_status(&v4), Some(true));
        assert_eq!(
            surface.local_status(&StatusKey { is_ipv6: true, ..v4 }),
            Some(false)
        );
        assert_eq!(
            surface.local_status(&StatusKey { member: "m2", ..v4 }),
            None
        );
    }

    #[tokio::test]
    async fn official_apply_feeds_the_recorder() {
        let store = Arc::new(MemoryStore::new());
        let official = OfficialStore::new(EventRecorder::new(store.clone()));
        let c = check(CheckKind::Site);
        let m = member("m1");

        official.apply_site(&c, &m, false, "down", None, false).await;
        assert_eq!(store.event_rows().len(), 1);

        // Same status again: no new transition, no duplicate row.
        official.apply_site(&c, &m, false, "down", None, false).await;
        assert_eq!(store.event_rows().len(), 1);
    }
}
