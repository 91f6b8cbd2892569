use std::collections::HashMap;

use crate::types::{Check, CheckKind, Config, Member, Service};

/// An immutable view of the configuration with lookup tables built at
/// construction time. Handed out behind an `Arc`; never mutated in place.
#[derive(Debug)]
pub struct Snapshot {
    config: Config,
    checks_by_key: HashMap<(String, CheckKind), usize>,
    service_by_domain: HashMap<String, String>,
}

impl Snapshot {
    /// Builds the lookup tables for a parsed config.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut checks_by_key = HashMap::with_capacity(config.checks.len());
        for (idx, check) in config.checks.iter().enumerate() {
            checks_by_key.insert((check.name.clone(), check.kind), idx);
        }

        let mut service_by_domain = HashMap::new();
        for service in config.services.values() {
            for provider in service.providers.values() {
                for rpc_url in &provider.rpc_urls {
                    if let Some(domain) = host_of(rpc_url) {
                        service_by_domain
                            .entry(domain.to_ascii_lowercase())
                            .or_insert_with(|| service.name.clone());
                    }
                }
            }
        }

        Self {
            config,
            checks_by_key,
            service_by_domain,
        }
    }

    /// The raw parsed config.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up a check by name and kind.
    #[must_use]
    pub fn check(&self, name: &str, kind: CheckKind) -> Option<&Check> {
        self.checks_by_key
            .get(&(name.to_owned(), kind))
            .map(|idx| &self.config.checks[*idx])
    }

    /// Looks up a member by name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.config.members.get(name)
    }

    /// Finds the service that owns a domain, by provider RPC URL host.
    #[must_use]
    pub fn service_for_domain(&self, domain: &str) -> Option<&Service> {
        let name = self.service_by_domain.get(&domain.to_ascii_lowercase())?;
        self.config.services.get(name)
    }

    /// Chat user ids to mention for a member, keyed case-insensitively.
    #[must_use]
    pub fn member_mentions(&self, member: &str) -> &[String] {
        self.config
            .alerts
            .member_mentions
            .get(&member.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }
}

fn host_of(rpc_url: &str) -> Option<String> {
    url::Url::parse(rpc_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Provider, SystemSettings};

    fn config_with_service() -> Config {
        let mut services = HashMap::new();
        let mut providers = HashMap::new();
        providers.insert(
            "member-a".to_owned(),
            Provider {
                rpc_urls: vec!["wss://rpc.example.net/ws".to_owned()],
            },
        );
        services.insert(
            "chain".to_owned(),
            Service {
                name: "chain".to_owned(),
                providers,
            },
        );

        let mut members = HashMap::new();
        members.insert(
            "member-a".to_owned(),
            Member {
                name: "member-a".to_owned(),
                service_address: None,
                ipv6: true,
                override_disabled: false,
                override_time: None,
            },
        );

        Config {
            system: SystemSettings {
                node_id: "monitor-01".to_owned(),
                ..SystemSettings::default()
            },
            nats: crate::NatsSettings::default(),
            mysql: crate::MysqlSettings::default(),
            matrix: crate::MatrixSettings::default(),
            alerts: crate::AlertsSettings::default(),
            consensus: crate::ConsensusTuning::default(),
            checks: vec![Check {
                name: "wss".to_owned(),
                enabled: true,
                kind: CheckKind::Endpoint,
                timeout_secs: 10,
                minimum_interval_secs: 0,
                extra_options: HashMap::new(),
            }],
            members,
            services,
        }
    }

    #[test]
    fn indexes_resolve_keyed_lookups() {
        let snapshot = Snapshot::new(config_with_service());

        assert!(snapshot.check("wss", CheckKind::Endpoint).is_some());
        assert!(snapshot.check("wss", CheckKind::Site).is_none());
        assert!(snapshot.member("member-a").is_some());
        assert_eq!(
            snapshot.service_for_domain("RPC.EXAMPLE.NET").map(|s| s.name.as_str()),
            Some("chain")
        );
        assert!(snapshot.service_for_domain("other.example").is_none());
    }
}
