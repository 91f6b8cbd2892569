use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of probe a check performs.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Member site (infrastructure-level) probe.
    Site,
    /// Service-domain probe.
    Domain,
    /// Individual RPC endpoint probe.
    Endpoint,
}

impl CheckKind {
    /// Wire/database representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Domain => "domain",
            Self::Endpoint => "endpoint",
        }
    }

    /// Numeric representation used by the events table.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Site => 1,
            Self::Domain => 2,
            Self::Endpoint => 3,
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "site" => Some(Self::Site),
            "domain" => Some(Self::Domain),
            "endpoint" => Some(Self::Endpoint),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named probe configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Check {
    /// Check name, unique per kind.
    pub name: String,
    /// Disabled checks stay in config but never run.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// What the check probes.
    pub kind: CheckKind,
    /// Probe timeout in seconds.
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
    /// Minimum seconds between consecutive probes of one target.
    #[serde(default)]
    pub minimum_interval_secs: u64,
    /// Checker-specific options, passed through untouched.
    #[serde(default)]
    pub extra_options: HashMap<String, serde_json::Value>,
}

/// A member organisation whose infrastructure is probed and routed to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    /// Member name; the identity used across consensus and persistence.
    pub name: String,
    /// Member-operated service hostname, when it has one.
    #[serde(default)]
    pub service_address: Option<String>,
    /// Whether the member serves IPv6.
    #[serde(default)]
    pub ipv6: bool,
    /// Manual kill-switch set by operators; survives config reloads.
    #[serde(default)]
    pub override_disabled: bool,
    /// When the override was last changed.
    #[serde(default)]
    pub override_time: Option<DateTime<Utc>>,
}

/// One member's endpoints for a service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Provider {
    /// RPC URLs served by this provider.
    #[serde(default)]
    pub rpc_urls: Vec<String>,
}

/// A service (e.g. a chain) with per-member providers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Service {
    /// Service name.
    pub name: String,
    /// Providers keyed by member name.
    #[serde(default)]
    pub providers: HashMap<String, Provider>,
}

/// Broker connection settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NatsSettings {
    /// Server URL.
    pub url: String,
    /// Optional username.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Relational store settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MysqlSettings {
    /// Hostname.
    pub host: String,
    /// Port.
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
}

impl MysqlSettings {
    /// Connection string for the pool. Timestamps are exchanged in UTC.
    #[must_use]
    pub fn dsn(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Chat-notification transport settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MatrixSettings {
    /// Homeserver base URL.
    #[serde(default)]
    pub homeserver_url: String,
    /// Login username.
    #[serde(default)]
    pub username: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Destination room.
    #[serde(default)]
    pub room_id: String,
}

impl MatrixSettings {
    /// True when every field needed for login is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !(self.homeserver_url.is_empty()
            || self.username.is_empty()
            || self.password.is_empty()
            || self.room_id.is_empty())
    }
}

/// Alerting settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AlertsSettings {
    /// Chat user ids to mention per member (keys lower-cased on lookup).
    #[serde(default)]
    pub member_mentions: HashMap<String, Vec<String>>,
}

/// Consensus and membership tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusTuning {
    /// Seconds before a proposal is force-evaluated.
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_secs: u64,
    /// Minimum agreeing (or disagreeing) votes needed to finalize.
    /// 2 is the safe floor for clusters of three or more monitors; set 1
    /// only for single-monitor deployments.
    #[serde(default = "default_min_votes")]
    pub min_votes: usize,
    /// Window within which a node counts as active.
    #[serde(default = "default_active_window")]
    pub active_window_secs: u64,
    /// Nodes unheard for longer than this are evicted.
    #[serde(default = "default_stale_window")]
    pub stale_window_secs: u64,
    /// Interval between JOIN heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// How many JOINs to burst at start-up.
    #[serde(default = "default_join_retries")]
    pub join_retries: u32,
    /// Delay between start-up JOINs, in milliseconds.
    #[serde(default = "default_join_delay_ms")]
    pub join_delay_ms: u64,
}

impl Default for ConsensusTuning {
    fn default() -> Self {
        Self {
            proposal_timeout_secs: default_proposal_timeout(),
            min_votes: default_min_votes(),
            active_window_secs: default_active_window(),
            stale_window_secs: default_stale_window(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            join_retries: default_join_retries(),
            join_delay_ms: default_join_delay_ms(),
        }
    }
}

impl ConsensusTuning {
    /// Proposal timeout as a [`Duration`].
    #[must_use]
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(self.proposal_timeout_secs)
    }

    /// Active-node window as a [`Duration`].
    #[must_use]
    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    /// Stale-node window as a [`Duration`].
    #[must_use]
    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Delay between start-up JOIN broadcasts.
    #[must_use]
    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }
}

/// Node-local settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Cluster-wide node identity; must be non-empty.
    pub node_id: String,
    /// Log filter, e.g. `info` or `geofleet=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between config reloads.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

/// The full parsed configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Node-local settings.
    pub system: SystemSettings,
    /// Broker settings.
    pub nats: NatsSettings,
    /// Relational store settings.
    #[serde(default)]
    pub mysql: MysqlSettings,
    /// Chat transport settings.
    #[serde(default)]
    pub matrix: MatrixSettings,
    /// Alerting settings.
    #[serde(default)]
    pub alerts: AlertsSettings,
    /// Consensus tuning.
    #[serde(default)]
    pub consensus: ConsensusTuning,
    /// Probe configurations.
    #[serde(default)]
    pub checks: Vec<Check>,
    /// Members keyed by name.
    #[serde(default)]
    pub members: HashMap<String, Member>,
    /// Services keyed by name.
    #[serde(default)]
    pub services: HashMap<String, Service>,
}

fn default_true() -> bool {
    true
}

fn default_check_timeout() -> u64 {
    10
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_proposal_timeout() -> u64 {
    30
}

fn default_min_votes() -> usize {
    2
}

fn default_active_window() -> u64 {
    600
}

fn default_stale_window() -> u64 {
    900
}

fn default_heartbeat_interval() -> u64 {
    90
}

fn default_join_retries() -> u32 {
    3
}

fn default_join_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_reload_interval() -> u64 {
    300
}
