//! Wire messages. Field names are part of the protocol and mirror what the
//! fleet already speaks; do not rename them casually.

use chrono::{DateTime, Utc};
use geofleet_config::CheckKind;
use geofleet_store::ProbeData;
use serde::{Deserialize, Serialize};

/// Unique id of one consensus proposal.
pub type ProposalId = String;

/// A claim that a check's status changed, subject to cluster vote.
/// Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique proposal id.
    #[serde(rename = "ID")]
    pub id: ProposalId,

    /// Node that created the proposal.
    #[serde(rename = "SenderNodeID")]
    pub sender_node_id: String,

    /// What kind of check observed the transition.
    #[serde(rename = "CheckType")]
    pub check_type: CheckKind,

    /// Check name.
    #[serde(rename = "CheckName")]
    pub check_name: String,

    /// Member whose status changed.
    #[serde(rename = "MemberName")]
    pub member_name: String,

    /// Service domain; empty for site checks.
    #[serde(rename = "DomainName", default)]
    pub domain_name: String,

    /// Endpoint URL; empty except for endpoint checks.
    #[serde(rename = "Endpoint", default)]
    pub endpoint: String,

    /// Proposed status; true means online.
    #[serde(rename = "ProposedStatus")]
    pub proposed_status: bool,

    /// Error text from the observing check.
    #[serde(rename = "ErrorText", default)]
    pub error_text: String,

    /// Check-specific diagnostics.
    #[serde(rename = "Data", default)]
    pub data: Option<ProbeData>,

    /// Address family.
    #[serde(rename = "IsIPv6", default)]
    pub is_ipv6: bool,

    /// Creation time (UTC).
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Proposal {
    /// Semantic equality: everything except id, sender, timestamp, error and
    /// diagnostics. Two semantically equal open proposals describe the same
    /// transition and must not race each other.
    #[must_use]
    pub fn same_transition(&self, other: &Self) -> bool {
        self.check_type == other.check_type
            && self.check_name == other.check_name
            && self.member_name == other.member_name
            && self.domain_name == other.domain_name
            && self.endpoint == other.endpoint
            && self.proposed_status == other.proposed_status
            && self.is_ipv6 == other.is_ipv6
    }

    /// The URL column persisted with outage rows.
    #[must_use]
    pub fn check_url(&self) -> String {
        match self.check_type {
            CheckKind::Endpoint => self.endpoint.clone(),
            CheckKind::Domain => self.domain_name.clone(),
            CheckKind::Site => String::new(),
        }
    }
}

/// One node's vote on a proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    /// The proposal voted on.
    #[serde(rename = "ProposalID")]
    pub proposal_id: ProposalId,

    /// Voting node.
    #[serde(rename = "SenderNodeID")]
    pub sender_node_id: String,

    /// Agreement with the proposed status.
    #[serde(rename = "Agree")]
    pub agree: bool,

    /// When the vote was cast (UTC).
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Terminal fan-out of a consensus round. Re-applying the same finalize
/// yields the same observable state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeMessage {
    /// The decided proposal.
    #[serde(rename = "Proposal")]
    pub proposal: Proposal,

    /// Whether the cluster agreed with the proposed status.
    #[serde(rename = "Passed")]
    pub passed: bool,

    /// Decision time (UTC).
    #[serde(rename = "DecidedAt")]
    pub decided_at: DateTime<Utc>,
}

/// Fleet usage query, scattered to DNS nodes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageRequest {
    /// Inclusive start day, `YYYY-MM-DD`.
    #[serde(rename = "startDate")]
    pub start_date: String,

    /// Inclusive end day, `YYYY-MM-DD`.
    #[serde(rename = "endDate")]
    pub end_date: String,

    /// Optional domain filter.
    #[serde(rename = "domain", default)]
    pub domain: String,

    /// Optional member filter.
    #[serde(rename = "memberName", default)]
    pub member_name: String,

    /// Optional country-code filter.
    #[serde(rename = "country", default)]
    pub country: String,
}

/// One usage record on the wire. The date stays a string here; collators
/// parse it flexibly on ingestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireUsageRecord {
    /// Day the hits were counted on.
    #[serde(rename = "date")]
    pub date: String,

    /// Counting DNS node; filled from the response envelope when absent.
    #[serde(rename = "nodeID", default)]
    pub node_id: String,

    /// Service domain.
    #[serde(rename = "domain")]
    pub domain: String,

    /// Member name.
    #[serde(rename = "memberName")]
    pub member_name: String,

    /// Client ASN.
    #[serde(rename = "asn", default)]
    pub asn: String,

    /// Client network name.
    #[serde(rename = "networkName", default)]
    pub network_name: String,

    /// Client country code.
    #[serde(rename = "countryCode", default)]
    pub country_code: String,

    /// Client country name.
    #[serde(rename = "countryName", default)]
    pub country_name: String,

    /// Address family of the counted queries.
    #[serde(rename = "isIPv6", default)]
    pub is_ipv6: bool,

    /// Hit total for the identity tuple.
    #[serde(rename = "hits")]
    pub hits: u64,
}

/// Reply to a [`UsageRequest`]. Parse or query errors produce an empty
/// record list with a non-empty `error`; responders never drop a reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageResponse {
    /// Responding node.
    #[serde(rename = "nodeID")]
    pub node_id: String,

    /// Matching usage records.
    #[serde(rename = "usageRecords")]
    pub usage_records: Vec<WireUsageRecord>,

    /// Error text, when the query failed.
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fleet downtime query, scattered to monitors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DowntimeRequest {
    /// Window start (UTC).
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,

    /// Window end (UTC).
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,

    /// Optional member filter; empty means all members.
    #[serde(rename = "memberName", default)]
    pub member_name: String,
}

/// One downtime event on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DowntimeEvent {
    /// Member name.
    #[serde(rename = "memberName")]
    pub member_name: String,

    /// Check kind.
    #[serde(rename = "checkType")]
    pub check_type: CheckKind,

    /// Check name.
    #[serde(rename = "checkName")]
    pub check_name: String,

    /// Service domain, when applicable.
    #[serde(rename = "domainName", default, skip_serializing_if = "String::is_empty")]
    pub domain_name: String,

    /// Endpoint URL, when applicable.
    #[serde(rename = "endpoint", default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    /// Status; false while offline.
    #[serde(rename = "status")]
    pub status: bool,

    /// When the outage opened (UTC).
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,

    /// When the outage closed; `None` while open.
    #[serde(rename = "endTime", default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Error text from the failing check.
    #[serde(rename = "errorText", default)]
    pub error_text: String,

    /// Diagnostics.
    #[serde(rename = "data", default)]
    pub data: Option<ProbeData>,

    /// Address family.
    #[serde(rename = "isIPv6", default)]
    pub is_ipv6: bool,
}

/// Reply to a [`DowntimeRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DowntimeResponse {
    /// Responding node.
    #[serde(rename = "nodeID")]
    pub node_id: String,

    /// Matching events.
    #[serde(rename = "events")]
    pub events: Vec<DowntimeEvent>,

    /// Error text, when the query failed.
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
