use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only cluster message type currently on the wire.
pub const JOIN_TYPE: &str = "join";

/// Cluster-wide node identity.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id never identifies a node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Role a node advertises in the cluster.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Probes member infrastructure and votes on status transitions.
    Monitor,
    /// Serves DNS queries and records per-client usage.
    Dns,
    /// Aggregates usage and persists consensus outcomes.
    Collator,
    /// Role not (yet) known.
    #[default]
    Unknown,
}

impl Role {
    /// True for every role except [`Role::Unknown`].
    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

/// Infers a role from a node-id naming convention. Only used for peers that
/// were heard from before their JOIN arrived.
#[must_use]
pub fn infer_role(id: &str) -> Role {
    let id = id.to_ascii_lowercase();
    if id.contains("monitor") {
        Role::Monitor
    } else if id.contains("dns") {
        Role::Dns
    } else {
        Role::Unknown
    }
}

/// A cluster peer as tracked by the registry and carried in JOIN gossip.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Node {
    /// Node identity.
    #[serde(rename = "nodeId")]
    pub id: NodeId,

    /// Advertised role.
    #[serde(rename = "nodeRole", default, deserialize_with = "role_or_unknown")]
    pub role: Role,

    /// Externally reachable address, when advertised.
    #[serde(rename = "publicAddress", default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    /// Bind address, when advertised.
    #[serde(rename = "listenAddress", default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,

    /// When this node was last heard from. Monotonic per node.
    #[serde(rename = "lastHeard", default)]
    pub last_heard: Option<DateTime<Utc>>,
}

impl Node {
    /// A node record with just an identity and role.
    pub fn new(id: impl Into<NodeId>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            ..Self::default()
        }
    }
}

/// Peers running newer builds may advertise roles we do not know; treat
/// those as [`Role::Unknown`] instead of rejecting the whole message.
fn role_or_unknown<'de, D>(deserializer: D) -> Result<Role, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(match raw.as_str() {
        "monitor" => Role::Monitor,
        "dns" => Role::Dns,
        "collator" => Role::Collator,
        _ => Role::Unknown,
    })
}

/// Gossip envelope on the cluster subject.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Message type; only [`JOIN_TYPE`] today.
    #[serde(rename = "type")]
    pub kind: String,

    /// The sending node's record.
    pub sender: Node,

    /// Optional membership piggyback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<Node>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_inference_is_substring_based() {
        assert_eq!(infer_role("geo-monitor-03"), Role::Monitor);
        assert_eq!(infer_role("Dns-eu-west"), Role::Dns);
        assert_eq!(infer_role("collator-1"), Role::Unknown);
        assert_eq!(infer_role(""), Role::Unknown);
    }

    #[test]
    fn unknown_roles_deserialize_without_error() {
        let node: Node = serde_json::from_str(
            r#"{"nodeId":"x","nodeRole":"something-new"}"#,
        )
        .unwrap();
        assert_eq!(node.role, Role::Unknown);
    }
}
