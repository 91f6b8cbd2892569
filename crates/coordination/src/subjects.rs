//! Well-known wire subjects. These are cluster-wide constants; changing one
//! is a breaking protocol change.

/// New proposals, fanned out to every node.
pub const PROPOSE: &str = "consensus.propose";

/// Votes on open proposals.
pub const VOTE: &str = "consensus.vote";

/// Finalize fan-out once a proposal is decided.
pub const FINALIZE: &str = "consensus.finalize";

/// Join gossip and membership traffic.
pub const CLUSTER: &str = "consensus.cluster";

/// Usage scatter requests, answered by DNS nodes.
pub const USAGE_REQUEST: &str = "dns.usage.getUsage";

/// Usage broadcasts (responses without a reply inbox).
pub const USAGE_DATA: &str = "dns.usage.usageData";

/// Downtime scatter requests, answered by monitors.
pub const DOWNTIME_REQUEST: &str = "monitor.stats.getDowntime";

/// Downtime broadcasts (responses without a reply inbox).
pub const DOWNTIME_DATA: &str = "monitor.stats.downtimeData";

/// Substring identifying usage reply inboxes.
pub const USAGE_REPLY_TAG: &str = "usageReply";

/// Substring identifying downtime reply inboxes.
pub const DOWNTIME_REPLY_TAG: &str = "downtimeReply";
