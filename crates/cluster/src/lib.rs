//! Soft cluster membership for geofleet nodes.
//!
//! Membership is gossip-based: any inbound message refreshes the sender's
//! last-heard timestamp, JOIN broadcasts carry the full node record, and
//! liveness is a sliding window over last-heard. Nothing here is durable;
//! a restarted node simply rejoins.

mod error;
mod gossip;
mod registry;
mod types;

pub use error::Error;
pub use gossip::{Gossip, GossipConfig};
pub use registry::Registry;
pub use types::{infer_role, ClusterMessage, Node, NodeId, Role, JOIN_TYPE};
