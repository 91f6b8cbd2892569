//! Coordination core of the geofleet cluster: vote-based consensus on
//! status transitions, subject routing, scatter/gather fleet aggregation and
//! the hourly usage collator.

mod collator;
mod engine;
mod error;
mod hooks;
mod messages;
mod modules;
mod proposal_cache;
mod responders;
mod router;
mod scatter;

/// Well-known wire subjects.
pub mod subjects;

pub use collator::UsageCollator;
pub use engine::{CheckStatus, ConsensusEngine, EngineConfig, FinalizeHook};
pub use error::{Error, Result};
pub use hooks::{CollatorFinalizeHook, IgnoreFinalize, MonitorFinalizeHook};
pub use messages::{
    DowntimeEvent, DowntimeRequest, DowntimeResponse, FinalizeMessage, Proposal, ProposalId,
    UsageRequest, UsageResponse, Vote, WireUsageRecord,
};
pub use modules::{CollatorModule, DnsModule, MonitorModule};
pub use proposal_cache::ProposalCache;
pub use responders::{DowntimeResponder, UsageResponder};
pub use router::{Module, Router};
pub use scatter::{gather_downtime, gather_usage, merge_usage, GatherOutcome};
