//! Role modules wired into the subject router.

use std::sync::Arc;

use async_trait::async_trait;
use geofleet_messaging::Message;
use tracing::{debug, error};

use crate::collator::UsageCollator;
use crate::engine::ConsensusEngine;
use crate::messages::Proposal;
use crate::proposal_cache::ProposalCache;
use crate::responders::{DowntimeResponder, UsageResponder};
use crate::router::Module;
use crate::subjects;

/// Monitor traffic: the full consensus subject set plus downtime requests.
pub struct MonitorModule {
    engine: Arc<ConsensusEngine>,
    downtime: Arc<DowntimeResponder>,
}

impl MonitorModule {
    /// Creates the module.
    #[must_use]
    pub fn new(engine: Arc<ConsensusEngine>, downtime: Arc<DowntimeResponder>) -> Self {
        Self { engine, downtime }
    }
}

#[async_trait]
impl Module for MonitorModule {
    fn name(&self) -> &'static str {
        "monitor-core"
    }

    async fn handle(&self, message: &Message) -> bool {
        match message.subject.as_str() {
            subjects::PROPOSE => self.engine.handle_proposal(&message.payload).await,
            subjects::VOTE => self.engine.handle_vote(&message.payload).await,
            subjects::FINALIZE => self.engine.handle_finalize(&message.payload).await,
            subjects::DOWNTIME_REQUEST => self.downtime.handle(message).await,
            subjects::DOWNTIME_DATA => {
                debug!("downtime broadcast observed");
            }
            _ => return false,
        }
        true
    }
}

/// DNS traffic: usage requests and broadcasts.
pub struct DnsModule {
    usage: Arc<UsageResponder>,
}

impl DnsModule {
    /// Creates the module.
    #[must_use]
    pub fn new(usage: Arc<UsageResponder>) -> Self {
        Self { usage }
    }
}

#[async_trait]
impl Module for DnsModule {
    fn name(&self) -> &'static str {
        "dns-core"
    }

    async fn handle(&self, message: &Message) -> bool {
        match message.subject.as_str() {
            subjects::USAGE_REQUEST => self.usage.handle(message).await,
            subjects::USAGE_DATA => {
                debug!("usage broadcast observed");
            }
            _ => return false,
        }
        true
    }
}

/// Collator traffic: fleet data subjects (including ephemeral reply
/// inboxes, matched by substring), the propose subject for the audit cache,
/// and finalize fan-outs.
pub struct CollatorModule {
    engine: Arc<ConsensusEngine>,
    collator: Arc<UsageCollator>,
    cache: Arc<ProposalCache>,
}

impl CollatorModule {
    /// Creates the module.
    #[must_use]
    pub fn new(engine: Arc<ConsensusEngine>, collator: Arc<UsageCollator>) -> Self {
        let cache = collator.cache();
        Self {
            engine,
            collator,
            cache,
        }
    }
}

#[async_trait]
impl Module for CollatorModule {
    fn name(&self) -> &'static str {
        "collator-core"
    }

    async fn handle(&self, message: &Message) -> bool {
        let subject = message.subject.as_str();

        if subject == subjects::USAGE_DATA || subject.contains(subjects::USAGE_REPLY_TAG) {
            self.collator.ingest_usage_payload(&message.payload).await;
            return true;
        }
        if subject == subjects::DOWNTIME_DATA || subject.contains(subjects::DOWNTIME_REPLY_TAG) {
            debug!("downtime data observed");
            return true;
        }

        match subject {
            subjects::PROPOSE => {
                match serde_json::from_slice::<Proposal>(&message.payload) {
                    Ok(proposal) => {
                        debug!(id = %proposal.id, member = %proposal.member_name,
                            "caching proposal for audit");
                        self.cache.cache(proposal);
                    }
                    Err(err) => error!(%err, "malformed proposal on audit path"),
                }
                true
            }
            subjects::FINALIZE => {
                self.engine.handle_finalize(&message.payload).await;
                true
            }
            _ => false,
        }
    }
}
