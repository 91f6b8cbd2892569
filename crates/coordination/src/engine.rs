use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use geofleet_cluster::{NodeId, Registry, Role};
use geofleet_config::CheckKind;
use geofleet_store::{LocalStatus, ProbeData, StatusKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::messages::{FinalizeMessage, Proposal, ProposalId, Vote};
use crate::subjects;

/// Invoked once a finalize message is published or received. Role-specific:
/// monitors apply the official result, collators persist the outage and
/// notify, everyone else ignores. Must be idempotent.
#[async_trait]
pub trait FinalizeHook: Send + Sync {
    /// Applies one finalized decision.
    async fn on_finalize(&self, message: &FinalizeMessage);
}

/// A status transition observed locally, to be proposed to the cluster.
#[derive(Clone, Debug)]
pub struct CheckStatus {
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
    /// Observed status; true means online.
    pub status: bool,
    /// Error text from the failing check.
    pub error: String,
    /// Check-specific diagnostics.
    pub data: Option<ProbeData>,
    /// Address family.
    pub is_ipv6: bool,
}

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a proposal may stay open before a forced evaluation.
    pub proposal_timeout: Duration,
    /// Minimum agreeing (or disagreeing) votes needed to finalize.
    pub min_votes: usize,
    /// Settle delay before voting, so near-simultaneous local updates land.
    pub vote_grace: Duration,
    /// Interval of the tracking/membership garbage collector.
    pub gc_interval: Duration,
    /// Tracking entries older than this are dropped by the collector.
    pub tracking_expiry: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::from_secs(30),
            min_votes: 2,
            vote_grace: Duration::from_millis(5),
            gc_interval: Duration::from_secs(5),
            tracking_expiry: Duration::from_secs(600),
        }
    }
}

struct Tracking {
    proposal: Proposal,
    votes: HashMap<String, bool>,
    finalized: bool,
    timer: Option<JoinHandle<()>>,
}

/// The consensus engine: proposal creation, voting, decision, timeout and
/// finalization fan-out.
///
/// Lost messages are tolerated: every active monitor votes independently on
/// every proposal it sees, and the timeout guarantees a decision attempt.
pub struct ConsensusEngine {
    node_id: NodeId,
    registry: Arc<Registry>,
    transport: Arc<dyn geofleet_messaging::Transport>,
    local: Arc<dyn LocalStatus>,
    hook: Arc<dyn FinalizeHook>,
    config: EngineConfig,
    tracking: Mutex<HashMap<ProposalId, Tracking>>,
}

impl ConsensusEngine {
    /// Creates an engine. Wire its `handle_*` methods into the subject
    /// router and call [`ConsensusEngine::start_gc`].
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn geofleet_messaging::Transport>,
        local: Arc<dyn LocalStatus>,
        hook: Arc<dyn FinalizeHook>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: registry.self_id().clone(),
            registry,
            transport,
            local,
            hook,
            config,
            tracking: Mutex::new(HashMap::new()),
        })
    }

    /// Number of open proposals, for introspection.
    #[must_use]
    pub fn open_proposals(&self) -> usize {
        self.tracking.lock().expect("tracking lock poisoned").len()
    }

    /// Proposes a status change to the cluster. Idempotent per open
    /// semantically-equal proposal: a matching unfinalized entry makes this
    /// a no-op.
    pub async fn propose(self: &Arc<Self>, change: CheckStatus) {
        let proposal = Proposal {
            id: Uuid::new_v4().to_string(),
            sender_node_id: self.node_id.to_string(),
            check_type: change.kind,
            check_name: change.check_name,
            member_name: change.member,
            domain_name: change.domain,
            endpoint: change.endpoint,
            proposed_status: change.status,
            error_text: change.error,
            data: change.data,
            is_ipv6: change.is_ipv6,
            timestamp: Utc::now(),
        };

        {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            let duplicate = tracking
                .values()
                .any(|t| !t.finalized && t.proposal.same_transition(&proposal));
            if duplicate {
                return;
            }
            debug!(id = %proposal.id, member = %proposal.member_name,
                status = proposal.proposed_status, ipv6 = proposal.is_ipv6,
                "proposal created");
            let timer = self.arm_timer(proposal.id.clone());
            tracking.insert(
                proposal.id.clone(),
                Tracking {
                    proposal: proposal.clone(),
                    votes: HashMap::new(),
                    finalized: false,
                    timer: Some(timer),
                },
            );
        }

        if let Ok(payload) = serde_json::to_vec(&proposal) {
            if let Err(err) = self
                .transport
                .publish(subjects::PROPOSE, Bytes::from(payload))
                .await
            {
                error!(id = %proposal.id, %err, "failed to publish proposal");
            }
        }

        self.vote_on(&proposal).await;
    }

    /// Handles a proposal from a peer: unknown ids get a tracking entry, a
    /// timeout and a local vote; known ids are ignored.
    pub async fn handle_proposal(self: &Arc<Self>, payload: &[u8]) {
        let proposal: Proposal = match serde_json::from_slice(payload) {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(%err, "dropping malformed proposal");
                return;
            }
        };
        debug!(id = %proposal.id, member = %proposal.member_name,
            status = proposal.proposed_status, "proposal received");
        self.registry
            .mark_heard(&NodeId::new(proposal.sender_node_id.clone()));

        {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            if tracking.contains_key(&proposal.id) {
                return;
            }
            let timer = self.arm_timer(proposal.id.clone());
            tracking.insert(
                proposal.id.clone(),
                Tracking {
                    proposal: proposal.clone(),
                    votes: HashMap::new(),
                    finalized: false,
                    timer: Some(timer),
                },
            );
        }

        self.vote_on(&proposal).await;
    }

    /// Handles a peer's vote: recorded by node id (one vote per node) and
    /// re-evaluated. Votes for unknown or finalized proposals are dropped.
    pub async fn handle_vote(self: &Arc<Self>, payload: &[u8]) {
        let vote: Vote = match serde_json::from_slice(payload) {
            Ok(vote) => vote,
            Err(err) => {
                error!(%err, "dropping malformed vote");
                return;
            }
        };
        debug!(id = %vote.proposal_id, from = %vote.sender_node_id, agree = vote.agree,
            "vote received");
        self.registry
            .mark_heard(&NodeId::new(vote.sender_node_id.clone()));

        let decided = {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            let Some(entry) = tracking.get_mut(&vote.proposal_id) else {
                return;
            };
            if entry.finalized {
                return;
            }
            entry.votes.insert(vote.sender_node_id, vote.agree);
            self.try_decide(entry)
        };

        if let Some((proposal, passed)) = decided {
            self.finalize(proposal, passed).await;
        }
    }

    /// Handles a finalize fan-out: the local round is over, apply the
    /// decision. Safe to receive more than once.
    pub async fn handle_finalize(self: &Arc<Self>, payload: &[u8]) {
        let message: FinalizeMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "dropping malformed finalize");
                return;
            }
        };
        debug!(id = %message.proposal.id, passed = message.passed, "finalize received");
        self.registry
            .mark_heard(&NodeId::new(message.proposal.sender_node_id.clone()));

        // Stop our own round for this proposal, if one is open.
        if let Some(mut entry) = self
            .tracking
            .lock()
            .expect("tracking lock poisoned")
            .remove(&message.proposal.id)
        {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }

        self.hook.on_finalize(&message).await;
    }

    /// Starts the garbage collector: expired tracking entries are dropped
    /// (timers stopped first) and stale registry entries evicted.
    #[must_use]
    pub fn start_gc(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        engine.collect_garbage();
                        engine.registry.evict_stale();
                    }
                }
            }
        })
    }

    fn collect_garbage(&self) {
        let now = Utc::now();
        let expiry = self.config.tracking_expiry;
        let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
        tracking.retain(|id, entry| {
            let age = now
                .signed_duration_since(entry.proposal.timestamp)
                .to_std()
                .unwrap_or_default();
            if age > expiry {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                info!(id = %id, "dropping expired proposal");
                false
            } else {
                true
            }
        });
    }

    fn arm_timer(self: &Arc<Self>, id: ProposalId) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let timeout = self.config.proposal_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.on_timeout(id).await;
        })
    }

    async fn on_timeout(self: &Arc<Self>, id: ProposalId) {
        let decided = {
            let mut tracking = self.tracking.lock().expect("tracking lock poisoned");
            let Some(entry) = tracking.get_mut(&id) else {
                return;
            };
            if entry.finalized {
                return;
            }
            match self.try_decide(entry) {
                Some(outcome) => Some(outcome),
                None => {
                    // Still undecided (possibly zero active monitors):
                    // schedule another attempt; the collector is the
                    // terminal cleanup.
                    debug!(id = %id, "proposal timeout without decision, rescheduling");
                    entry.timer = Some(self.arm_timer(id.clone()));
                    None
                }
            }
        };

        if let Some((proposal, passed)) = decided {
            self.finalize(proposal, passed).await;
        }
    }

    /// Decision rule. Caller holds the tracking lock; marks the entry
    /// finalized and stops its timer when a decision is reached.
    fn try_decide(&self, entry: &mut Tracking) -> Option<(Proposal, bool)> {
        let total = self.registry.count_active(Role::Monitor);
        if total == 0 {
            // A lone node that has heard nobody must not decide.
            return None;
        }
        let majority = total / 2 + 1;

        let (mut yes, mut no) = (0usize, 0usize);
        for (node, agree) in &entry.votes {
            if self
                .registry
                .is_active_in_role(&NodeId::new(node.clone()), Role::Monitor)
            {
                if *agree {
                    yes += 1;
                } else {
                    no += 1;
                }
            }
        }

        let passed = if yes >= majority && yes >= self.config.min_votes {
            true
        } else if no >= majority && no >= self.config.min_votes {
            false
        } else {
            return None;
        };

        info!(id = %entry.proposal.id, passed, yes, no, active_monitors = total,
            "consensus reached");
        entry.finalized = true;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some((entry.proposal.clone(), passed))
    }

    async fn finalize(self: &Arc<Self>, proposal: Proposal, passed: bool) {
        let id = proposal.id.clone();
        let message = FinalizeMessage {
            proposal,
            passed,
            decided_at: Utc::now(),
        };

        if let Ok(payload) = serde_json::to_vec(&message) {
            if let Err(err) = self
                .transport
                .publish(subjects::FINALIZE, Bytes::from(payload))
                .await
            {
                error!(%id, %err, "failed to publish finalize");
            }
        }

        self.hook.on_finalize(&message).await;

        self.tracking
            .lock()
            .expect("tracking lock poisoned")
            .remove(&id);
    }

    /// Casts this node's vote on `proposal` after the grace delay. Abstains
    /// when the local surface has no observation for the key.
    async fn vote_on(self: &Arc<Self>, proposal: &Proposal) {
        tokio::time::sleep(self.config.vote_grace).await;

        let key = StatusKey {
            kind: proposal.check_type,
            check_name: &proposal.check_name,
            member: &proposal.member_name,
            domain: &proposal.domain_name,
            endpoint: &proposal.endpoint,
            is_ipv6: proposal.is_ipv6,
        };
        let Some(local_status) = self.local.local_status(&key) else {
            debug!(id = %proposal.id, "abstaining: no local observation");
            return;
        };

        let vote = Vote {
            proposal_id: proposal.id.clone(),
            sender_node_id: self.node_id.to_string(),
            agree: local_status == proposal.proposed_status,
            timestamp: Utc::now(),
        };
        debug!(id = %proposal.id, agree = vote.agree, local = local_status,
            proposed = proposal.proposed_status, "voting");

        match serde_json::to_vec(&vote) {
            Ok(payload) => {
                if let Err(err) = self
                    .transport
                    .publish(subjects::VOTE, Bytes::from(payload))
                    .await
                {
                    error!(id = %proposal.id, %err, "failed to publish vote");
                }
            }
            Err(err) => error!(%err, "failed to encode vote"),
        }
    }
}
