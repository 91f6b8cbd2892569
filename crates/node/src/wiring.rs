use std::sync::Arc;
use std::time::Duration;

use geofleet_cluster::{Gossip, GossipConfig, Node, Registry, Role};
use geofleet_config::ConfigHandle;
use geofleet_coordination::{
    subjects, CollatorFinalizeHook, CollatorModule, ConsensusEngine, DnsModule, DowntimeResponder,
    EngineConfig, FinalizeHook, MonitorFinalizeHook, MonitorModule, Router, UsageCollator,
    UsageResponder,
};
use geofleet_messaging::{Message, Subscription, Transport};
use geofleet_notifier::{Notifier, NotifyTransport};
use geofleet_coordination::CheckStatus;
use geofleet_store::{
    EventRecorder, EventStore, LocalStatus, OfficialStore, ResultSurface, StatusKey, UsageSource,
    UsageStore,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts to establish the wildcard subscription before giving up.
const SUBSCRIBE_ATTEMPTS: u32 = 5;

/// Back-off between subscription attempts.
const SUBSCRIBE_BACKOFF: Duration = Duration::from_secs(2);

/// Dependencies for a monitor node.
pub struct MonitorDeps {
    /// Config handle.
    pub config: ConfigHandle,
    /// Messaging transport.
    pub transport: Arc<dyn Transport>,
    /// This node's local observations; fed by the probe pipeline through
    /// [`FleetNode::report_observation`] and consulted before voting.
    pub local: Arc<ResultSurface>,
    /// Durable event store for the official recorder and downtime queries.
    pub events: Arc<dyn EventStore>,
}

/// Dependencies for a DNS node.
pub struct DnsDeps {
    /// Config handle.
    pub config: ConfigHandle,
    /// Messaging transport.
    pub transport: Arc<dyn Transport>,
    /// Local usage counters served to the fleet.
    pub usage: Arc<dyn UsageSource>,
}

/// Starts a chat transport's background login/health task under the node's
/// shutdown token. The handle joins the node's owned tasks so `shutdown`
/// awaits it like everything else.
pub type NotifyTaskFn = Box<dyn FnOnce(CancellationToken) -> JoinHandle<()> + Send>;

/// Dependencies for a collator node.
pub struct CollatorDeps {
    /// Config handle.
    pub config: ConfigHandle,
    /// Messaging transport.
    pub transport: Arc<dyn Transport>,
    /// Durable usage store.
    pub usage_store: Arc<dyn UsageStore>,
    /// Durable event store.
    pub events: Arc<dyn EventStore>,
    /// Chat transport for outage notifications.
    pub notify: Arc<dyn NotifyTransport>,
    /// Launcher for the chat transport's background task.
    pub notify_task: NotifyTaskFn,
}

/// A running geofleet node of one role.
pub struct FleetNode {
    role: Role,
    config: ConfigHandle,
    registry: Arc<Registry>,
    engine: Arc<ConsensusEngine>,
    official: Option<Arc<OfficialStore>>,
    local: Option<Arc<ResultSurface>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<Box<dyn Subscription>>,
}

impl FleetNode {
    /// Starts a monitor node: full consensus participation, official-store
    /// application and downtime responses.
    ///
    /// # Errors
    ///
    /// Fails when the wildcard subscription cannot be established.
    pub async fn start_monitor(deps: MonitorDeps) -> Result<Self, geofleet_messaging::Error> {
        let official = Arc::new(OfficialStore::new(EventRecorder::new(Arc::clone(
            &deps.events,
        ))));
        let hook: Arc<dyn FinalizeHook> = Arc::new(MonitorFinalizeHook::new(
            deps.config.clone(),
            Arc::clone(&official),
        ));

        let mut node = Self::assemble(
            Role::Monitor,
            &deps.config,
            &deps.transport,
            Arc::clone(&deps.local) as Arc<dyn LocalStatus>,
            hook,
        );
        node.official = Some(official);
        node.local = Some(deps.local);

        let downtime = Arc::new(DowntimeResponder::new(
            node.registry.self_id().to_string(),
            Arc::clone(&deps.transport),
            deps.events,
        ));
        let router = Arc::new(Router::new());
        router.register(
            Some(Role::Monitor),
            Arc::new(MonitorModule::new(Arc::clone(&node.engine), downtime)),
        );

        node.go_online(&deps.config, &deps.transport, router, true)
            .await?;
        Ok(node)
    }

    /// Starts a DNS node: usage responses and cluster presence. DNS nodes
    /// neither vote nor tally; they only need the cluster to know they are
    /// alive.
    ///
    /// # Errors
    ///
    /// Fails when the wildcard subscription cannot be established.
    pub async fn start_dns(deps: DnsDeps) -> Result<Self, geofleet_messaging::Error> {
        let hook: Arc<dyn FinalizeHook> =
            Arc::new(geofleet_coordination::IgnoreFinalize);
        let mut node = Self::assemble(
            Role::Dns,
            &deps.config,
            &deps.transport,
            Arc::new(NoLocalStatus),
            hook,
        );

        let usage = Arc::new(UsageResponder::new(
            node.registry.self_id().to_string(),
            Arc::clone(&deps.transport),
            deps.usage,
        ));
        let router = Arc::new(Router::new());
        router.register(Some(Role::Dns), Arc::new(DnsModule::new(usage)));

        node.go_online(&deps.config, &deps.transport, router, false)
            .await?;
        Ok(node)
    }

    /// Starts a collator node: finalize persistence, notifications, the
    /// hourly usage puller and the audit-cache janitor.
    ///
    /// # Errors
    ///
    /// Fails when the wildcard subscription cannot be established.
    pub async fn start_collator(deps: CollatorDeps) -> Result<Self, geofleet_messaging::Error> {
        let notifier = Arc::new(Notifier::new(
            Arc::clone(&deps.notify),
            Arc::new(crate::ConfigMentions::new(deps.config.clone())),
        ));
        let hook: Arc<dyn FinalizeHook> = Arc::new(CollatorFinalizeHook::new(
            Arc::clone(&deps.events),
            notifier,
        ));

        let mut node = Self::assemble(
            Role::Collator,
            &deps.config,
            &deps.transport,
            Arc::new(NoLocalStatus),
            hook,
        );

        let collator = UsageCollator::new(
            Arc::clone(&deps.transport),
            Arc::clone(&node.registry),
            Arc::clone(&deps.usage_store),
        );
        let router = Arc::new(Router::new());
        router.register(
            Some(Role::Collator),
            Arc::new(CollatorModule::new(
                Arc::clone(&node.engine),
                Arc::clone(&collator),
            )),
        );

        node.tasks
            .push(collator.start_hourly(node.shutdown.clone()));
        node.tasks
            .push(collator.start_janitor(node.shutdown.clone()));
        node.tasks.push((deps.notify_task)(node.shutdown.clone()));

        node.go_online(&deps.config, &deps.transport, router, true)
            .await?;
        Ok(node)
    }

    /// The consensus engine, for the probing side to feed proposals into.
    #[must_use]
    pub fn engine(&self) -> Arc<ConsensusEngine> {
        Arc::clone(&self.engine)
    }

    /// The cluster registry.
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// The official result store (monitor nodes only).
    #[must_use]
    pub fn official(&self) -> Option<Arc<OfficialStore>> {
        self.official.clone()
    }

    /// Cancels every owned task and tears down the subscription.
    pub async fn shutdown(mut self) {
        info!(role = ?self.role, "shutting down");
        self.shutdown.cancel();
        if let Some(subscription) = self.subscription.take() {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(%err, "failed to tear down wildcard subscription");
            }
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn assemble(
        role: Role,
        config: &ConfigHandle,
        transport: &Arc<dyn Transport>,
        local: Arc<dyn LocalStatus>,
        hook: Arc<dyn FinalizeHook>,
    ) -> Self {
        let snapshot = config.get();
        let tuning = &snapshot.config().consensus;
        let registry = Arc::new(Registry::new(
            Node::new(snapshot.config().system.node_id.clone(), role),
            tuning.active_window(),
            tuning.stale_window(),
        ));
        let engine = ConsensusEngine::new(
            Arc::clone(&registry),
            Arc::clone(transport),
            local,
            hook,
            EngineConfig {
                proposal_timeout: tuning.proposal_timeout(),
                min_votes: tuning.min_votes,
                ..EngineConfig::default()
            },
        );

        Self {
            role,
            config: config.clone(),
            registry,
            engine,
            official: None,
            local: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            subscription: None,
        }
    }

    /// Feeds one local probe outcome into the node: the local surface is
    /// updated, and when the observation diverges from the official state a
    /// cluster vote is proposed. Non-monitor roles ignore this.
    pub async fn report_observation(&self, change: CheckStatus) {
        let (Some(local), Some(official)) = (&self.local, &self.official) else {
            return;
        };

        let snapshot = self.config.get();
        let Some(check) = snapshot.check(&change.check_name, change.kind) else {
            warn!(check = %change.check_name, "observation for unknown check dropped");
            return;
        };
        let Some(member) = snapshot.member(&change.member) else {
            warn!(member = %change.member, "observation for unknown member dropped");
            return;
        };
        let service = snapshot.service_for_domain(&change.domain);

        match change.kind {
            geofleet_config::CheckKind::Site => {
                local.update_site(
                    check,
                    member,
                    change.status,
                    &change.error,
                    change.data.clone(),
                    change.is_ipv6,
                );
            }
            geofleet_config::CheckKind::Domain => {
                local.update_domain(
                    check,
                    member,
                    service,
                    &change.domain,
                    change.status,
                    &change.error,
                    change.data.clone(),
                    change.is_ipv6,
                );
            }
            geofleet_config::CheckKind::Endpoint => {
                local.update_endpoint(
                    check,
                    member,
                    service,
                    &change.domain,
                    &change.endpoint,
                    change.status,
                    &change.error,
                    change.data.clone(),
                    change.is_ipv6,
                );
            }
        }

        let key = StatusKey {
            kind: change.kind,
            check_name: &change.check_name,
            member: &change.member,
            domain: &change.domain,
            endpoint: &change.endpoint,
            is_ipv6: change.is_ipv6,
        };
        if official.surface().local_status(&key) != Some(change.status) {
            self.engine.propose(change).await;
        }
    }

    /// Shared tail of every role start: wildcard subscription (with
    /// retries), gossip, config reload and — for consensus-tracking roles —
    /// the garbage collector.
    async fn go_online(
        &mut self,
        config: &ConfigHandle,
        transport: &Arc<dyn Transport>,
        router: Arc<Router>,
        with_gc: bool,
    ) -> Result<(), geofleet_messaging::Error> {
        let snapshot = config.get();
        let tuning = &snapshot.config().consensus;

        let gossip = Arc::new(Gossip::new(
            Arc::clone(&self.registry),
            Arc::clone(transport),
            GossipConfig {
                cluster_subject: subjects::CLUSTER.to_owned(),
                heartbeat_interval: tuning.heartbeat_interval(),
                join_retries: tuning.join_retries,
                join_delay: tuning.join_delay(),
            },
        ));

        let role = self.role;
        let dispatch_gossip = Arc::clone(&gossip);
        let handler = geofleet_messaging::handler_fn(move |message: Message| {
            let router = Arc::clone(&router);
            let gossip = Arc::clone(&dispatch_gossip);
            async move {
                if message.subject == subjects::CLUSTER {
                    gossip.handle_message(&message.payload);
                    return;
                }
                router.dispatch(role, &message).await;
            }
        });

        let mut subscription = None;
        for attempt in 1..=SUBSCRIBE_ATTEMPTS {
            match transport.subscribe(">", Arc::clone(&handler)).await {
                Ok(established) => {
                    subscription = Some(established);
                    break;
                }
                Err(err) if attempt < SUBSCRIBE_ATTEMPTS => {
                    warn!(%err, attempt, "wildcard subscribe failed, retrying");
                    tokio::time::sleep(SUBSCRIBE_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
        self.subscription = subscription;

        if with_gc {
            self.tasks.push(self.engine.start_gc(self.shutdown.clone()));
        }
        self.tasks.push(gossip.start(self.shutdown.clone()));
        self.tasks.push(config.spawn_reload(
            Duration::from_secs(snapshot.config().system.reload_interval_secs),
            self.shutdown.clone(),
        ));

        info!(role = ?self.role, node = %self.registry.self_id(), "role enabled");
        Ok(())
    }
}

/// Roles that never vote have no local observations.
struct NoLocalStatus;

impl LocalStatus for NoLocalStatus {
    fn local_status(&self, _key: &geofleet_store::StatusKey<'_>) -> Option<bool> {
        None
    }
}
