use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use geofleet_messaging::Transport;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::Registry;
use crate::types::{ClusterMessage, JOIN_TYPE};
use crate::Error;

/// Minimum spacing between two JOIN broadcasts from this node.
const JOIN_DEBOUNCE: Duration = Duration::from_secs(5);

/// Settle delay before the first heartbeat tick.
const HEARTBEAT_SETTLE: Duration = Duration::from_secs(2);

/// Gossip tuning.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Subject JOINs are broadcast on.
    pub cluster_subject: String,
    /// Interval between heartbeat JOINs.
    pub heartbeat_interval: Duration,
    /// How many JOINs to attempt at start-up.
    pub join_retries: u32,
    /// Spacing between start-up JOIN attempts.
    pub join_delay: Duration,
}

/// Join gossip: start-up JOIN burst, periodic heartbeat, and handling of
/// inbound cluster messages.
pub struct Gossip {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    config: GossipConfig,
    last_join: Mutex<Option<Instant>>,
}

impl Gossip {
    /// Creates the gossip component. Call [`Gossip::start`] to launch the
    /// background tasks.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        config: GossipConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            last_join: Mutex::new(None),
        }
    }

    /// Handles one message from the cluster subject: refresh the sender and,
    /// for JOINs, merge its record. Malformed payloads are logged and
    /// dropped.
    pub fn handle_message(&self, payload: &[u8]) {
        let message: ClusterMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                error!(%err, "dropping malformed cluster message");
                return;
            }
        };
        if message.sender.id.is_empty() {
            return;
        }

        self.registry.mark_heard(&message.sender.id);
        if message.kind == JOIN_TYPE {
            self.registry.add_or_merge(message.sender);
            if let Some(members) = message.members {
                for member in members {
                    self.registry.add_or_merge(member);
                }
            }
        }
    }

    /// Broadcasts a JOIN, debounced so no two JOINs from this node fire
    /// within [`JOIN_DEBOUNCE`]. Publish failures are logged and swallowed;
    /// heartbeats are best-effort.
    pub async fn broadcast_join(&self) -> Result<(), Error> {
        {
            let mut last = self.last_join.lock().expect("join debounce poisoned");
            if last.is_some_and(|t| t.elapsed() < JOIN_DEBOUNCE) {
                debug!("join suppressed by debounce");
                return Ok(());
            }
            *last = Some(Instant::now());
        }

        let sender = self.registry.self_node();
        if sender.id.is_empty() {
            error!("join suppressed: node id is empty");
            return Ok(());
        }

        let message = ClusterMessage {
            kind: JOIN_TYPE.to_owned(),
            sender,
            members: None,
        };
        let payload = serde_json::to_vec(&message)?;
        if let Err(err) = self
            .transport
            .publish(&self.config.cluster_subject, Bytes::from(payload))
            .await
        {
            error!(%err, "failed to publish join");
        }
        Ok(())
    }

    /// Launches the start-up JOIN burst and the heartbeat loop. The task
    /// exits when `shutdown` fires.
    #[must_use]
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            for attempt in 0..self.config.join_retries {
                if attempt > 0 {
                    tokio::time::sleep(self.config.join_delay).await;
                }
                let _ = self.broadcast_join().await;
            }

            tokio::time::sleep(HEARTBEAT_SETTLE).await;
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            info!("cluster heartbeat running");
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        self.registry.touch_self();
                        let _ = self.broadcast_join().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, NodeId, Role};
    use geofleet_messaging_memory::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gossip(bus: MemoryTransport) -> (Arc<Registry>, Gossip) {
        let registry = Arc::new(Registry::new(
            Node::new("monitor-self", Role::Monitor),
            Duration::from_secs(600),
            Duration::from_secs(900),
        ));
        let gossip = Gossip::new(
            Arc::clone(&registry),
            Arc::new(bus),
            GossipConfig {
                cluster_subject: "consensus.cluster".to_owned(),
                heartbeat_interval: Duration::from_secs(90),
                join_retries: 3,
                join_delay: Duration::from_millis(500),
            },
        );
        (registry, gossip)
    }

    #[tokio::test]
    async fn join_message_registers_the_sender() {
        let (registry, gossip) = gossip(MemoryTransport::new());
        let message = ClusterMessage {
            kind: JOIN_TYPE.to_owned(),
            sender: Node::new("dns-lon-1", Role::Dns),
            members: None,
        };
        gossip.handle_message(&serde_json::to_vec(&message).unwrap());
        assert_eq!(registry.count_active(Role::Dns), 1);
    }

    #[tokio::test]
    async fn non_join_messages_only_mark_heard() {
        let (registry, gossip) = gossip(MemoryTransport::new());
        let message = ClusterMessage {
            kind: "ping".to_owned(),
            sender: Node::new("collator-1", Role::Collator),
            members: None,
        };
        gossip.handle_message(&serde_json::to_vec(&message).unwrap());
        // Heard, but the advertised role was not merged.
        assert_eq!(registry.count_active(Role::Collator), 0);
        assert!(registry
            .nodes()
            .iter()
            .any(|n| n.id == NodeId::from("collator-1")));
    }

    #[tokio::test]
    async fn join_broadcasts_are_debounced() {
        let bus = MemoryTransport::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_sub = Arc::clone(&seen);
        let _sub = bus
            .subscribe(
                "consensus.cluster",
                geofleet_messaging::handler_fn(move |_| {
                    let seen = Arc::clone(&seen_sub);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        let (_registry, gossip) = gossip(bus);
        gossip.broadcast_join().await.unwrap();
        gossip.broadcast_join().await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let (registry, gossip) = gossip(MemoryTransport::new());
        gossip.handle_message(b"not json");
        assert_eq!(registry.nodes().len(), 1);
    }
}
