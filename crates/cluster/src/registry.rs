use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::types::{infer_role, Node, NodeId, Role};

/// Soft-membership registry: `NodeId -> Node` with last-heard liveness.
///
/// Critical sections are pure in-memory mutations; callers may use the
/// registry from any task without blocking concerns.
pub struct Registry {
    self_id: NodeId,
    active_window: Duration,
    stale_window: Duration,
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl Registry {
    /// Creates a registry seeded with the local node.
    #[must_use]
    pub fn new(mut self_node: Node, active_window: Duration, stale_window: Duration) -> Self {
        self_node.last_heard = Some(Utc::now());
        let self_id = self_node.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(self_id.clone(), self_node);
        Self {
            self_id,
            active_window,
            stale_window,
            nodes: RwLock::new(nodes),
        }
    }

    /// The local node's identity.
    #[must_use]
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// The local node's current record.
    #[must_use]
    pub fn self_node(&self) -> Node {
        self.nodes.read().expect("registry lock poisoned")[&self.self_id].clone()
    }

    /// Refreshes the sender's last-heard timestamp, inserting it with an
    /// inferred role when unseen. No-op for an empty id. Last-heard never
    /// regresses.
    pub fn mark_heard(&self, id: &NodeId) {
        if id.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        let entry = nodes.entry(id.clone()).or_insert_with(|| {
            debug!(node = %id, "first contact with peer");
            Node::new(id.clone(), Role::Unknown)
        });
        if !entry.role.is_known() {
            entry.role = infer_role(id.as_str());
        }
        if entry.last_heard.is_none_or(|prev| prev < now) {
            entry.last_heard = Some(now);
        }
    }

    /// Inserts a gossiped node record, or upgrades an existing entry whose
    /// role was unknown. A known role is never regressed.
    pub fn add_or_merge(&self, node: Node) {
        if node.id.is_empty() {
            return;
        }
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        match nodes.get_mut(&node.id) {
            None => {
                nodes.insert(node.id.clone(), node);
            }
            Some(existing) => {
                if !existing.role.is_known() && node.role.is_known() {
                    existing.role = node.role;
                }
                if existing.public_address.is_none() {
                    existing.public_address = node.public_address;
                }
                if existing.listen_address.is_none() {
                    existing.listen_address = node.listen_address;
                }
            }
        }
    }

    /// Refreshes the local node's last-heard (heartbeat).
    pub fn touch_self(&self) {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        if let Some(me) = nodes.get_mut(&self.self_id) {
            me.last_heard = Some(Utc::now());
        }
    }

    /// Active iff heard within the active window and the id is non-empty.
    #[must_use]
    pub fn is_active(&self, node: &Node) -> bool {
        if node.id.is_empty() {
            return false;
        }
        node.last_heard.is_some_and(|heard| {
            Utc::now().signed_duration_since(heard).to_std().is_ok_and(|age| age < self.active_window)
        })
    }

    /// Number of active nodes advertising `role`.
    #[must_use]
    pub fn count_active(&self, role: Role) -> usize {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        nodes
            .values()
            .filter(|node| node.role == role && self.is_active(node))
            .count()
    }

    /// True when `id` is currently an active node of `role`. Used to filter
    /// consensus votes down to live monitors.
    #[must_use]
    pub fn is_active_in_role(&self, id: &NodeId, role: Role) -> bool {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        nodes
            .get(id)
            .is_some_and(|node| node.role == role && self.is_active(node))
    }

    /// Drops every peer (never self) unheard for longer than the stale
    /// window.
    pub fn evict_stale(&self) {
        let now = Utc::now();
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        nodes.retain(|id, node| {
            if *id == self.self_id {
                return true;
            }
            let stale = node.last_heard.is_some_and(|heard| {
                now.signed_duration_since(heard)
                    .to_std()
                    .is_ok_and(|age| age > self.stale_window)
            });
            if stale {
                debug!(node = %id, "evicting stale peer");
            }
            !stale
        });
    }

    /// A point-in-time copy of every tracked node.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_last_heard(&self, id: &NodeId, heard: chrono::DateTime<Utc>) {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        if let Some(node) = nodes.get_mut(id) {
            node.last_heard = Some(heard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn registry() -> Registry {
        Registry::new(
            Node::new("monitor-self", Role::Monitor),
            Duration::from_secs(600),
            Duration::from_secs(900),
        )
    }

    #[test]
    fn mark_heard_infers_roles_and_ignores_empty_ids() {
        let reg = registry();
        reg.mark_heard(&NodeId::from("dns-fra-1"));
        reg.mark_heard(&NodeId::from("monitor-ams-1"));
        reg.mark_heard(&NodeId::from(""));

        assert_eq!(reg.count_active(Role::Dns), 1);
        assert_eq!(reg.count_active(Role::Monitor), 2);
        assert_eq!(reg.nodes().len(), 3);
    }

    #[test]
    fn add_or_merge_never_regresses_a_known_role() {
        let reg = registry();
        reg.mark_heard(&NodeId::from("collator-1"));
        assert_eq!(reg.count_active(Role::Unknown), 1);

        reg.add_or_merge(Node::new("collator-1", Role::Collator));
        assert_eq!(reg.count_active(Role::Collator), 1);

        reg.add_or_merge(Node::new("collator-1", Role::Unknown));
        assert_eq!(reg.count_active(Role::Collator), 1);
    }

    #[test]
    fn activity_respects_the_window() {
        let reg = registry();
        let peer = NodeId::from("monitor-old");
        reg.mark_heard(&peer);
        assert_eq!(reg.count_active(Role::Monitor), 2);

        reg.set_last_heard(&peer, Utc::now() - ChronoDuration::minutes(11));
        assert_eq!(reg.count_active(Role::Monitor), 1);
        assert!(!reg.is_active_in_role(&peer, Role::Monitor));
    }

    #[test]
    fn evict_stale_spares_self() {
        let reg = registry();
        let peer = NodeId::from("monitor-dead");
        reg.mark_heard(&peer);

        let long_ago = Utc::now() - ChronoDuration::minutes(20);
        reg.set_last_heard(&peer, long_ago);
        reg.set_last_heard(&NodeId::from("monitor-self"), long_ago);
        reg.evict_stale();

        let ids: Vec<String> = reg.nodes().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["monitor-self".to_owned()]);
    }

    #[test]
    fn last_heard_is_monotonic() {
        let reg = registry();
        let peer = NodeId::from("dns-1");
        reg.mark_heard(&peer);
        let first = reg
            .nodes()
            .into_iter()
            .find(|n| n.id == peer)
            .and_then(|n| n.last_heard)
            .unwrap();

        // A merge carrying an old timestamp must not rewind the clock.
        reg.mark_heard(&peer);
        let second = reg
            .nodes()
            .into_iter()
            .find(|n| n.id == peer)
            .and_then(|n| n.last_heard)
            .unwrap();
        assert!(second >= first);
    }
}
