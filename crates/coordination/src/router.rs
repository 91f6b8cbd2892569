use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use geofleet_cluster::Role;
use geofleet_messaging::Message;

/// A pluggable message handler bound to a role (or registered globally).
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name, for logs.
    fn name(&self) -> &'static str;

    /// Handles the message; returns true when consumed. Dispatch stops at
    /// the first module that consumes a message.
    async fn handle(&self, message: &Message) -> bool;
}

/// Maps roles to module stacks and dispatches inbound messages.
///
/// Registration happens at wiring time; dispatch is lock-free in practice
/// (read lock only) and never blocks — every inbound message already runs on
/// its own delivery task.
#[derive(Default)]
pub struct Router {
    role_modules: RwLock<HashMap<Role, Vec<Arc<dyn Module>>>>,
    global: RwLock<Vec<Arc<dyn Module>>>,
}

impl Router {
    /// An empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a module to a role. `None` registers it globally: global
    /// modules see every message first, in insertion order.
    pub fn register(&self, role: Option<Role>, module: Arc<dyn Module>) {
        match role {
            None => self
                .global
                .write()
                .expect("router lock poisoned")
                .push(module),
            Some(role) => self
                .role_modules
                .write()
                .expect("router lock poisoned")
                .entry(role)
                .or_default()
                .push(module),
        }
    }

    /// Dispatches one message: global modules first, then the local role's,
    /// stopping at the first that consumes it. Returns whether anyone did.
    pub async fn dispatch(&self, role: Role, message: &Message) -> bool {
        let global: Vec<Arc<dyn Module>> = self
            .global
            .read()
            .expect("router lock poisoned")
            .clone();
        for module in global {
            if module.handle(message).await {
                return true;
            }
        }

        let modules: Vec<Arc<dyn Module>> = self
            .role_modules
            .read()
            .expect("router lock poisoned")
            .get(&role)
            .cloned()
            .unwrap_or_default();
        for module in modules {
            if module.handle(message).await {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        consume: bool,
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _message: &Message) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.consume
        }
    }

    fn message() -> Message {
        Message {
            subject: "consensus.vote".into(),
            reply: None,
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn global_modules_run_before_role_modules() {
        let router = Router::new();
        let global_hits = Arc::new(AtomicUsize::new(0));
        let role_hits = Arc::new(AtomicUsize::new(0));

        router.register(
            None,
            Arc::new(Recorder {
                name: "global",
                consume: true,
                hits: Arc::clone(&global_hits),
            }),
        );
        router.register(
            Some(Role::Monitor),
            Arc::new(Recorder {
                name: "monitor",
                consume: true,
                hits: Arc::clone(&role_hits),
            }),
        );

        assert!(router.dispatch(Role::Monitor, &message()).await);
        assert_eq!(global_hits.load(Ordering::SeqCst), 1);
        assert_eq!(role_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_stops_at_the_first_consumer() {
        let router = Router::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        router.register(
            Some(Role::Dns),
            Arc::new(Recorder {
                name: "first",
                consume: true,
                hits: Arc::clone(&first),
            }),
        );
        router.register(
            Some(Role::Dns),
            Arc::new(Recorder {
                name: "second",
                consume: true,
                hits: Arc::clone(&second),
            }),
        );

        assert!(router.dispatch(Role::Dns, &message()).await);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_messages_fall_through() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register(
            Some(Role::Dns),
            Arc::new(Recorder {
                name: "dns",
                consume: false,
                hits: Arc::clone(&hits),
            }),
        );

        // Wrong role: module not consulted at all.
        assert!(!router.dispatch(Role::Monitor, &message()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Right role but the module declines.
        assert!(!router.dispatch(Role::Dns, &message()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
