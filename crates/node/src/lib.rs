//! Role wiring for geofleet nodes.
//!
//! A [`FleetNode`] owns every background task a role needs (gossip,
//! garbage collection, config reload, collator services) plus the wildcard
//! subscription feeding the subject router. `shutdown` cancels and awaits
//! all of it; nothing is left orphaned.

mod wiring;

pub use wiring::{CollatorDeps, DnsDeps, FleetNode, MonitorDeps, NotifyTaskFn};

use geofleet_config::ConfigHandle;
use geofleet_notifier::MentionSource;

/// Mention lookup backed by the config snapshot's alert map.
pub struct ConfigMentions {
    config: ConfigHandle,
}

impl ConfigMentions {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }
}

impl MentionSource for ConfigMentions {
    fn mentions_for(&self, member: &str) -> Vec<String> {
        self.config.get().member_mentions(member).to_vec()
    }
}
