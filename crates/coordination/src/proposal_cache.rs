use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::messages::{Proposal, ProposalId};

/// Operator-visible audit cache of proposals seen on the propose subject.
/// Entries expire after ten minutes; the janitor drives the sweep.
#[derive(Default)]
pub struct ProposalCache {
    entries: Mutex<HashMap<ProposalId, (Proposal, DateTime<Utc>)>>,
}

impl ProposalCache {
    /// Entries older than this are swept.
    pub const EXPIRY: Duration = Duration::from_secs(600);

    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches one proposal, keyed by id.
    pub fn cache(&self, proposal: Proposal) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(proposal.id.clone(), (proposal, Utc::now()));
    }

    /// Removes and returns one proposal.
    #[must_use]
    pub fn pop(&self, id: &str) -> Option<Proposal> {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(id)
            .map(|(proposal, _)| proposal)
    }

    /// Drops entries cached longer ago than [`ProposalCache::EXPIRY`].
    pub fn expire_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(Self::EXPIRY).unwrap_or_else(|_| chrono::Duration::zero());
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .retain(|_, (_, cached_at)| *cached_at >= cutoff);
    }

    /// Number of cached proposals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, cached_at: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().expect("cache lock poisoned").get_mut(id) {
            entry.1 = cached_at;
        }
    }
}
