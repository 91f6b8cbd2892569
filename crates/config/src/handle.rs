use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::snapshot::Snapshot;
use crate::types::Config;
use crate::{Error, Result};

/// Shared access to the current config [`Snapshot`].
///
/// `get` is a cheap `Arc` clone; reloads build a fresh snapshot and swap it
/// under the write lock. Manual member overrides set at runtime survive
/// reloads: the reload merges the previous snapshot's override flags into the
/// newly parsed members.
#[derive(Clone)]
pub struct ConfigHandle {
    path: PathBuf,
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl ConfigHandle {
    /// Loads the config file and builds the first snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed; start-up
    /// treats this as fatal.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let config = read_config(&path).await?;
        validate(&config)?;
        let handle = Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(Snapshot::new(config)))),
        };
        Ok(handle)
    }

    /// The current snapshot.
    #[must_use]
    pub fn get(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    /// Sets or clears the manual disable flag on a member. The flag is kept
    /// across reloads until an operator clears it.
    pub fn set_member_override(&self, member: &str, disabled: bool) -> bool {
        let mut guard = self.current.write().expect("config lock poisoned");
        let mut config = guard.config().clone();
        let Some(entry) = config.members.get_mut(member) else {
            return false;
        };
        entry.override_disabled = disabled;
        entry.override_time = Some(Utc::now());
        *guard = Arc::new(Snapshot::new(config));
        true
    }

    /// Spawns the periodic reload task. The task exits when `shutdown` fires.
    #[must_use]
    pub fn spawn_reload(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => handle.reload().await,
                }
            }
        })
    }

    async fn reload(&self) {
        let mut config = match read_config(&self.path).await {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "config reload failed; keeping previous snapshot");
                return;
            }
        };
        if let Err(err) = validate(&config) {
            error!(%err, "config reload rejected; keeping previous snapshot");
            return;
        }

        {
            let mut guard = self.current.write().expect("config lock poisoned");
            merge_overrides(guard.config(), &mut config);
            *guard = Arc::new(Snapshot::new(config));
        }
        info!("config reloaded");
    }
}

fn merge_overrides(previous: &Config, next: &mut Config) {
    for (name, member) in &mut next.members {
        if let Some(prev) = previous.members.get(name) {
            if prev.override_disabled {
                member.override_disabled = true;
                member.override_time = prev.override_time;
            }
        }
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.system.node_id.is_empty() {
        return Err(Error::Invalid("system.node_id must be non-empty".into()));
    }
    Ok(())
}

async fn read_config(path: &Path) -> Result<Config> {
    let raw = tokio::fs::read(path).await.map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| Error::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_survive_a_reload_merge() {
        let mut previous: Config = serde_json::from_value(serde_json::json!({
            "system": { "node_id": "monitor-01" },
            "nats": { "url": "nats://localhost:4222" },
            "members": { "m1": { "name": "m1" } }
        }))
        .unwrap();
        previous.members.get_mut("m1").unwrap().override_disabled = true;
        previous.members.get_mut("m1").unwrap().override_time = Some(Utc::now());

        let mut next: Config = serde_json::from_value(serde_json::json!({
            "system": { "node_id": "monitor-01" },
            "nats": { "url": "nats://localhost:4222" },
            "members": { "m1": { "name": "m1" }, "m2": { "name": "m2" } }
        }))
        .unwrap();

        merge_overrides(&previous, &mut next);
        assert!(next.members["m1"].override_disabled);
        assert!(next.members["m1"].override_time.is_some());
        assert!(!next.members["m2"].override_disabled);
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "system": { "node_id": "" },
            "nats": { "url": "nats://localhost:4222" }
        }))
        .unwrap();
        assert!(validate(&config).is_err());
    }
}
