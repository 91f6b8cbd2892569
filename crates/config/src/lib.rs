//! Configuration snapshots for geofleet nodes.
//!
//! Readers get an immutable [`Snapshot`] behind an `Arc`; a reload task swaps
//! the snapshot in place while preserving manual member overrides. Lookup
//! tables for checks, members and service domains are built once per snapshot
//! so the message path never scans the raw config.

mod error;
mod handle;
mod snapshot;
mod types;

pub use error::{Error, Result};
pub use handle::ConfigHandle;
pub use snapshot::Snapshot;
pub use types::{
    AlertsSettings, Check, CheckKind, Config, ConsensusTuning, MatrixSettings, Member,
    MysqlSettings, NatsSettings, Provider, Service, SystemSettings,
};
