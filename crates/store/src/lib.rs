//! Result surfaces, event recording and durable-store contracts.
//!
//! Two in-memory surfaces track per-member check results: the **local**
//! surface holds what this node observed itself and feeds consensus votes;
//! the **official** surface holds what the cluster agreed on and drives DNS
//! routing. Official transitions are recorded as outage events through the
//! durable [`EventStore`]; usage totals go through [`UsageStore`]. Both
//! traits have an in-memory implementation here and a MySQL implementation
//! in `geofleet-store-mysql`.

mod durable;
mod error;
mod memory;
mod recorder;
mod results;
mod usage;

pub use durable::{
    store_usage_batch, EventStore, OutageKey, OutageRecord, StoredEvent, UsageRow, UsageRowKey,
    UsageStore,
};
pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use recorder::EventRecorder;
pub use results::{
    DomainResult, EndpointResult, LocalStatus, OfficialStore, ProbeData, ProbeResult,
    ResultSurface, SiteResult, StatusKey, Transition,
};
pub use usage::{GeoEntry, GeoIp, NullGeoIp, StaticGeoIp, UsageLedger, UsageSource};
