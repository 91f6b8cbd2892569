use geofleet_cluster::Role;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No active peers of the required role; fail fast instead of waiting
    /// out a timeout that cannot succeed.
    #[error("no active {role:?} nodes")]
    NoPeers {
        /// Role the request targeted.
        role: Role,
    },

    /// A request or query failed validation before hitting the wire.
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] geofleet_messaging::Error),

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] geofleet_store::Error),
}
