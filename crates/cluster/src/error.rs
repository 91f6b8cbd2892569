/// Errors raised by the membership layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gossip payload could not be decoded.
    #[error("malformed cluster message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] geofleet_messaging::Error),
}
