/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a messaging backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport is not connected; publishes fail fast instead of
    /// buffering while the broker is away.
    #[error("transport disconnected")]
    Disconnected,

    /// Publish or flush failed on the broker side.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscription could not be established.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Unsubscribe failed; the backend subscription may linger.
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),

    /// A request did not receive a reply within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Subject or pattern was rejected by validation.
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}
