/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by result surfaces and durable stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The durable backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A query was rejected before reaching the backend.
    #[error("validation error: {0}")]
    Validation(String),

    /// Several rows in a batch failed; the rest were persisted.
    #[error("batch completed with {failed} error(s): {first}")]
    Batch {
        /// How many rows failed.
        failed: usize,
        /// First failure, for context.
        first: String,
    },
}
