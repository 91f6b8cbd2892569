/// Result type for config operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON or misses required fields.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Semantic validation failed.
    #[error("invalid config: {0}")]
    Invalid(String),
}
