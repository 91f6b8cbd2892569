/// Errors raised by notification transports. They stay inside the notifier;
/// business logic never sees them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport is not authenticated yet.
    #[error("notification transport not ready")]
    NotReady,

    /// The send or edit call failed.
    #[error("notification failed: {0}")]
    Send(String),

    /// The call did not finish within its deadline.
    #[error("notification timed out")]
    Timeout,
}
