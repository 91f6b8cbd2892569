//! Deduplicated outage notifications.
//!
//! One OFFLINE message per outage key, edited in place when the member
//! recovers. The notifier is fire-and-forget: callers never see an error,
//! and nothing here may stall consensus finalization.

mod error;
mod matrix;
mod notifier;

pub use error::Error;
pub use matrix::{MatrixConfig, MatrixTransport};
pub use notifier::{
    MentionSource, MessageId, NoMentions, NotificationState, Notifier, NotifyTransport,
    OutageNotice,
};
