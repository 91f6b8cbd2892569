//! Abstract interface for geofleet inter-node messaging.
//!
//! The coordination layer never talks to a concrete broker; it goes through
//! [`Transport`], which backends implement (`geofleet-messaging-nats` for the
//! wire, `geofleet-messaging-memory` for tests and single-node deployments).
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

/// Subject validation and wildcard matching.
pub mod subject;

pub use error::{Error, Result};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// An inbound message delivered to a subscription handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,

    /// Reply inbox for request-reply exchanges, when the publisher set one.
    pub reply: Option<String>,

    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Handler invoked for every message delivered to a subscription.
///
/// Backends deliver messages from a pool of parallel tasks; implementations
/// MUST NOT assume serial delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one inbound message.
    async fn handle(&self, message: Message);
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message) {
        (self.f)(message).await;
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// A live subscription handle.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Stop delivery and release backend resources.
    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}

/// Narrow messaging API decoupled from the wire protocol.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish `payload` on `subject`, blocking until the broker has
    /// acknowledged send-side buffering.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish with a reply inbox attached, for request-reply exchanges.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<()>;

    /// Subscribe `handler` to `subject` (wildcards allowed).
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>>;

    /// Single request-reply round trip with a deadline.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message>;
}
