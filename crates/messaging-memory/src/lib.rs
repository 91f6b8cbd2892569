//! In-process implementation of the geofleet messaging transport.
//!
//! All clones of a [`MemoryTransport`] share one bus, so a test can hand a
//! clone to every simulated node and exchange messages without a broker.
//! Delivery mirrors the wire backend: every matching subscription gets its
//! own task per message, so handlers see parallel, unordered delivery.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use geofleet_messaging::{subject, Error, Message, MessageHandler, Subscription, Transport};
use tokio::sync::oneshot;
use tracing::error;

struct SubEntry {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn deliver(&self, message: &Message) {
        let subscriptions = self.subscriptions.read().expect("bus lock poisoned");
        for entry in subscriptions.values() {
            if subject::matches(&message.subject, &entry.pattern) {
                let handler = Arc::clone(&entry.handler);
                let message = message.clone();
                tokio::spawn(async move {
                    let subject = message.subject.clone();
                    if let Err(panic) =
                        std::panic::AssertUnwindSafe(handler.handle(message))
                            .catch_unwind()
                            .await
                    {
                        error!(%subject, ?panic, "subscription handler panicked");
                    }
                });
            }
        }
    }
}

/// In-process message bus. Clones share the same subscriptions.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<BusInner>,
}

impl MemoryTransport {
    /// Creates a fresh bus with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemorySubscription {
    id: u64,
    inner: Arc<BusInner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), Error> {
        self.inner
            .subscriptions
            .write()
            .expect("bus lock poisoned")
            .remove(&self.id);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject_str: &str, payload: Bytes) -> Result<(), Error> {
        subject::validate_subject(subject_str)?;
        self.inner.deliver(&Message {
            subject: subject_str.to_owned(),
            reply: None,
            payload,
        });
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject_str: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        subject::validate_subject(subject_str)?;
        self.inner.deliver(&Message {
            subject: subject_str.to_owned(),
            reply: Some(reply.to_owned()),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>, Error> {
        subject::validate_pattern(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .write()
            .expect("bus lock poisoned")
            .insert(
                id,
                SubEntry {
                    pattern: pattern.to_owned(),
                    handler,
                },
            );
        Ok(Box::new(MemorySubscription {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn request(
        &self,
        subject_str: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let inbox = format!(
            "_INBOX.mem.{}",
            self.inner.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let subscription = self
            .subscribe(
                &inbox,
                geofleet_messaging::handler_fn(move |message| {
                    let tx = Arc::clone(&tx);
                    async move {
                        if let Some(tx) = tx.lock().expect("reply lock poisoned").take() {
                            let _ = tx.send(message);
                        }
                    }
                }),
            )
            .await?;

        self.publish_with_reply(subject_str, &inbox, payload).await?;

        let reply = tokio::time::timeout(timeout, rx).await;
        subscription.unsubscribe().await?;
        match reply {
            Ok(Ok(message)) => Ok(message),
            _ => Err(Error::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        // Let spawned delivery tasks run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriptions() {
        let bus = MemoryTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_exact = Arc::clone(&hits);
        let _sub = bus
            .subscribe(
                "consensus.vote",
                geofleet_messaging::handler_fn(move |_| {
                    let hits = Arc::clone(&hits_exact);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        let hits_wild = Arc::clone(&hits);
        let _wild = bus
            .subscribe(
                ">",
                geofleet_messaging::handler_fn(move |_| {
                    let hits = Arc::clone(&hits_wild);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("consensus.vote", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        bus.publish("consensus.propose", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MemoryTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_sub = Arc::clone(&hits);
        let sub = bus
            .subscribe(
                "a.b",
                geofleet_messaging::handler_fn(move |_| {
                    let hits = Arc::clone(&hits_sub);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("a.b", Bytes::new()).await.unwrap();
        settle().await;
        sub.unsubscribe().await.unwrap();
        bus.publish("a.b", Bytes::new()).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = MemoryTransport::new();
        let responder = bus.clone();
        let _sub = bus
            .subscribe(
                "svc.echo",
                geofleet_messaging::handler_fn(move |message: Message| {
                    let responder = responder.clone();
                    async move {
                        if let Some(reply) = message.reply {
                            responder.publish(&reply, message.payload).await.unwrap();
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let reply = bus
            .request(
                "svc.echo",
                Bytes::from_static(b"ping"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let bus = MemoryTransport::new();
        let err = bus
            .request("svc.none", Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let bus = MemoryTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = bus
            .subscribe(
                "a.b",
                geofleet_messaging::handler_fn(|_| async { panic!("boom") }),
            )
            .await
            .unwrap();
        let hits_good = Arc::clone(&hits);
        let _good = bus
            .subscribe(
                "a.b",
                geofleet_messaging::handler_fn(move |_| {
                    let hits = Arc::clone(&hits_good);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("a.b", Bytes::new()).await.unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
