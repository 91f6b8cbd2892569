//! NATS implementation of the geofleet messaging transport.
#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use geofleet_messaging::{Error, Message, MessageHandler, Subscription, Transport};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fixed delay between reconnect attempts.
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Connect-side timeout for the initial dial.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-subscription channel capacity; sized to absorb fleet-wide bursts.
const SUBSCRIPTION_CAPACITY: usize = 1_000_000;

/// Options for connecting to a NATS server.
#[derive(Clone, Debug, Default)]
pub struct NatsTransportOptions {
    /// Server URL, e.g. `nats://10.0.0.1:4222`.
    pub url: String,

    /// Optional username.
    pub user: Option<String>,

    /// Optional password.
    pub password: Option<String>,
}

/// NATS-backed transport. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connects to the broker. Reconnects are retried forever with a fixed
    /// back-off; publishes fail fast while the connection is down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] when the initial dial fails.
    pub async fn connect(options: NatsTransportOptions) -> Result<Self, Error> {
        let mut connect = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .reconnect_delay_callback(|_attempts| RECONNECT_WAIT)
            .subscription_capacity(SUBSCRIPTION_CAPACITY)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => error!("nats disconnected"),
                    async_nats::Event::Connected => info!("nats reconnected"),
                    async_nats::Event::ClientError(err) => {
                        error!(%err, "nats client error");
                    }
                    other => debug!(?other, "nats event"),
                }
            });

        if let (Some(user), Some(password)) = (options.user.clone(), options.password.clone()) {
            connect = connect.user_and_password(user, password);
        }

        let client = connect
            .connect(options.url.clone())
            .await
            .map_err(|err| {
                error!(url = %options.url, %err, "nats connect failed");
                Error::Disconnected
            })?;

        info!(url = %options.url, "connected to nats");
        Ok(Self { client })
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.client.connection_state() == State::Connected {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }
}

struct NatsSubscription {
    cancel_token: CancellationToken,
    done: oneshot::Receiver<Result<(), Error>>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), Error> {
        self.cancel_token.cancel();
        self.done
            .await
            .unwrap_or_else(|_| Err(Error::Unsubscribe("subscription task gone".into())))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Error> {
        self.ensure_connected()?;
        self.client
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|err| Error::Publish(err.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|err| Error::Publish(err.to_string()))
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.ensure_connected()?;
        self.client
            .publish_with_reply(subject.to_owned(), reply.to_owned(), payload)
            .await
            .map_err(|err| Error::Publish(err.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|err| Error::Publish(err.to_string()))
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>, Error> {
        self.ensure_connected()?;
        let mut subscriber = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| Error::Subscribe(err.to_string()))?;

        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_token.cancelled() => {
                        let result = subscriber
                            .unsubscribe()
                            .await
                            .map_err(|err| Error::Unsubscribe(err.to_string()));
                        let _ = done_tx.send(result);
                        return;
                    }
                    message = subscriber.next() => {
                        let Some(message) = message else {
                            let _ = done_tx.send(Ok(()));
                            return;
                        };
                        let handler = Arc::clone(&handler);
                        // One task per message: handlers may block without
                        // stalling delivery, and panics stay contained.
                        tokio::spawn(async move {
                            let inbound = Message {
                                subject: message.subject.to_string(),
                                reply: message.reply.map(|r| r.to_string()),
                                payload: message.payload,
                            };
                            let subject = inbound.subject.clone();
                            if let Err(panic) =
                                std::panic::AssertUnwindSafe(handler.handle(inbound))
                                    .catch_unwind()
                                    .await
                            {
                                error!(%subject, ?panic, "subscription handler panicked");
                            }
                        });
                    }
                }
            }
        });

        Ok(Box::new(NatsSubscription {
            cancel_token,
            done: done_rx,
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.ensure_connected()?;
        let response = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_owned(), payload),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(|err| {
            warn!(%subject, %err, "nats request failed");
            Error::Publish(err.to_string())
        })?;

        Ok(Message {
            subject: response.subject.to_string(),
            reply: response.reply.map(|r| r.to_string()),
            payload: response.payload,
        })
    }
}
