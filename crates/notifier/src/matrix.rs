use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notifier::{MessageId, NotifyTransport};
use crate::Error;

/// How long to wait between login attempts.
const LOGIN_RETRY: Duration = Duration::from_secs(30);

/// How often the health ticker verifies the session.
const HEALTH_INTERVAL: Duration = Duration::from_secs(300);

/// Per-request HTTP deadline.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Matrix connection settings.
#[derive(Clone, Debug, Default)]
pub struct MatrixConfig {
    /// Homeserver base URL, e.g. `https://matrix.example.org`.
    pub homeserver_url: String,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Destination room id.
    pub room_id: String,
}

impl MatrixConfig {
    fn is_complete(&self) -> bool {
        !(self.homeserver_url.is_empty()
            || self.username.is_empty()
            || self.password.is_empty()
            || self.room_id.is_empty())
    }
}

#[derive(Clone, Debug)]
struct Session {
    access_token: String,
}

/// Matrix client-server transport. Logs in with a password, keeps the
/// session alive with a periodic `whoami`, and re-authenticates when the
/// session breaks.
pub struct MatrixTransport {
    http: reqwest::Client,
    config: MatrixConfig,
    session: RwLock<Option<Session>>,
}

impl MatrixTransport {
    /// Creates the transport. Call [`MatrixTransport::start`] to launch the
    /// login loop; until it succeeds, [`NotifyTransport::ready`] is false.
    #[must_use]
    pub fn new(config: MatrixConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            http,
            config,
            session: RwLock::new(None),
        })
    }

    /// Launches the background login loop and health ticker. The task exits
    /// when `shutdown` fires.
    #[must_use]
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Login phase.
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    if !transport.config.is_complete() {
                        warn!("matrix configuration incomplete, notifications disabled");
                    } else if transport.login().await {
                        break;
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(LOGIN_RETRY) => {}
                    }
                }

                // Health phase; fall back to login when the session breaks.
                let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        _ = ticker.tick() => {
                            if !transport.whoami().await {
                                warn!("matrix session lost, re-authenticating");
                                *transport.session.write().expect("session lock poisoned") = None;
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn login(&self) -> bool {
        let url = format!("{}/_matrix/client/v3/login", self.config.homeserver_url);
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": self.config.username },
            "password": self.config.password,
        });

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "matrix login request failed");
                return false;
            }
        };
        if !response.status().is_success() {
            error!(status = %response.status(), "matrix login rejected");
            return false;
        }
        let parsed: serde_json::Value = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(%err, "matrix login response unreadable");
                return false;
            }
        };

        let access_token = parsed["access_token"].as_str().unwrap_or_default();
        let user_id = parsed["user_id"].as_str().unwrap_or_default();
        if access_token.is_empty() {
            error!("matrix login response missing access token");
            return false;
        }

        info!(user = %user_id, room = %self.config.room_id, "matrix logged in");
        *self.session.write().expect("session lock poisoned") = Some(Session {
            access_token: access_token.to_owned(),
        });
        true
    }

    async fn whoami(&self) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let url = format!(
            "{}/_matrix/client/v3/account/whoami",
            self.config.homeserver_url
        );
        matches!(
            self.http.get(&url).bearer_auth(&session.access_token).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    fn session(&self) -> Option<Session> {
        self.session.read().expect("session lock poisoned").clone()
    }

    async fn send_event(
        &self,
        content: serde_json::Value,
    ) -> Result<MessageId, Error> {
        let session = self.session().ok_or(Error::NotReady)?;
        let url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            self.config.homeserver_url,
            encode_path(&self.config.room_id),
            Uuid::new_v4()
        );

        let response = self
            .http
            .put(&url)
            .bearer_auth(&session.access_token)
            .json(&content)
            .send()
            .await
            .map_err(|err| Error::Send(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Send(format!("status {}", response.status())));
        }
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|err| Error::Send(err.to_string()))?;
        parsed["event_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::Send("response missing event_id".into()))
    }
}

#[async_trait]
impl NotifyTransport for MatrixTransport {
    fn ready(&self) -> bool {
        self.session().is_some()
    }

    async fn send(&self, body: &str, html_body: &str) -> Result<MessageId, Error> {
        self.send_event(json!({
            "msgtype": "m.text",
            "body": body,
            "format": "org.matrix.custom.html",
            "formatted_body": html_body,
        }))
        .await
    }

    async fn edit(&self, id: &MessageId, body: &str, html_body: &str) -> Result<(), Error> {
        self.send_event(json!({
            "msgtype": "m.text",
            "body": body,
            "format": "org.matrix.custom.html",
            "formatted_body": html_body,
            "m.new_content": {
                "msgtype": "m.text",
                "body": body,
                "format": "org.matrix.custom.html",
                "formatted_body": html_body,
            },
            "m.relates_to": { "rel_type": "m.replace", "event_id": id },
        }))
        .await
        .map(|_| ())
    }
}

fn encode_path(segment: &str) -> String {
    // Room ids carry `!` and `:`; encode the few characters Matrix ids use.
    segment
        .replace('%', "%25")
        .replace('!', "%21")
        .replace(':', "%3A")
        .replace('#', "%23")
}
