use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::Error;

/// Deadline for a single send or edit.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque id of a sent chat message, used for in-place edits.
pub type MessageId = String;

/// Transport the notifier posts through.
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    /// True once the transport is authenticated and usable.
    fn ready(&self) -> bool;

    /// Posts a message; returns its id for later edits.
    async fn send(&self, body: &str, html_body: &str) -> Result<MessageId, Error>;

    /// Edits a previously sent message in place.
    async fn edit(&self, id: &MessageId, body: &str, html_body: &str) -> Result<(), Error>;
}

/// Chat handles to mention per member.
pub trait MentionSource: Send + Sync {
    /// Mentions for `member`; empty when nobody subscribed.
    fn mentions_for(&self, member: &str) -> Vec<String>;
}

/// A [`MentionSource`] that mentions nobody.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMentions;

impl MentionSource for NoMentions {
    fn mentions_for(&self, _member: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Announcement state for one outage key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotificationState {
    /// An announcer won the election and is sending.
    InFlight,
    /// The OFFLINE message is out; the id is kept for the recovery edit.
    Announced(MessageId),
}

/// Everything needed to format one outage alert.
#[derive(Clone, Debug)]
pub struct OutageNotice {
    /// Member name.
    pub member: String,
    /// Check kind, e.g. `endpoint`.
    pub check_kind: String,
    /// Check name.
    pub check_name: String,
    /// Service domain; empty for site checks.
    pub domain: String,
    /// Endpoint URL; empty except for endpoint checks.
    pub endpoint: String,
    /// Address family.
    pub is_ipv6: bool,
    /// Error text; only rendered for OFFLINE alerts.
    pub error: String,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct NoticeKey {
    member: String,
    check_kind: String,
    check_name: String,
    domain: String,
    endpoint: String,
    is_ipv6: bool,
}

impl OutageNotice {
    fn key(&self) -> NoticeKey {
        NoticeKey {
            member: self.member.clone(),
            check_kind: self.check_kind.clone(),
            check_name: self.check_name.clone(),
            domain: self.domain.clone(),
            endpoint: self.endpoint.clone(),
            is_ipv6: self.is_ipv6,
        }
    }
}

/// The outage notifier. At most one OFFLINE message exists per outage key
/// until an ONLINE transition clears it.
pub struct Notifier {
    transport: Arc<dyn NotifyTransport>,
    mentions: Arc<dyn MentionSource>,
    states: Mutex<HashMap<NoticeKey, NotificationState>>,
}

impl Notifier {
    /// Creates a notifier over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn NotifyTransport>, mentions: Arc<dyn MentionSource>) -> Self {
        Self {
            transport,
            mentions,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Announces an outage. Deduplicated: only the caller that wins the
    /// announcer election sends; everyone else returns immediately. Failures
    /// clear the key so a later attempt may retry.
    pub async fn notify_offline(&self, notice: &OutageNotice) {
        if !self.transport.ready() {
            return;
        }
        let key = notice.key();

        {
            let mut states = self.states.lock().expect("notifier lock poisoned");
            if states.contains_key(&key) {
                // Announced already, or another announcer is in flight.
                return;
            }
            states.insert(key.clone(), NotificationState::InFlight);
        }

        let (body, html) = format_alert(notice, false, &self.mentions.mentions_for(&notice.member));
        match tokio::time::timeout(SEND_TIMEOUT, self.transport.send(&body, &html)).await {
            Ok(Ok(id)) => {
                self.states
                    .lock()
                    .expect("notifier lock poisoned")
                    .insert(key, NotificationState::Announced(id));
            }
            Ok(Err(err)) => {
                error!(%err, member = %notice.member, "failed to send offline alert");
                self.states
                    .lock()
                    .expect("notifier lock poisoned")
                    .remove(&key);
            }
            Err(_) => {
                error!(member = %notice.member, "offline alert timed out");
                self.states
                    .lock()
                    .expect("notifier lock poisoned")
                    .remove(&key);
            }
        }
    }

    /// Announces recovery. Edits the original OFFLINE message in place when
    /// one exists; otherwise posts a fresh ONLINE message. The key is
    /// cleared in every path so future outages may announce again.
    pub async fn notify_online(&self, notice: &OutageNotice) {
        if !self.transport.ready() {
            return;
        }
        let key = notice.key();
        let state = self
            .states
            .lock()
            .expect("notifier lock poisoned")
            .get(&key)
            .cloned();

        let (body, html) = format_alert(notice, true, &[]);

        if let Some(NotificationState::Announced(id)) = state {
            let edit = tokio::time::timeout(SEND_TIMEOUT, self.transport.edit(&id, &body, &html));
            match edit.await {
                Ok(Ok(())) => {
                    self.states
                        .lock()
                        .expect("notifier lock poisoned")
                        .remove(&key);
                    return;
                }
                Ok(Err(err)) => {
                    warn!(%err, member = %notice.member, "edit failed, sending a fresh message");
                }
                Err(_) => {
                    warn!(member = %notice.member, "edit timed out, sending a fresh message");
                }
            }
        }

        if let Ok(Err(err)) =
            tokio::time::timeout(SEND_TIMEOUT, self.transport.send(&body, &html)).await
        {
            error!(%err, member = %notice.member, "failed to send online alert");
        }
        self.states
            .lock()
            .expect("notifier lock poisoned")
            .remove(&key);
    }

    /// Current state for an outage key, for tests and introspection.
    #[must_use]
    pub fn state_of(&self, notice: &OutageNotice) -> Option<NotificationState> {
        self.states
            .lock()
            .expect("notifier lock poisoned")
            .get(&notice.key())
            .cloned()
    }
}

fn format_alert(notice: &OutageNotice, online: bool, mentions: &[String]) -> (String, String) {
    let mention_text = if mentions.is_empty() {
        String::new()
    } else {
        format!("{}\n", mentions.join(" "))
    };
    let mention_html = if mentions.is_empty() {
        String::new()
    } else {
        format!("{}<br/>", mentions.join(" "))
    };

    let (status, status_html) = if online {
        ("\u{2705}  *ONLINE*", "\u{2705}  <strong>ONLINE</strong>")
    } else {
        ("\u{26a0}\u{fe0f}  *OFFLINE*", "\u{26a0}\u{fe0f}  <strong>OFFLINE</strong>")
    };

    let mut fields = format!(
        "\u{2022} Member: **{}**\n\u{2022} Check:  {} / {}\n\u{2022} Domain: {}\n\u{2022} Endpoint: {}\n\u{2022} IPv6:   {}",
        notice.member, notice.check_kind, notice.check_name, notice.domain, notice.endpoint,
        notice.is_ipv6
    );
    let mut fields_html = format!(
        "\u{2022} Member: <strong>{}</strong><br/>\u{2022} Check:  {} / {}<br/>\u{2022} Domain: {}<br/>\u{2022} Endpoint: {}<br/>\u{2022} IPv6:   {}",
        notice.member, notice.check_kind, notice.check_name, notice.domain, notice.endpoint,
        notice.is_ipv6
    );
    if !online {
        fields.push_str(&format!("\n\u{2022} Error:  {}", notice.error));
        fields_html.push_str(&format!("<br/>\u{2022} Error:  {}", notice.error));
    }

    (
        format!("{mention_text}{status}\n{fields}"),
        format!("{mention_html}{status_html}<br/>{fields_html}"),
    )
}
