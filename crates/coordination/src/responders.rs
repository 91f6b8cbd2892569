use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use geofleet_messaging::{Message, Transport};
use geofleet_store::{EventStore, UsageSource};
use tracing::{debug, error};

use crate::messages::{
    DowntimeEvent, DowntimeRequest, DowntimeResponse, UsageRequest, UsageResponse,
    WireUsageRecord,
};
use crate::subjects;

/// Answers fleet usage requests from this node's local ledger.
///
/// Every request gets an answer: parse or query failures produce an
/// empty-records response with an error string so the requester converges
/// instead of waiting out its timeout.
pub struct UsageResponder {
    node_id: String,
    transport: Arc<dyn Transport>,
    source: Arc<dyn UsageSource>,
}

impl UsageResponder {
    /// Creates a responder serving `source`.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn UsageSource>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            source,
        }
    }

    /// Handles one usage request message.
    pub async fn handle(&self, message: &Message) {
        let request: UsageRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                error!(%err, "malformed usage request");
                self.respond(message, self.error_response(format!("unmarshal error: {err}")))
                    .await;
                return;
            }
        };
        debug!(start = %request.start_date, end = %request.end_date,
            domain = %request.domain, member = %request.member_name,
            "usage request received");

        let (start, end) = match parse_date_range(&request.start_date, &request.end_date) {
            Ok(range) => range,
            Err(reason) => {
                error!(%reason, "invalid usage request");
                self.respond(message, self.error_response(reason)).await;
                return;
            }
        };

        let records = match self
            .source
            .usage(
                start,
                end,
                non_empty(&request.domain),
                non_empty(&request.member_name),
                non_empty(&request.country),
            )
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|row| WireUsageRecord {
                    date: row.date.format("%Y-%m-%d").to_string(),
                    node_id: row.node_id,
                    domain: row.domain,
                    member_name: row.member,
                    asn: row.asn,
                    network_name: row.network_name,
                    country_code: row.country_code,
                    country_name: row.country_name,
                    is_ipv6: row.is_ipv6,
                    hits: row.hits,
                })
                .collect(),
            Err(err) => {
                error!(%err, "local usage query failed");
                self.respond(message, self.error_response(err.to_string()))
                    .await;
                return;
            }
        };

        let response = UsageResponse {
            node_id: self.node_id.clone(),
            usage_records: records,
            error: None,
        };
        self.respond(message, response).await;
    }

    fn error_response(&self, error: String) -> UsageResponse {
        UsageResponse {
            node_id: self.node_id.clone(),
            usage_records: Vec::new(),
            error: Some(error),
        }
    }

    async fn respond(&self, request: &Message, response: UsageResponse) {
        let Ok(payload) = serde_json::to_vec(&response) else {
            error!("failed to encode usage response");
            return;
        };
        let subject = request
            .reply
            .as_deref()
            .unwrap_or(subjects::USAGE_DATA);
        if let Err(err) = self.transport.publish(subject, Bytes::from(payload)).await {
            error!(%subject, %err, "failed to send usage response");
        }
    }
}

/// Answers fleet downtime requests from this node's event store.
pub struct DowntimeResponder {
    node_id: String,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventStore>,
}

impl DowntimeResponder {
    /// Creates a responder serving `events`.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            events,
        }
    }

    /// Handles one downtime request message.
    pub async fn handle(&self, message: &Message) {
        let request: DowntimeRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                error!(%err, "malformed downtime request");
                self.respond(message, self.error_response(format!("unmarshal error: {err}")))
                    .await;
                return;
            }
        };
        debug!(member = %request.member_name, start = %request.start_time,
            end = %request.end_time, "downtime request received");

        if request.end_time < request.start_time {
            self.respond(
                message,
                self.error_response("endTime must not precede startTime".into()),
            )
            .await;
            return;
        }

        let events = match self
            .events
            .fetch_events(
                non_empty(&request.member_name),
                request.start_time,
                request.end_time,
            )
            .await
        {
            Ok(events) => events
                .into_iter()
                .filter(|event| !event.record.status)
                .map(|event| DowntimeEvent {
                    member_name: event.record.key.member,
                    check_type: event.record.key.kind,
                    check_name: event.record.key.check_name,
                    domain_name: event.record.key.domain,
                    endpoint: event.record.key.check_url,
                    status: event.record.status,
                    start_time: event.record.start_time,
                    end_time: event.record.end_time,
                    error_text: event.record.error,
                    data: event.record.extra,
                    is_ipv6: event.record.key.is_ipv6,
                })
                .collect(),
            Err(err) => {
                error!(%err, "local downtime query failed");
                self.respond(message, self.error_response(err.to_string()))
                    .await;
                return;
            }
        };

        let response = DowntimeResponse {
            node_id: self.node_id.clone(),
            events,
            error: None,
        };
        self.respond(message, response).await;
    }

    fn error_response(&self, error: String) -> DowntimeResponse {
        DowntimeResponse {
            node_id: self.node_id.clone(),
            events: Vec::new(),
            error: Some(error),
        }
    }

    async fn respond(&self, request: &Message, response: DowntimeResponse) {
        let Ok(payload) = serde_json::to_vec(&response) else {
            error!("failed to encode downtime response");
            return;
        };
        let subject = request
            .reply
            .as_deref()
            .unwrap_or(subjects::DOWNTIME_DATA);
        if let Err(err) = self.transport.publish(subject, Bytes::from(payload)).await {
            error!(%subject, %err, "failed to send downtime response");
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_date_range(start: &str, end: &str) -> std::result::Result<(NaiveDate, NaiveDate), String> {
    let start = NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid start date {start:?}, expected YYYY-MM-DD"))?;
    let end = NaiveDate::parse_from_str(end.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid end date {end:?}, expected YYYY-MM-DD"))?;
    if start > end {
        return Err("startDate must not be after endDate".into());
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_validation() {
        assert!(parse_date_range("2025-01-01", "2025-01-02").is_ok());
        assert!(parse_date_range(" 2025-01-01 ", "2025-01-01").is_ok());
        assert!(parse_date_range("2025-01-02", "2025-01-01").is_err());
        assert!(parse_date_range("01/02/2025", "2025-01-03").is_err());
        assert!(parse_date_range("", "").is_err());
    }
}
