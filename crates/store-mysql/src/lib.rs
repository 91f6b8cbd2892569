//! MySQL implementation of the geofleet durable store.
//!
//! Two tables back the fleet: `requests` holds idempotent per-node usage
//! totals (the `hits` column is replaced on conflict, never accumulated) and
//! `member_events` holds outage rows, at most one open offline row per
//! outage key. All timestamps are UTC.

mod schema;

pub use schema::ensure_schema;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use geofleet_config::CheckKind;
use geofleet_store::{
    Error, EventStore, OutageKey, OutageRecord, Result, StoredEvent, UsageRow, UsageStore,
};
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySqlPool, Row};
use tracing::{info, warn};

/// How many one-second ping attempts start-up makes before giving up.
const PING_ATTEMPTS: u32 = 30;

/// MySQL-backed durable store.
#[derive(Clone)]
pub struct MysqlStore {
    pool: MySqlPool,
}

impl MysqlStore {
    /// Connects the pool and verifies the server is reachable. Exhausting
    /// the ping retries is an error; start-up treats it as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the DSN is invalid or the server
    /// never answers.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(40)
            .idle_timeout(Duration::from_secs(120))
            .max_lifetime(Duration::from_secs(4 * 3600))
            .connect_lazy(dsn)
            .map_err(|err| Error::Storage(format!("invalid mysql dsn: {err}")))?;

        let store = Self { pool };
        for attempt in 1..=PING_ATTEMPTS {
            match sqlx::query("SELECT 1").execute(&store.pool).await {
                Ok(_) => {
                    info!("connected to mysql");
                    return Ok(store);
                }
                Err(err) if attempt < PING_ATTEMPTS => {
                    warn!(%err, attempt, "mysql ping failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => {
                    return Err(Error::Storage(format!(
                        "mysql unreachable after {PING_ATTEMPTS}s: {err}"
                    )));
                }
            }
        }
        unreachable!("ping loop returns on success or final failure")
    }

    /// The underlying pool, for schema management.
    #[must_use]
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl UsageStore for MysqlStore {
    async fn upsert_usage(&self, row: &UsageRow) -> Result<()> {
        sqlx::query(
            r"INSERT INTO requests
                (date, node_id, domain_name, member_name, network_asn, network_name,
                 country_code, country_name, is_ipv6, hits)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON DUPLICATE KEY UPDATE hits = VALUES(hits)",
        )
        .bind(row.date)
        .bind(&row.node_id)
        .bind(&row.domain)
        .bind(&row.member)
        .bind(&row.asn)
        .bind(&row.network_name)
        .bind(&row.country_code)
        .bind(&row.country_name)
        .bind(row.is_ipv6)
        .bind(row.hits)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for MysqlStore {
    async fn insert_outage(&self, record: &OutageRecord) -> Result<()> {
        // One open offline row per key: refresh it when present.
        if let Some(open) = self.find_open_outage(&record.key).await? {
            sqlx::query("UPDATE member_events SET error = ?, vote_data = ? WHERE id = ?")
                .bind(&record.error)
                .bind(encode_json(&record.vote_data))
                .bind(open.id)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            return Ok(());
        }

        sqlx::query(
            r"INSERT INTO member_events
                (check_type, check_name, endpoint, domain_name, member_name,
                 status, is_ipv6, start_time, error, vote_data, additional_data)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.key.kind.as_str())
        .bind(&record.key.check_name)
        .bind(&record.key.check_url)
        .bind(&record.key.domain)
        .bind(&record.key.member)
        .bind(record.status)
        .bind(record.key.is_ipv6)
        .bind(record.start_time.naive_utc())
        .bind(&record.error)
        .bind(encode_json(&record.vote_data))
        .bind(encode_json(&record.extra))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn close_outage(&self, key: &OutageKey) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE member_events
              SET end_time = UTC_TIMESTAMP(), status = 1
              WHERE check_type = ? AND check_name = ? AND endpoint = ?
                AND domain_name = ? AND member_name = ? AND is_ipv6 = ?
                AND status = 0 AND end_time IS NULL",
        )
        .bind(key.kind.as_str())
        .bind(&key.check_name)
        .bind(&key.check_url)
        .bind(&key.domain)
        .bind(&key.member)
        .bind(key.is_ipv6)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_open_outage(&self, key: &OutageKey) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(
            r"SELECT id, check_type, check_name, endpoint, domain_name, member_name,
                     status, is_ipv6, start_time, end_time, error, vote_data, additional_data
              FROM member_events
              WHERE check_type = ? AND check_name = ? AND endpoint = ?
                AND domain_name = ? AND member_name = ? AND is_ipv6 = ?
                AND status = 0 AND end_time IS NULL
              LIMIT 1",
        )
        .bind(key.kind.as_str())
        .bind(&key.check_name)
        .bind(&key.check_url)
        .bind(&key.domain)
        .bind(&key.member)
        .bind(key.is_ipv6)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(|row| decode_event(&row)).transpose()
    }

    async fn close_event(&self, id: i64, end_time: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE member_events SET end_time = ?, status = 1 WHERE id = ?")
            .bind(end_time.naive_utc())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_event(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM member_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn fetch_events(
        &self,
        member: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r"SELECT id, check_type, check_name, endpoint, domain_name, member_name,
                     status, is_ipv6, start_time, end_time, error, vote_data, additional_data
              FROM member_events
              WHERE (? IS NULL OR member_name = ?)
                AND start_time <= ?
                AND (end_time IS NULL OR end_time >= ?)
              ORDER BY start_time",
        )
        .bind(member)
        .bind(member)
        .bind(end.naive_utc())
        .bind(start.naive_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(decode_event).collect()
    }
}

fn storage_err(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

fn encode_json<T: serde::Serialize>(value: &Option<T>) -> Option<String> {
    value
        .as_ref()
        .and_then(|v| serde_json::to_string(v).ok())
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn decode_event(row: &MySqlRow) -> Result<StoredEvent> {
    let kind_raw: String = row.try_get("check_type").map_err(storage_err)?;
    let kind = CheckKind::parse(&kind_raw)
        .ok_or_else(|| Error::Storage(format!("unknown check_type {kind_raw:?}")))?;

    let start_time: NaiveDateTime = row.try_get("start_time").map_err(storage_err)?;
    let end_time: Option<NaiveDateTime> = row.try_get("end_time").map_err(storage_err)?;

    Ok(StoredEvent {
        id: row.try_get("id").map_err(storage_err)?,
        record: OutageRecord {
            key: OutageKey {
                kind,
                check_name: row.try_get("check_name").map_err(storage_err)?,
                check_url: row.try_get("endpoint").map_err(storage_err)?,
                domain: row.try_get("domain_name").map_err(storage_err)?,
                member: row.try_get("member_name").map_err(storage_err)?,
                is_ipv6: row.try_get("is_ipv6").map_err(storage_err)?,
            },
            status: row.try_get("status").map_err(storage_err)?,
            start_time: DateTime::from_naive_utc_and_offset(start_time, Utc),
            end_time: end_time.map(|t| DateTime::from_naive_utc_and_offset(t, Utc)),
            error: row
                .try_get::<Option<String>, _>("error")
                .map_err(storage_err)?
                .unwrap_or_default(),
            vote_data: decode_json::<HashMap<String, bool>>(
                row.try_get("vote_data").map_err(storage_err)?,
            ),
            extra: decode_json(row.try_get("additional_data").map_err(storage_err)?),
        },
    })
}
