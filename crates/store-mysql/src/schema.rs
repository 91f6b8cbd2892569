use geofleet_store::{Error, Result};
use sqlx::MySqlPool;

const CREATE_REQUESTS: &str = r"
CREATE TABLE IF NOT EXISTS requests (
    date          DATE         NOT NULL,
    node_id       VARCHAR(64)  NOT NULL,
    domain_name   VARCHAR(128) NOT NULL DEFAULT '',
    member_name   VARCHAR(64)  NOT NULL DEFAULT '',
    network_asn   VARCHAR(32)  NOT NULL DEFAULT '',
    network_name  VARCHAR(128) NOT NULL DEFAULT '',
    country_code  VARCHAR(8)   NOT NULL DEFAULT '',
    country_name  VARCHAR(64)  NOT NULL DEFAULT '',
    is_ipv6       TINYINT(1)   NOT NULL DEFAULT 0,
    hits          BIGINT UNSIGNED NOT NULL DEFAULT 0,
    PRIMARY KEY (date, node_id, domain_name, member_name, network_asn,
                 network_name, country_code, country_name, is_ipv6)
)";

const CREATE_MEMBER_EVENTS: &str = r"
CREATE TABLE IF NOT EXISTS member_events (
    id              BIGINT       NOT NULL AUTO_INCREMENT,
    check_type      VARCHAR(16)  NOT NULL,
    check_name      VARCHAR(64)  NOT NULL,
    endpoint        VARCHAR(255) NOT NULL DEFAULT '',
    domain_name     VARCHAR(128) NOT NULL DEFAULT '',
    member_name     VARCHAR(64)  NOT NULL,
    status          TINYINT(1)   NOT NULL,
    is_ipv6         TINYINT(1)   NOT NULL DEFAULT 0,
    start_time      DATETIME     NOT NULL,
    end_time        DATETIME     NULL,
    error           TEXT         NULL,
    vote_data       TEXT         NULL,
    additional_data TEXT         NULL,
    PRIMARY KEY (id),
    KEY open_outage (check_type, check_name, member_name, is_ipv6, status, end_time),
    KEY member_window (member_name, start_time)
)";

/// Creates the `requests` and `member_events` tables when missing.
///
/// # Errors
///
/// Returns [`Error::Storage`] when DDL execution fails.
pub async fn ensure_schema(pool: &MySqlPool) -> Result<()> {
    for ddl in [CREATE_REQUESTS, CREATE_MEMBER_EVENTS] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|err| Error::Storage(format!("schema setup failed: {err}")))?;
    }
    Ok(())
}
