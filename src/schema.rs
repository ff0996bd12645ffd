//! Database schema management for `coldchain-sensorsync`.
//!
//! Ensures required tables and indexes exist before the Postgres store is
//! used. Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id                        UUID PRIMARY KEY,
        mac_address               TEXT        NOT NULL UNIQUE,
        name                      TEXT        NOT NULL,
        location_id               UUID,
        log_interval              BIGINT      NOT NULL,
        battery_level             INTEGER     NOT NULL DEFAULT 0,
        last_temperature          DOUBLE PRECISION,
        number_of_logs            BIGINT      NOT NULL DEFAULT 0,
        last_connection_timestamp TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS temperature_breaches (
        id                            UUID PRIMARY KEY,
        sensor_id                     UUID        NOT NULL REFERENCES sensors (id) ON DELETE CASCADE,
        location_id                   UUID,
        breach_type                   TEXT        NOT NULL,
        threshold_minimum_temperature DOUBLE PRECISION NOT NULL,
        threshold_maximum_temperature DOUBLE PRECISION NOT NULL,
        threshold_duration_secs       BIGINT      NOT NULL,
        start_timestamp               TIMESTAMPTZ NOT NULL,
        end_timestamp                 TIMESTAMPTZ
    );
    "#,
    // Raw logs carry an empty aggregation string.
    r#"
    CREATE TABLE IF NOT EXISTS sensor_logs (
        id           UUID PRIMARY KEY,
        sensor_id    UUID        NOT NULL REFERENCES sensors (id) ON DELETE CASCADE,
        location_id  UUID,
        temperature  DOUBLE PRECISION NOT NULL,
        timestamp    TIMESTAMPTZ NOT NULL,
        is_in_breach BOOLEAN     NOT NULL DEFAULT FALSE,
        aggregation  TEXT        NOT NULL DEFAULT '',
        breach_id    UUID REFERENCES temperature_breaches (id) ON DELETE SET NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS item_batches (
        id              UUID PRIMARY KEY,
        item_id         UUID             NOT NULL,
        batch           TEXT             NOT NULL,
        location_id     UUID,
        number_of_packs DOUBLE PRECISION NOT NULL DEFAULT 0
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_log_item_batches (
        sensor_log_id UUID NOT NULL REFERENCES sensor_logs (id) ON DELETE CASCADE,
        item_batch_id UUID NOT NULL REFERENCES item_batches (id) ON DELETE CASCADE,
        PRIMARY KEY (sensor_log_id, item_batch_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS temperature_breach_configs (
        id                  UUID PRIMARY KEY,
        breach_type         TEXT             NOT NULL,
        minimum_temperature DOUBLE PRECISION NOT NULL,
        maximum_temperature DOUBLE PRECISION NOT NULL,
        duration_secs       BIGINT           NOT NULL
    );
    "#,
    // Windowed scans: one sensor, one stage, a timestamp range.
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_logs_sensor_stage_time
        ON sensor_logs (sensor_id, aggregation, timestamp);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_logs_breach_id
        ON sensor_logs (breach_id);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_item_batches_location_id
        ON item_batches (location_id);
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Errors are
/// propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!("Schema ready ({} statements)", STATEMENTS.len());
    Ok(())
}
