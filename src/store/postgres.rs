use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LogQuery, SensorStore, StoreError, StoreWrite};
use crate::models::{
    Aggregation, BreachConfiguration, BreachType, ItemBatch, Sensor, SensorLog, TemperatureBreach,
};

// ---

const LOG_COLUMNS: &str = r#"
    l.id, l.sensor_id, l.location_id, l.temperature, l.timestamp,
    l.is_in_breach, l.aggregation, l.breach_id,
    ARRAY(
        SELECT j.item_batch_id FROM sensor_log_item_batches j
        WHERE j.sensor_log_id = l.id ORDER BY j.item_batch_id
    ) AS item_batches
"#;

const LOG_FILTER: &str = r#"
    l.sensor_id = $1
    AND ($2::text IS NULL OR l.aggregation = $2)
    AND ($3::timestamptz IS NULL OR l.timestamp > $3)
    AND ($4::timestamptz IS NULL OR l.timestamp < $4)
    AND ($5::bool IS NULL OR l.is_in_breach = $5)
"#;

#[derive(sqlx::FromRow)]
struct SensorLogRow {
    id: Uuid,
    sensor_id: Uuid,
    location_id: Option<Uuid>,
    temperature: f64,
    timestamp: DateTime<Utc>,
    is_in_breach: bool,
    aggregation: String,
    breach_id: Option<Uuid>,
    item_batches: Vec<Uuid>,
}

impl TryFrom<SensorLogRow> for SensorLog {
    type Error = StoreError;

    fn try_from(row: SensorLogRow) -> Result<Self, Self::Error> {
        // ---
        let aggregation = row
            .aggregation
            .parse::<Aggregation>()
            .map_err(StoreError::Corrupt)?;
        Ok(SensorLog {
            id: row.id,
            sensor_id: row.sensor_id,
            location_id: row.location_id,
            temperature: row.temperature,
            timestamp: row.timestamp,
            is_in_breach: row.is_in_breach,
            aggregation,
            breach_id: row.breach_id,
            item_batches: row.item_batches,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SensorRow {
    id: Uuid,
    mac_address: String,
    name: String,
    location_id: Option<Uuid>,
    log_interval: i64,
    battery_level: i32,
    last_temperature: Option<f64>,
    number_of_logs: i64,
    last_connection_timestamp: Option<DateTime<Utc>>,
}

impl From<SensorRow> for Sensor {
    fn from(row: SensorRow) -> Self {
        Sensor {
            id: row.id,
            mac_address: row.mac_address,
            name: row.name,
            location_id: row.location_id,
            log_interval: row.log_interval,
            battery_level: row.battery_level,
            last_temperature: row.last_temperature,
            number_of_logs: row.number_of_logs,
            last_connection_timestamp: row.last_connection_timestamp,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: Uuid,
    breach_type: String,
    minimum_temperature: f64,
    maximum_temperature: f64,
    duration_secs: i64,
}

impl TryFrom<ConfigRow> for BreachConfiguration {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(BreachConfiguration {
            id: row.id,
            breach_type: row.breach_type.parse::<BreachType>().map_err(StoreError::Corrupt)?,
            minimum_temperature: row.minimum_temperature,
            maximum_temperature: row.maximum_temperature,
            duration_secs: row.duration_secs,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BreachRow {
    id: Uuid,
    sensor_id: Uuid,
    location_id: Option<Uuid>,
    breach_type: String,
    threshold_minimum_temperature: f64,
    threshold_maximum_temperature: f64,
    threshold_duration_secs: i64,
    start_timestamp: DateTime<Utc>,
    end_timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<BreachRow> for TemperatureBreach {
    type Error = StoreError;

    fn try_from(row: BreachRow) -> Result<Self, Self::Error> {
        Ok(TemperatureBreach {
            id: row.id,
            sensor_id: row.sensor_id,
            location_id: row.location_id,
            breach_type: row.breach_type.parse::<BreachType>().map_err(StoreError::Corrupt)?,
            threshold_minimum_temperature: row.threshold_minimum_temperature,
            threshold_maximum_temperature: row.threshold_maximum_temperature,
            threshold_duration_secs: row.threshold_duration_secs,
            start_timestamp: row.start_timestamp,
            end_timestamp: row.end_timestamp,
        })
    }
}

/// Postgres-backed store. Expects the tables from [`crate::schema::create_schema`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[async_trait]
impl SensorStore for PgStore {
    // ---
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn sensor(&self, id: Uuid) -> Result<Option<Sensor>, StoreError> {
        // ---
        let row = sqlx::query_as::<_, SensorRow>("SELECT * FROM sensors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Sensor::from))
    }

    async fn located_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT * FROM sensors WHERE location_id IS NOT NULL ORDER BY mac_address",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Sensor::from).collect())
    }

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sensors (
                id, mac_address, name, location_id, log_interval, battery_level,
                last_temperature, number_of_logs, last_connection_timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                mac_address = EXCLUDED.mac_address,
                name = EXCLUDED.name,
                location_id = EXCLUDED.location_id,
                log_interval = EXCLUDED.log_interval,
                battery_level = EXCLUDED.battery_level,
                last_temperature = EXCLUDED.last_temperature,
                number_of_logs = EXCLUDED.number_of_logs,
                last_connection_timestamp = EXCLUDED.last_connection_timestamp
            "#,
        )
        .bind(sensor.id)
        .bind(&sensor.mac_address)
        .bind(&sensor.name)
        .bind(sensor.location_id)
        .bind(sensor.log_interval)
        .bind(sensor.battery_level)
        .bind(sensor.last_temperature)
        .bind(sensor.number_of_logs)
        .bind(sensor.last_connection_timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sensor_logs(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Vec<SensorLog>, StoreError> {
        // ---
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM sensor_logs l WHERE {LOG_FILTER} \
             ORDER BY l.timestamp, l.id LIMIT $6"
        );
        let rows = sqlx::query_as::<_, SensorLogRow>(&sql)
            .bind(sensor_id)
            .bind(query.aggregation.map(|a| a.as_str()))
            .bind(query.after)
            .bind(query.before)
            .bind(query.in_breach)
            .bind(query.limit.map(|n| n as i64))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SensorLog::try_from).collect()
    }

    async fn latest_log_timestamp(
        &self,
        sensor_id: Uuid,
        query: &LogQuery,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        // ---
        let sql = format!("SELECT MAX(l.timestamp) FROM sensor_logs l WHERE {LOG_FILTER}");
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .bind(sensor_id)
            .bind(query.aggregation.map(|a| a.as_str()))
            .bind(query.after)
            .bind(query.before)
            .bind(query.in_breach)
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn count_logs(&self, sensor_id: Uuid) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_logs WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn item_batches_at(&self, location_id: Uuid) -> Result<Vec<ItemBatch>, StoreError> {
        // ---
        let batches = sqlx::query_as::<_, ItemBatch>(
            r#"
            SELECT id, item_id, batch, location_id, number_of_packs
            FROM item_batches
            WHERE location_id = $1 AND number_of_packs > 0
            ORDER BY id
            "#,
        )
        .bind(location_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    async fn item_batches(&self, ids: &[Uuid]) -> Result<Vec<ItemBatch>, StoreError> {
        // ---
        let batches = sqlx::query_as::<_, ItemBatch>(
            r#"
            SELECT id, item_id, batch, location_id, number_of_packs
            FROM item_batches WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    async fn upsert_item_batch(&self, batch: &ItemBatch) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO item_batches (id, item_id, batch, location_id, number_of_packs)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                item_id = EXCLUDED.item_id,
                batch = EXCLUDED.batch,
                location_id = EXCLUDED.location_id,
                number_of_packs = EXCLUDED.number_of_packs
            "#,
        )
        .bind(batch.id)
        .bind(batch.item_id)
        .bind(&batch.batch)
        .bind(batch.location_id)
        .bind(batch.number_of_packs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn breach_configurations(&self) -> Result<Vec<BreachConfiguration>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, ConfigRow>(
            "SELECT * FROM temperature_breach_configs ORDER BY breach_type",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BreachConfiguration::try_from).collect()
    }

    async fn upsert_breach_configuration(
        &self,
        config: &BreachConfiguration,
    ) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO temperature_breach_configs (
                id, breach_type, minimum_temperature, maximum_temperature, duration_secs
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                breach_type = EXCLUDED.breach_type,
                minimum_temperature = EXCLUDED.minimum_temperature,
                maximum_temperature = EXCLUDED.maximum_temperature,
                duration_secs = EXCLUDED.duration_secs
            "#,
        )
        .bind(config.id)
        .bind(config.breach_type.as_str())
        .bind(config.minimum_temperature)
        .bind(config.maximum_temperature)
        .bind(config.duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn breaches(&self, sensor_id: Uuid) -> Result<Vec<TemperatureBreach>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, BreachRow>(
            "SELECT * FROM temperature_breaches WHERE sensor_id = $1 ORDER BY start_timestamp",
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TemperatureBreach::try_from).collect()
    }

    async fn breach_logs(&self, breach_id: Uuid) -> Result<Vec<SensorLog>, StoreError> {
        // ---
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM sensor_logs l WHERE l.breach_id = $1 ORDER BY l.timestamp"
        );
        let rows = sqlx::query_as::<_, SensorLogRow>(&sql)
            .bind(breach_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SensorLog::try_from).collect()
    }

    async fn commit(&self, write: StoreWrite) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        // Breaches first: logs reference them.
        for breach in &write.put_breaches {
            sqlx::query(
                r#"
                INSERT INTO temperature_breaches (
                    id, sensor_id, location_id, breach_type,
                    threshold_minimum_temperature, threshold_maximum_temperature,
                    threshold_duration_secs, start_timestamp, end_timestamp
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    end_timestamp = EXCLUDED.end_timestamp
                "#,
            )
            .bind(breach.id)
            .bind(breach.sensor_id)
            .bind(breach.location_id)
            .bind(breach.breach_type.as_str())
            .bind(breach.threshold_minimum_temperature)
            .bind(breach.threshold_maximum_temperature)
            .bind(breach.threshold_duration_secs)
            .bind(breach.start_timestamp)
            .bind(breach.end_timestamp)
            .execute(&mut *tx)
            .await?;
        }

        for log in &write.put_logs {
            sqlx::query(
                r#"
                INSERT INTO sensor_logs (
                    id, sensor_id, location_id, temperature, timestamp,
                    is_in_breach, aggregation, breach_id
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    location_id = EXCLUDED.location_id,
                    temperature = EXCLUDED.temperature,
                    timestamp = EXCLUDED.timestamp,
                    is_in_breach = EXCLUDED.is_in_breach,
                    aggregation = EXCLUDED.aggregation,
                    breach_id = EXCLUDED.breach_id
                "#,
            )
            .bind(log.id)
            .bind(log.sensor_id)
            .bind(log.location_id)
            .bind(log.temperature)
            .bind(log.timestamp)
            .bind(log.is_in_breach)
            .bind(log.aggregation.as_str())
            .bind(log.breach_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM sensor_log_item_batches WHERE sensor_log_id = $1")
                .bind(log.id)
                .execute(&mut *tx)
                .await?;

            if !log.item_batches.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO sensor_log_item_batches (sensor_log_id, item_batch_id)
                    SELECT $1, UNNEST($2::uuid[])
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(log.id)
                .bind(&log.item_batches)
                .execute(&mut *tx)
                .await?;
            }
        }

        if !write.delete_logs.is_empty() {
            sqlx::query("DELETE FROM sensor_logs WHERE id = ANY($1)")
                .bind(&write.delete_logs)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
