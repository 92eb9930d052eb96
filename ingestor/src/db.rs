use crate::errors::Result;
use crate::forward::Record;
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{PumpEventRecord, StatusRecord, TelemetryRecord};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Rows of one flush, split by table.
#[derive(Debug, Default)]
pub struct Batch {
    telemetry: Vec<TelemetryRecord>,
    status: Vec<StatusRecord>,
    pump_events: Vec<PumpEventRecord>,
}

impl Batch {
    pub fn from_records(records: &[Record]) -> Self {
        let mut batch = Batch::default();
        for record in records {
            match record {
                Record::Telemetry { device_id, reading } => batch.telemetry.push(TelemetryRecord {
                    device_id: device_id.clone(),
                    timestamp: reading.timestamp,
                    soil_mv: reading.soil_mv,
                    soil_pct: reading.soil_pct,
                    light_mv: reading.light_mv,
                    light_pct: reading.light_pct,
                    temp_c: reading.temp_c,
                    humidity_pct: reading.humidity_pct,
                    pump_running: reading.pump_running,
                }),
                Record::Status {
                    device_id,
                    status,
                    timestamp,
                } => batch.status.push(StatusRecord {
                    device_id: device_id.clone(),
                    timestamp: *timestamp,
                    status: status.clone(),
                }),
                Record::PumpEvent {
                    device_id,
                    action,
                    duration_ms,
                    timestamp,
                } => batch.pump_events.push(PumpEventRecord {
                    device_id: device_id.clone(),
                    timestamp: *timestamp,
                    action: action.as_str().to_string(),
                    duration_ms: duration_ms.map(|ms| ms as i64),
                }),
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.telemetry.len() + self.status.len() + self.pump_events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write a batch, retrying transient failures with exponential backoff.
pub async fn insert_batch(pool: &PgPool, batch: &Batch) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match insert_batch_inner(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) => match &e {
                crate::errors::Error::Database(db_err) => {
                    DB_FAILURES_TOTAL.inc();
                    if attempts >= max_attempts || !is_transient_error(db_err) {
                        error!(
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, e
                        );
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Database insert failed with non-database error: {}", e);
                    return Err(e);
                }
            },
        }
    }
}

async fn insert_batch_inner(pool: &PgPool, batch: &Batch) -> Result<()> {
    let mut tx = pool.begin().await?;

    if !batch.telemetry.is_empty() {
        let rows = &batch.telemetry;
        let device_ids: Vec<&str> = rows.iter().map(|t| t.device_id.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|t| t.timestamp).collect();
        let soil_mv: Vec<Option<f64>> = rows.iter().map(|t| t.soil_mv).collect();
        let soil_pct: Vec<Option<f64>> = rows.iter().map(|t| t.soil_pct).collect();
        let light_mv: Vec<Option<f64>> = rows.iter().map(|t| t.light_mv).collect();
        let light_pct: Vec<Option<f64>> = rows.iter().map(|t| t.light_pct).collect();
        let temp_c: Vec<Option<f64>> = rows.iter().map(|t| t.temp_c).collect();
        let humidity_pct: Vec<Option<f64>> = rows.iter().map(|t| t.humidity_pct).collect();
        let pump_running: Vec<Option<bool>> = rows.iter().map(|t| t.pump_running).collect();

        sqlx::query(
            r#"
            INSERT INTO irrigation_telemetry
                (device_id, ts, soil_mv, soil_pct, light_mv, light_pct,
                 temp_c, humidity_pct, pump_running)
            SELECT * FROM UNNEST(
                $1::text[], $2::timestamptz[], $3::float8[], $4::float8[], $5::float8[],
                $6::float8[], $7::float8[], $8::float8[], $9::bool[]
            )
            ON CONFLICT (device_id, ts) DO NOTHING
            "#,
        )
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&soil_mv)
        .bind(&soil_pct)
        .bind(&light_mv)
        .bind(&light_pct)
        .bind(&temp_c)
        .bind(&humidity_pct)
        .bind(&pump_running)
        .execute(&mut *tx)
        .await?;
    }

    if !batch.status.is_empty() {
        let rows = &batch.status;
        let device_ids: Vec<&str> = rows.iter().map(|s| s.device_id.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|s| s.timestamp).collect();
        let statuses: Vec<&str> = rows.iter().map(|s| s.status.as_str()).collect();

        sqlx::query(
            r#"
            INSERT INTO device_status (device_id, ts, status)
            SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::text[])
            "#,
        )
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&statuses)
        .execute(&mut *tx)
        .await?;
    }

    if !batch.pump_events.is_empty() {
        let rows = &batch.pump_events;
        let device_ids: Vec<&str> = rows.iter().map(|p| p.device_id.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|p| p.timestamp).collect();
        let actions: Vec<&str> = rows.iter().map(|p| p.action.as_str()).collect();
        let durations: Vec<Option<i64>> = rows.iter().map(|p| p.duration_ms).collect();

        sqlx::query(
            r#"
            INSERT INTO pump_events (device_id, ts, action, duration_ms)
            SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::text[], $4::int8[])
            "#,
        )
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&actions)
        .bind(&durations)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn query_telemetry(
    pool: &PgPool,
    device_id: Option<&str>,
    hours: u32,
    limit: usize,
) -> Result<Vec<TelemetryRecord>> {
    let rows = sqlx::query_as::<_, TelemetryRecord>(
        r#"
        SELECT device_id, ts AS timestamp, soil_mv, soil_pct, light_mv, light_pct,
               temp_c, humidity_pct, pump_running
        FROM irrigation_telemetry
        WHERE ts >= now() - make_interval(hours => $1)
          AND ($2::text IS NULL OR device_id = $2)
        ORDER BY ts DESC
        LIMIT $3
        "#,
    )
    .bind(hours as i32)
    .bind(device_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn query_status(
    pool: &PgPool,
    device_id: Option<&str>,
    hours: u32,
    limit: usize,
) -> Result<Vec<StatusRecord>> {
    let rows = sqlx::query_as::<_, StatusRecord>(
        r#"
        SELECT device_id, ts AS timestamp, status
        FROM device_status
        WHERE ts >= now() - make_interval(hours => $1)
          AND ($2::text IS NULL OR device_id = $2)
        ORDER BY ts DESC
        LIMIT $3
        "#,
    )
    .bind(hours as i32)
    .bind(device_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn query_pump_events(
    pool: &PgPool,
    device_id: Option<&str>,
    hours: u32,
    limit: usize,
) -> Result<Vec<PumpEventRecord>> {
    let rows = sqlx::query_as::<_, PumpEventRecord>(
        r#"
        SELECT device_id, ts AS timestamp, action, duration_ms
        FROM pump_events
        WHERE ts >= now() - make_interval(hours => $1)
          AND ($2::text IS NULL OR device_id = $2)
        ORDER BY ts ASC
        LIMIT $3
        "#,
    )
    .bind(hours as i32)
    .bind(device_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // connection-class SQLSTATEs
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PumpAction, TelemetryReading};

    #[test]
    fn test_batch_splits_records_by_table() {
        let now = Utc::now();
        let records = vec![
            Record::Telemetry {
                device_id: "DEV1".to_string(),
                reading: TelemetryReading {
                    soil_mv: Some(1200.0),
                    soil_pct: Some(42.0),
                    light_mv: None,
                    light_pct: None,
                    temp_c: Some(21.5),
                    humidity_pct: None,
                    pump_running: Some(false),
                    timestamp: now,
                },
            },
            Record::Status {
                device_id: "DEV1".to_string(),
                status: "online".to_string(),
                timestamp: now,
            },
            Record::PumpEvent {
                device_id: "DEV1".to_string(),
                action: PumpAction::Start,
                duration_ms: Some(3000),
                timestamp: now,
            },
        ];

        let batch = Batch::from_records(&records);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.telemetry[0].soil_pct, Some(42.0));
        assert_eq!(batch.telemetry[0].light_mv, None);
        assert_eq!(batch.status[0].status, "online");
        assert_eq!(batch.pump_events[0].action, "start");
        assert_eq!(batch.pump_events[0].duration_ms, Some(3000));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }
}
