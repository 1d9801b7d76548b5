//! Database sink
//!
//! Persists readings into `readings` and `indicator_readings` on SQLite or
//! PostgreSQL. Tables and the compound (camera, source, timestamp) indexes
//! are created on start. A retention task deletes rows older than
//! `retention_days` once per hour.

use crate::config::{DatabaseExportConfig, DatabaseKind};
use crate::error::Result;
use crate::export::queue::BoundedQueue;
use crate::models::ReadingEvent;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connection pool size; two connections cover the insert path plus the
/// retention sweep.
const POOL_SIZE: u32 = 2;
/// Per-query timeout
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Retention sweep interval
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Concrete pool per backend
#[derive(Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl DbPool {
    /// Connect according to the sink configuration.
    pub async fn connect(config: &DatabaseExportConfig) -> Result<Self> {
        match config.kind {
            DatabaseKind::Sqlite => {
                let options = SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(POOL_SIZE)
                    .acquire_timeout(QUERY_TIMEOUT)
                    .connect_with(options)
                    .await?;
                Ok(DbPool::Sqlite(pool))
            }
            DatabaseKind::Postgresql => {
                let pool = PgPoolOptions::new()
                    .max_connections(POOL_SIZE)
                    .acquire_timeout(QUERY_TIMEOUT)
                    .connect(&config.connection_string)
                    .await?;
                Ok(DbPool::Postgres(pool))
            }
        }
    }

    /// Create tables and compound indexes when absent.
    pub async fn init_schema(&self) -> Result<()> {
        match self {
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS readings (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        camera_id VARCHAR(64) NOT NULL,
                        meter_id VARCHAR(64) NOT NULL,
                        value FLOAT NULL,
                        raw_text VARCHAR(32) NOT NULL,
                        timestamp DATETIME NOT NULL,
                        confidence FLOAT NOT NULL
                    )
                    "#,
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS indicator_readings (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        camera_id VARCHAR(64) NOT NULL,
                        indicator_id VARCHAR(64) NOT NULL,
                        state BOOLEAN NOT NULL,
                        brightness FLOAT NOT NULL,
                        timestamp DATETIME NOT NULL
                    )
                    "#,
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_camera_meter_time \
                     ON readings (camera_id, meter_id, timestamp)",
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_camera_indicator_time \
                     ON indicator_readings (camera_id, indicator_id, timestamp)",
                )
                .execute(pool)
                .await?;
            }
            DbPool::Postgres(pool) => {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS readings (
                        id BIGSERIAL PRIMARY KEY,
                        camera_id VARCHAR(64) NOT NULL,
                        meter_id VARCHAR(64) NOT NULL,
                        value DOUBLE PRECISION NULL,
                        raw_text VARCHAR(32) NOT NULL,
                        timestamp TIMESTAMPTZ NOT NULL,
                        confidence DOUBLE PRECISION NOT NULL
                    )
                    "#,
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS indicator_readings (
                        id BIGSERIAL PRIMARY KEY,
                        camera_id VARCHAR(64) NOT NULL,
                        indicator_id VARCHAR(64) NOT NULL,
                        state BOOLEAN NOT NULL,
                        brightness DOUBLE PRECISION NOT NULL,
                        timestamp TIMESTAMPTZ NOT NULL
                    )
                    "#,
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_camera_meter_time \
                     ON readings (camera_id, meter_id, timestamp)",
                )
                .execute(pool)
                .await?;
                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_camera_indicator_time \
                     ON indicator_readings (camera_id, indicator_id, timestamp)",
                )
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Insert one reading or indicator reading.
    pub async fn insert(&self, event: &ReadingEvent) -> Result<()> {
        match (self, event) {
            (DbPool::Sqlite(pool), ReadingEvent::Meter(r)) => {
                sqlx::query(
                    "INSERT INTO readings (camera_id, meter_id, value, raw_text, timestamp, confidence) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&r.camera_id)
                .bind(&r.meter_id)
                .bind(r.value)
                .bind(&r.raw_text)
                .bind(r.timestamp)
                .bind(r.confidence)
                .execute(pool)
                .await?;
            }
            (DbPool::Sqlite(pool), ReadingEvent::Indicator(r)) => {
                sqlx::query(
                    "INSERT INTO indicator_readings (camera_id, indicator_id, state, brightness, timestamp) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&r.camera_id)
                .bind(&r.indicator_id)
                .bind(r.state)
                .bind(r.score)
                .bind(r.timestamp)
                .execute(pool)
                .await?;
            }
            (DbPool::Postgres(pool), ReadingEvent::Meter(r)) => {
                sqlx::query(
                    "INSERT INTO readings (camera_id, meter_id, value, raw_text, timestamp, confidence) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&r.camera_id)
                .bind(&r.meter_id)
                .bind(r.value)
                .bind(&r.raw_text)
                .bind(r.timestamp)
                .bind(r.confidence)
                .execute(pool)
                .await?;
            }
            (DbPool::Postgres(pool), ReadingEvent::Indicator(r)) => {
                sqlx::query(
                    "INSERT INTO indicator_readings (camera_id, indicator_id, state, brightness, timestamp) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&r.camera_id)
                .bind(&r.indicator_id)
                .bind(r.state)
                .bind(r.score)
                .bind(r.timestamp)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Delete rows older than the retention cutoff from both tables.
    pub async fn prune(&self, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);

        let deleted = match self {
            DbPool::Sqlite(pool) => {
                let a = sqlx::query("DELETE FROM readings WHERE timestamp < ?")
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected();
                let b = sqlx::query("DELETE FROM indicator_readings WHERE timestamp < ?")
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected();
                a + b
            }
            DbPool::Postgres(pool) => {
                let a = sqlx::query("DELETE FROM readings WHERE timestamp < $1")
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected();
                let b = sqlx::query("DELETE FROM indicator_readings WHERE timestamp < $1")
                    .bind(cutoff)
                    .execute(pool)
                    .await?
                    .rows_affected();
                a + b
            }
        };
        Ok(deleted)
    }

    pub async fn close(&self) {
        match self {
            DbPool::Sqlite(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
        }
    }
}

pub fn spawn(
    config: DatabaseExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run(config, queue, stop))
}

async fn run(
    config: DatabaseExportConfig,
    queue: Arc<BoundedQueue<ReadingEvent>>,
    mut stop: watch::Receiver<bool>,
) {
    let pool = match DbPool::connect(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Database sink failed to connect");
            return;
        }
    };
    if let Err(e) = pool.init_schema().await {
        tracing::error!(error = %e, "Database sink failed to create schema");
        pool.close().await;
        return;
    }

    tracing::info!(kind = ?config.kind, "Database sink started");

    let mut retention = tokio::time::interval(RETENTION_INTERVAL);
    // First tick fires immediately; run the sweep right away on start
    loop {
        tokio::select! {
            event = queue.pop() => {
                match tokio::time::timeout(QUERY_TIMEOUT, pool.insert(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // Constraint violations are permanent: drop and move on
                        tracing::warn!(
                            camera_id = %event.camera_id(),
                            source_id = %event.source_id(),
                            error = %e,
                            "Database sink insert failed, dropping reading"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            camera_id = %event.camera_id(),
                            "Database sink insert timed out, dropping reading"
                        );
                    }
                }
            }
            _ = retention.tick() => {
                match pool.prune(config.retention_days).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted = deleted, retention_days = config.retention_days,
                            "Retention sweep removed old readings");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Retention sweep failed"),
                }
            }
            _ = stop.changed() => {
                // Drain what is already queued before closing
                while let Some(event) = queue.try_pop() {
                    if let Err(e) = pool.insert(&event).await {
                        tracing::warn!(error = %e, "Database sink drain insert failed");
                        break;
                    }
                }
                break;
            }
        }
    }

    pool.close().await;
    tracing::info!("Database sink stopped");
}
