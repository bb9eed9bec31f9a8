use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error, info};

use crate::error::SinkError;

/// One telemetry row. Metric and status events carry their value inline;
/// image events carry only a pointer to the stored blob.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseRow {
    pub device_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub reading: Option<f64>,
    pub status_code: Option<i32>,
    pub blob_ref: Option<String>,
    pub device_seq: Option<i64>,
}

/// Seam over the warehouse so routing logic is testable without Postgres.
#[async_trait]
pub trait WarehouseWriter: Send + Sync {
    async fn write_row(&self, row: &WarehouseRow) -> Result<(), SinkError>;
}

pub struct WarehouseSink {
    pool: PgPool,
    table: String,
}

impl WarehouseSink {
    pub async fn new(database_url: &str, table: String, max_connections: u32) -> Result<Self> {
        // The table name is spliced into SQL below; only accept a plain
        // (optionally schema-qualified) identifier.
        if !valid_table_name(&table) {
            bail!("invalid warehouse table name '{table}'");
        }
        info!(table, "connecting to warehouse");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to warehouse")?;
        info!(table, "warehouse connection established");
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl WarehouseWriter for WarehouseSink {
    async fn write_row(&self, row: &WarehouseRow) -> Result<(), SinkError> {
        // Upsert on the natural key so a redelivered message rewrites the
        // same row instead of duplicating it.
        let statement = format!(
            r#"
            INSERT INTO {} (device_id, event_type, occurred_at, reading, status_code, blob_ref, device_seq)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (device_id, event_type, occurred_at) DO UPDATE SET
                reading = EXCLUDED.reading,
                status_code = EXCLUDED.status_code,
                blob_ref = EXCLUDED.blob_ref,
                device_seq = EXCLUDED.device_seq
            "#,
            self.table
        );

        sqlx::query(&statement)
            .bind(&row.device_id)
            .bind(&row.event_type)
            .bind(row.occurred_at)
            .bind(row.reading)
            .bind(row.status_code)
            .bind(&row.blob_ref)
            .bind(row.device_seq)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(device_id = %row.device_id, error = ?e, "warehouse insert failed");
                classify_sqlx_error(e)
            })?;

        debug!(device_id = %row.device_id, event_type = %row.event_type, "warehouse row written");
        Ok(())
    }
}

fn valid_table_name(table: &str) -> bool {
    !table.is_empty()
        && table.split('.').all(|segment| {
            segment
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn classify_sqlx_error(e: sqlx::Error) -> SinkError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SinkError::Retryable(format!("warehouse unavailable: {e}")),
        other => SinkError::Terminal(format!("warehouse rejected row: {other}")),
    }
}
