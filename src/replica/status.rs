// ABOUTME: sync_status bookkeeping table in the replica schema
// ABOUTME: Bootstrap DDL, the per-apply upsert statement, and status reads

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_postgres::Client;

use crate::model::{SyncStatus, SYNC_STATUS_SUCCESS};
use crate::utils::{quote_ident, validate_identifier};

pub const SYNC_STATUS_TABLE: &str = "sync_status";

fn qualified(schema: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(SYNC_STATUS_TABLE))
}

/// Create the replica schema and the `sync_status` table if missing.
pub async fn ensure_sync_status_table(client: &Client, schema: &str) -> Result<()> {
    validate_identifier(schema).context("Invalid replica schema name")?;

    client
        .batch_execute(&create_sync_status_sql(schema))
        .await
        .with_context(|| format!("Failed to create {}", qualified(schema)))?;

    tracing::debug!("Ensured {} exists", qualified(schema));
    Ok(())
}

/// Whether the `sync_status` table exists, without creating it.
pub async fn sync_status_exists(client: &Client, schema: &str) -> Result<bool> {
    validate_identifier(schema).context("Invalid replica schema name")?;

    let row = client
        .query_one("SELECT to_regclass($1) IS NOT NULL", &[&qualified(schema)])
        .await
        .with_context(|| format!("Failed to look up {}", qualified(schema)))?;
    Ok(row.try_get(0)?)
}

/// Read every sync status row, ordered by table name.
pub async fn load_sync_status(client: &Client, schema: &str) -> Result<Vec<SyncStatus>> {
    validate_identifier(schema).context("Invalid replica schema name")?;

    let query = format!(
        "SELECT table_name::text, last_sync_time::timestamptz, \
         last_success_sync_time::timestamptz, row_count::bigint, \
         last_checksum::text, status::text \
         FROM {} ORDER BY table_name",
        qualified(schema)
    );
    let rows = client
        .query(&query, &[])
        .await
        .with_context(|| format!("Failed to read {}", qualified(schema)))?;

    rows.iter()
        .map(|row| -> Result<SyncStatus> {
            Ok(SyncStatus {
                table_name: row.try_get(0)?,
                last_sync_time: row.try_get(1)?,
                last_success_sync_time: row.try_get(2)?,
                row_count: row.try_get(3)?,
                last_checksum: row.try_get::<_, Option<String>>(4)?.unwrap_or_default(),
                status: row.try_get(5)?,
            })
        })
        .collect()
}

/// Monitored tables whose last successful sync is older than `max_lag`.
///
/// A table without a status row has never synced and counts as stale.
/// Status rows are only written by cycles that apply changes, so a table
/// with no writes on the primary within `max_lag` is stale as well.
pub fn stale_tables<'a>(
    statuses: &[SyncStatus],
    tables: &[&'a str],
    now: DateTime<Utc>,
    max_lag: Duration,
) -> Vec<&'a str> {
    tables
        .iter()
        .copied()
        .filter(|table| {
            statuses
                .iter()
                .find(|s| s.table_name == *table)
                .map_or(true, |s| s.is_stale(now, max_lag))
        })
        .collect()
}

pub(crate) fn create_sync_status_sql(schema: &str) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema};
         CREATE TABLE IF NOT EXISTS {table} (
             table_name VARCHAR(100) PRIMARY KEY,
             last_sync_time TIMESTAMP WITH TIME ZONE NOT NULL,
             last_success_sync_time TIMESTAMP WITH TIME ZONE,
             row_count BIGINT NOT NULL DEFAULT 0,
             last_checksum VARCHAR(64),
             status VARCHAR(20) NOT NULL
         );",
        schema = quote_ident(schema),
        table = qualified(schema),
    )
}

/// Upsert of one table's status after a successful apply.
///
/// Parameters: `$1` table name, `$2` changes applied, `$3` table checksum.
/// Casts keep the statement valid against a pre-existing table whose
/// columns use narrower types.
pub(crate) fn build_sync_status_upsert(schema: &str) -> String {
    format!(
        "INSERT INTO {} \
         (table_name, last_sync_time, last_success_sync_time, row_count, last_checksum, status) \
         VALUES ($1::text, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP, $2::bigint, $3::text, '{}') \
         ON CONFLICT (table_name) DO UPDATE SET \
         last_sync_time = EXCLUDED.last_sync_time, \
         last_success_sync_time = EXCLUDED.last_success_sync_time, \
         row_count = EXCLUDED.row_count, \
         last_checksum = EXCLUDED.last_checksum, \
         status = EXCLUDED.status",
        qualified(schema),
        SYNC_STATUS_SUCCESS
    )
}
