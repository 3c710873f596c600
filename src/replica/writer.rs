// ABOUTME: PostgresReplicaWriter - applies deltas to the replica change log
// ABOUTME: One transaction per table: batched INSERT ... ON CONFLICT DO UPDATE plus sync_status

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::convert::{to_sql_param, SqlParam};
use super::status::{self, build_sync_status_upsert};
use super::{AppliedChanges, ReplicaSink};
use crate::error::{ReplicationError, Result};
use crate::model::{
    Delta, SyncStatus, TableSchema, CDC_CHECKSUM_COLUMN, CDC_OPERATION_COLUMN,
    CDC_TIMESTAMP_COLUMN,
};
use crate::postgres::{self, TlsPolicy};
use crate::utils::{quote_ident, validate_identifier};

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

/// Writes deltas into `<replica_schema>.<table>` shadow tables.
///
/// Every source column is copied, plus `cdc_operation` (I/U/D),
/// `cdc_timestamp` and `cdc_checksum`. Deletes are soft: the last known row is
/// upserted with operation `D`.
pub struct PostgresReplicaWriter {
    client: Client,
    reconnect: Option<(String, TlsPolicy)>,
    replica_schema: String,
    batch_size: usize,
    /// Replica column name to `information_schema` data type, per table
    column_types: HashMap<String, HashMap<String, String>>,
}

impl PostgresReplicaWriter {
    /// Wrap an existing connection. A closed connection is not reopened.
    pub fn new(
        client: Client,
        replica_schema: impl Into<String>,
        batch_size: usize,
    ) -> anyhow::Result<Self> {
        let replica_schema = replica_schema.into();
        validate_identifier(&replica_schema).context("Invalid replica schema name")?;
        if batch_size == 0 {
            bail!("Batch size must be at least 1");
        }

        Ok(Self {
            client,
            reconnect: None,
            replica_schema,
            batch_size,
            column_types: HashMap::new(),
        })
    }

    /// Connect with startup retry; the writer reconnects to `url` if the
    /// connection drops later.
    pub async fn connect(
        url: &str,
        tls: TlsPolicy,
        replica_schema: impl Into<String>,
        batch_size: usize,
    ) -> anyhow::Result<Self> {
        let client = postgres::connect_with_retry(url, tls).await?;
        let mut writer = Self::new(client, replica_schema, batch_size)?;
        writer.reconnect = Some((url.to_string(), tls));
        Ok(writer)
    }

    /// Get a reference to the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn replica_schema(&self) -> &str {
        &self.replica_schema
    }

    /// Create the replica schema and sync_status table if missing.
    pub async fn ensure_sync_status_table(&mut self) -> anyhow::Result<()> {
        self.ensure_connected().await?;
        status::ensure_sync_status_table(&self.client, &self.replica_schema).await
    }

    /// Read all persisted sync status rows.
    pub async fn load_sync_status(&mut self) -> anyhow::Result<Vec<SyncStatus>> {
        self.ensure_connected().await?;
        status::load_sync_status(&self.client, &self.replica_schema).await
    }

    async fn ensure_connected(&mut self) -> anyhow::Result<()> {
        if !self.client.is_closed() {
            return Ok(());
        }
        match &self.reconnect {
            Some((url, tls)) => {
                tracing::warn!("Replica connection closed, reconnecting");
                self.client = postgres::connect(url, *tls).await?;
                Ok(())
            }
            None => bail!("Replica connection is closed"),
        }
    }

    async fn load_column_types(&mut self, schema: &TableSchema) -> anyhow::Result<()> {
        self.ensure_connected().await?;

        let columns = get_table_columns(&self.client, &self.replica_schema, &schema.name).await?;
        if columns.is_empty() {
            bail!(
                "Replica table {}.{} does not exist",
                self.replica_schema,
                schema.name
            );
        }

        let types: HashMap<String, String> = columns.into_iter().collect();
        let missing: Vec<&str> = schema
            .columns
            .iter()
            .map(String::as_str)
            .chain([
                CDC_OPERATION_COLUMN,
                CDC_TIMESTAMP_COLUMN,
                CDC_CHECKSUM_COLUMN,
            ])
            .filter(|column| !types.contains_key(*column))
            .collect();
        if !missing.is_empty() {
            bail!(
                "Replica table {}.{} is missing column(s): {}",
                self.replica_schema,
                schema.name,
                missing.join(", ")
            );
        }

        tracing::debug!(
            "Prepared replica table {}.{} ({} columns)",
            self.replica_schema,
            schema.name,
            types.len()
        );
        self.column_types.insert(schema.name.clone(), types);
        Ok(())
    }

    async fn write_delta(
        &mut self,
        schema: &TableSchema,
        delta: &Delta,
        checksum: &str,
    ) -> anyhow::Result<AppliedChanges> {
        self.ensure_connected().await?;

        let types = self
            .column_types
            .get(&schema.name)
            .ok_or_else(|| anyhow!("Replica table {} was not prepared", schema.name))?;

        // Data columns, then cdc_operation and cdc_checksum.
        let params_per_row = schema.columns.len() + 2;
        let rows_per_statement = self
            .batch_size
            .min(MAX_PARAMS / params_per_row)
            .max(1);

        let tagged: Vec<_> = delta.tagged_rows().collect();
        let applied = AppliedChanges::for_delta(delta);

        let tx = self
            .client
            .transaction()
            .await
            .context("Failed to begin replica transaction")?;

        for chunk in tagged.chunks(rows_per_statement) {
            let query = build_upsert_query(&self.replica_schema, schema, chunk.len());

            let mut values: Vec<SqlParam> = Vec::with_capacity(chunk.len() * params_per_row);
            for (operation, row) in chunk {
                for column in &schema.columns {
                    let value = row
                        .get(column)
                        .ok_or_else(|| anyhow!("Row is missing column '{}'", column))?;
                    let data_type = types
                        .get(column)
                        .ok_or_else(|| anyhow!("No replica type for column '{}'", column))?;
                    values.push(
                        to_sql_param(value, data_type)
                            .with_context(|| format!("Column '{}'", column))?,
                    );
                }
                values.push(Box::new(operation.tag().to_string()));
                values.push(Box::new(checksum.to_string()));
            }

            let params: Vec<&(dyn ToSql + Sync)> = values
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();

            tx.execute(&query, &params).await.with_context(|| {
                format!(
                    "Failed to upsert batch into {}.{}",
                    self.replica_schema, schema.name
                )
            })?;
        }

        let row_count = applied.total() as i64;
        tx.execute(
            &build_sync_status_upsert(&self.replica_schema),
            &[&schema.name, &row_count, &checksum],
        )
        .await
        .context("Failed to update sync status")?;

        tx.commit()
            .await
            .context("Failed to commit replica transaction")?;

        Ok(applied)
    }
}

#[async_trait]
impl ReplicaSink for PostgresReplicaWriter {
    async fn prepare(&mut self, schema: &TableSchema) -> Result<()> {
        self.load_column_types(schema)
            .await
            .map_err(|e| ReplicationError::replica_apply(&schema.name, e))
    }

    async fn apply(
        &mut self,
        schema: &TableSchema,
        delta: &Delta,
        checksum: &str,
    ) -> Result<AppliedChanges> {
        let applied = self
            .write_delta(schema, delta, checksum)
            .await
            .map_err(|e| ReplicationError::replica_apply(&schema.name, e))?;

        tracing::info!(
            "Applied {} change(s) to {}.{}: {} inserted, {} updated, {} deleted",
            applied.total(),
            self.replica_schema,
            schema.name,
            applied.inserted,
            applied.updated,
            applied.deleted
        );
        Ok(applied)
    }
}

/// Build a multi-row upsert into a replica shadow table.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "cdc"."student" ("id", "name", "cdc_operation", "cdc_checksum", "cdc_timestamp")
/// VALUES ($1, $2, $3::text, $4::text, CURRENT_TIMESTAMP), ...
/// ON CONFLICT ("id") DO UPDATE SET
///   "name" = EXCLUDED."name",
///   "cdc_operation" = EXCLUDED."cdc_operation", ...
/// ```
fn build_upsert_query(replica_schema: &str, table: &TableSchema, num_rows: usize) -> String {
    let mut quoted_columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    quoted_columns.extend(
        [
            CDC_OPERATION_COLUMN,
            CDC_CHECKSUM_COLUMN,
            CDC_TIMESTAMP_COLUMN,
        ]
        .iter()
        .map(|c| quote_ident(c)),
    );

    // Bound parameters per row; cdc_timestamp is set by the server.
    let num_params = table.columns.len() + 2;
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let base = row_idx * num_params;
            let mut placeholders: Vec<String> = (0..table.columns.len())
                .map(|col_idx| format!("${}", base + col_idx + 1))
                .collect();
            placeholders.push(format!("${}::text", base + num_params - 1));
            placeholders.push(format!("${}::text", base + num_params));
            placeholders.push("CURRENT_TIMESTAMP".to_string());
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = table
        .columns
        .iter()
        .map(String::as_str)
        .filter(|c| *c != table.primary_key)
        .chain([
            CDC_OPERATION_COLUMN,
            CDC_CHECKSUM_COLUMN,
            CDC_TIMESTAMP_COLUMN,
        ])
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {}",
        quote_ident(replica_schema),
        quote_ident(&table.name),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quote_ident(&table.primary_key),
        update_columns.join(", ")
    )
}

/// Column names and data types of a replica table, in ordinal order.
async fn get_table_columns(
    client: &Client,
    schema: &str,
    table: &str,
) -> anyhow::Result<Vec<(String, String)>> {
    let rows = client
        .query(
            "SELECT column_name::text, data_type::text
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2
             ORDER BY ordinal_position",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let dtype: String = row.get(1);
            (name, dtype)
        })
        .collect())
}
