// ABOUTME: MySQL implementation of RowSource over a mysql_async connection pool
// ABOUTME: Full-table reads with explicit column lists and transient/fatal error classification

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Value};
use std::time::Duration;

use super::reader::{FetchError, RowSource};
use crate::model::{ColumnValue, Row, TableSchema, TableSpec};
use crate::utils::quote_mysql_ident;

/// Connections are dropped and reopened after this long, regardless of use.
const CONNECTION_RECYCLE_AFTER: Duration = Duration::from_secs(3600);
/// Idle connections above the pool minimum are closed after this long.
const INACTIVE_CONNECTION_TTL: Duration = Duration::from_secs(300);

/// Server error codes that indicate a condition worth retrying.
///
/// 1040 too many connections, 1205 lock wait timeout, 1213 deadlock,
/// 2006 server has gone away, 2013 lost connection during query.
const TRANSIENT_SERVER_ERRORS: [u16; 5] = [1040, 1205, 1213, 2006, 2013];

/// Reads monitored tables from MySQL.
///
/// Owns a small connection pool; every checkout is pinged before use and
/// connections are recycled hourly.
pub struct MySqlSource {
    pool: Pool,
    database: String,
}

impl MySqlSource {
    /// Build the pool for `url` without touching the network.
    pub fn new(url: &str) -> Result<Self> {
        let opts = Opts::from_url(url).context("Invalid MySQL connection URL")?;
        let database = opts.db_name().unwrap_or_default().to_string();

        let constraints = PoolConstraints::new(1, 4).unwrap_or_default();
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_inactive_connection_ttl(INACTIVE_CONNECTION_TTL)
            .with_abs_conn_ttl(Some(CONNECTION_RECYCLE_AFTER));

        let pool = Pool::new(OptsBuilder::from_opts(opts).pool_opts(pool_opts));

        Ok(Self { pool, database })
    }

    /// Build the pool and verify the server answers a trivial query.
    pub async fn connect(url: &str) -> Result<Self> {
        let source = Self::new(url)?;
        let mut conn = source
            .pool
            .get_conn()
            .await
            .context("Failed to connect to MySQL")?;
        conn.query_drop("SELECT 1")
            .await
            .context("MySQL connection check failed")?;

        tracing::info!("Connected to MySQL database '{}'", source.database);
        Ok(source)
    }

    /// Database name from the connection URL.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Close all pooled connections.
    pub async fn disconnect(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .context("Failed to close MySQL pool")
    }

    /// Check out a pooled connection and make sure it is still alive.
    async fn checked_conn(&self) -> Result<Conn, FetchError> {
        let mut conn = self.pool.get_conn().await.map_err(classify_error)?;
        conn.ping().await.map_err(classify_error)?;
        Ok(conn)
    }

    async fn discover_columns(&self, conn: &mut Conn, table: &str) -> Result<Vec<String>, FetchError> {
        conn.exec(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (table,),
        )
        .await
        .map_err(classify_error)
    }

    async fn discover_primary_key(
        &self,
        conn: &mut Conn,
        table: &str,
    ) -> Result<Vec<String>, FetchError> {
        conn.exec(
            "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
            (table,),
        )
        .await
        .map_err(classify_error)
    }
}

#[async_trait]
impl RowSource for MySqlSource {
    async fn describe(&self, spec: &TableSpec) -> Result<TableSchema, FetchError> {
        let mut conn = self.checked_conn().await?;

        let columns = match &spec.columns {
            Some(columns) => columns.clone(),
            None => self.discover_columns(&mut conn, &spec.name).await?,
        };
        if columns.is_empty() {
            return Err(FetchError::Fatal(anyhow::anyhow!(
                "Table '{}' does not exist in MySQL database '{}'",
                spec.name,
                self.database
            )));
        }

        let primary_key = match &spec.primary_key {
            Some(pk) => pk.clone(),
            None => {
                let discovered = self.discover_primary_key(&mut conn, &spec.name).await?;
                match discovered.as_slice() {
                    [single] => single.clone(),
                    [] => spec.primary_key().to_string(),
                    _ => {
                        return Err(FetchError::Fatal(anyhow::anyhow!(
                            "Table '{}' has a composite primary key ({}); configure a single key column",
                            spec.name,
                            discovered.join(", ")
                        )))
                    }
                }
            }
        };

        TableSchema::new(&spec.name, primary_key, columns).map_err(|e| FetchError::Fatal(e.into()))
    }

    async fn fetch_rows(&self, schema: &TableSchema) -> Result<Vec<Row>, FetchError> {
        let mut conn = self.checked_conn().await?;
        let query = build_select_query(schema);

        // Binary protocol, so numeric and temporal columns arrive typed.
        let rows: Vec<mysql_async::Row> = conn.exec(query, ()).await.map_err(classify_error)?;

        rows.into_iter()
            .map(|row| convert_row(schema, row))
            .collect::<Result<Vec<_>>>()
            .map_err(FetchError::Fatal)
    }
}

/// Build the full-table read for a schema.
///
/// Columns are always listed explicitly so the read matches the validated
/// schema, even if the table grows new columns.
fn build_select_query(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| quote_mysql_ident(c))
        .collect();
    format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        quote_mysql_ident(&schema.name)
    )
}

fn convert_row(schema: &TableSchema, mut row: mysql_async::Row) -> Result<Row> {
    if row.len() != schema.columns.len() {
        anyhow::bail!(
            "Expected {} columns from {}, got {}",
            schema.columns.len(),
            schema.name,
            row.len()
        );
    }

    let column_types: Vec<ColumnType> = row
        .columns_ref()
        .iter()
        .map(|c| c.column_type())
        .collect();

    let mut converted = Row::new();
    for (idx, name) in schema.columns.iter().enumerate() {
        let value: Value = row.take(idx).unwrap_or(Value::NULL);
        converted.insert(name.clone(), convert_value(value, column_types[idx]));
    }
    Ok(converted)
}

/// Convert a MySQL wire value into a column value.
fn convert_value(value: Value, column_type: ColumnType) -> ColumnValue {
    match value {
        Value::NULL => ColumnValue::Null,
        Value::Int(i) => ColumnValue::Int(i),
        Value::UInt(u) => ColumnValue::UInt(u),
        // Go through the f32's shortest form so 0.1f32 stays "0.1".
        Value::Float(f) => ColumnValue::Float(f.to_string().parse().unwrap_or(f as f64)),
        Value::Double(d) => ColumnValue::Float(d),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => ColumnValue::Text(text),
            Err(e) => ColumnValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
            let is_date_column = matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE
            );
            match date {
                Some(date) if is_date_column => ColumnValue::Date(date),
                Some(date) => match date.and_hms_micro_opt(
                    hour as u32,
                    minute as u32,
                    second as u32,
                    micros,
                ) {
                    Some(dt) => ColumnValue::DateTime(dt),
                    None => ColumnValue::Text(format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                        year, month, day, hour, minute, second
                    )),
                },
                // MySQL zero dates ('0000-00-00') have no calendar equivalent.
                None => ColumnValue::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                )),
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = days * 24 + hours as u32;
            let sign = if negative { "-" } else { "" };
            let text = if micros > 0 {
                format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, total_hours, minutes, seconds, micros
                )
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
            };
            ColumnValue::Time(text)
        }
    }
}

/// Decide whether a MySQL error is worth retrying.
fn classify_error(err: mysql_async::Error) -> FetchError {
    let transient = match &err {
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => true,
        mysql_async::Error::Server(server) => TRANSIENT_SERVER_ERRORS.contains(&server.code),
        _ => false,
    };

    let cause = anyhow::Error::new(err);
    if transient {
        FetchError::Transient(cause)
    } else {
        FetchError::Fatal(cause)
    }
}
