// ABOUTME: Data model for snapshot-diff replication
// ABOUTME: Rows, column values, table schemas, snapshots, deltas, and sync status records

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{ReplicationError, Result};

/// Default primary key column for monitored tables.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// A single scalar value read from the primary store.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// MySQL TIME values can exceed 24 hours, so they are kept as text.
    Time(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Canonical string form used for fingerprinting and key comparison.
    ///
    /// Returns `Ok(None)` for NULL so it never collides with a string value.
    /// Non-finite floats have no stable textual form and are rejected.
    pub fn as_canonical_text(&self) -> std::result::Result<Option<String>, String> {
        let text = match self {
            ColumnValue::Null => return Ok(None),
            ColumnValue::Int(i) => i.to_string(),
            ColumnValue::UInt(u) => u.to_string(),
            ColumnValue::Float(f) => {
                if !f.is_finite() {
                    return Err(format!("non-finite float {} has no canonical form", f));
                }
                f.to_string()
            }
            ColumnValue::Text(s) | ColumnValue::Time(s) => s.clone(),
            ColumnValue::Bytes(b) => base64::engine::general_purpose::STANDARD.encode(b),
            ColumnValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            ColumnValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        };
        Ok(Some(text))
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_canonical_text() {
            Ok(Some(text)) => write!(f, "{}", text),
            Ok(None) => write!(f, "NULL"),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Int(value)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<f64> for ColumnValue {
    fn from(value: f64) -> Self {
        ColumnValue::Float(value)
    }
}

/// A row snapshot: column name to value, ordered by column name.
pub type Row = BTreeMap<String, ColumnValue>;

/// Canonical text of a row's primary key value.
pub type RowKey = String;

/// Build a row from `(column, value)` pairs.
pub fn row<I, K, V>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ColumnValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Extract the primary key of a row.
pub fn row_key(row: &Row, primary_key: &str) -> Result<RowKey> {
    match row.get(primary_key) {
        None => Err(ReplicationError::validation(
            "",
            format!("row is missing primary key column '{}'", primary_key),
        )),
        Some(value) => match value.as_canonical_text() {
            Ok(Some(key)) => Ok(key),
            Ok(None) => Err(ReplicationError::validation(
                "",
                format!("row has NULL primary key '{}'", primary_key),
            )),
            Err(message) => Err(ReplicationError::validation("", message)),
        },
    }
}

/// Where a monitored table's definition comes from before it is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Explicit column list; discovered from the source when absent.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: None,
            columns: None,
        }
    }

    pub fn primary_key(&self) -> &str {
        self.primary_key.as_deref().unwrap_or(DEFAULT_PRIMARY_KEY)
    }
}

/// Resolved, validated column schema of a monitored table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Build a schema, validating every identifier and the primary key.
    pub fn new(
        name: impl Into<String>,
        primary_key: impl Into<String>,
        columns: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        let primary_key = primary_key.into();

        crate::utils::validate_identifier(&name)
            .map_err(|e| ReplicationError::validation(&name, format!("{:#}", e)))?;
        if columns.is_empty() {
            return Err(ReplicationError::validation(&name, "table has no columns"));
        }
        for column in &columns {
            crate::utils::validate_identifier(column)
                .map_err(|e| ReplicationError::validation(&name, format!("{:#}", e)))?;
            if is_cdc_column(column) {
                return Err(ReplicationError::validation(
                    &name,
                    format!("column '{}' collides with a replica bookkeeping column", column),
                ));
            }
        }
        if !columns.contains(&primary_key) {
            return Err(ReplicationError::validation(
                &name,
                format!("primary key '{}' is not one of the table columns", primary_key),
            ));
        }

        Ok(Self {
            name,
            primary_key,
            columns,
        })
    }
}

/// Replica bookkeeping columns appended to every replicated row.
pub const CDC_OPERATION_COLUMN: &str = "cdc_operation";
pub const CDC_TIMESTAMP_COLUMN: &str = "cdc_timestamp";
pub const CDC_CHECKSUM_COLUMN: &str = "cdc_checksum";

pub fn is_cdc_column(column: &str) -> bool {
    matches!(
        column,
        CDC_OPERATION_COLUMN | CDC_TIMESTAMP_COLUMN | CDC_CHECKSUM_COLUMN
    )
}

/// A full read of one table at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub table_name: String,
    pub row_count: usize,
    pub checksum: String,
    pub rows: BTreeMap<RowKey, Row>,
}

impl TableSnapshot {
    /// Key the rows of a fresh read and compute the table checksum.
    pub fn from_rows(schema: &TableSchema, rows: Vec<Row>) -> Result<Self> {
        let checksum =
            crate::fingerprint::table_fingerprint(&rows).map_err(|e| e.for_table(&schema.name))?;

        let mut keyed = BTreeMap::new();
        for row in rows {
            let key = row_key(&row, &schema.primary_key).map_err(|e| e.for_table(&schema.name))?;
            if keyed.insert(key.clone(), row).is_some() {
                return Err(ReplicationError::validation(
                    &schema.name,
                    format!("duplicate primary key '{}' in snapshot", key),
                ));
            }
        }

        Ok(Self {
            table_name: schema.name.clone(),
            row_count: keyed.len(),
            checksum,
            rows: keyed,
        })
    }
}

/// Table metadata as reported by the source reader.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    pub row_count: usize,
    pub checksum: String,
    pub rows: Vec<Row>,
}

impl From<TableSnapshot> for TableMetadata {
    fn from(snapshot: TableSnapshot) -> Self {
        Self {
            row_count: snapshot.row_count,
            checksum: snapshot.checksum,
            rows: snapshot.rows.into_values().collect(),
        }
    }
}

/// Classified difference between two snapshots of the same table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub inserted: Vec<Row>,
    pub updated: Vec<Row>,
    pub deleted: Vec<Row>,
}

impl Delta {
    pub fn total(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// All rows paired with the operation they are replicated as.
    pub fn tagged_rows(&self) -> impl Iterator<Item = (Operation, &Row)> {
        self.inserted
            .iter()
            .map(|r| (Operation::Insert, r))
            .chain(self.updated.iter().map(|r| (Operation::Update, r)))
            .chain(self.deleted.iter().map(|r| (Operation::Delete, r)))
    }
}

/// Change operation recorded in the replica's `cdc_operation` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::Insert => "I",
            Operation::Update => "U",
            Operation::Delete => "D",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "I" => Some(Operation::Insert),
            "U" => Some(Operation::Update),
            "D" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Status value written after a successful apply.
pub const SYNC_STATUS_SUCCESS: &str = "SUCCESS";

/// Per-table sync bookkeeping persisted in the replica's `sync_status` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub table_name: String,
    pub last_sync_time: DateTime<Utc>,
    pub last_success_sync_time: Option<DateTime<Utc>>,
    /// Number of changes applied in the last successful cycle
    pub row_count: i64,
    pub last_checksum: String,
    pub status: String,
}

impl SyncStatus {
    /// Time since the last successful sync. `None` if it never succeeded.
    pub fn lag(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_success_sync_time
            .map(|t| (now - t).to_std().unwrap_or(Duration::ZERO))
    }

    /// True when the table has not synced successfully within `max_lag`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_lag: Duration) -> bool {
        match self.lag(now) {
            Some(lag) => lag > max_lag,
            None => true,
        }
    }
}
