// ABOUTME: In-memory primary and replica stores for replication tests
// ABOUTME: Both are cloneable handles over shared state with failure injection

#![allow(dead_code)]

use async_trait::async_trait;
use cdc_replicator::error::{ReplicationError, Result};
use cdc_replicator::model::{row_key, ColumnValue, Delta, Operation, Row, RowKey, TableSchema, TableSpec};
use cdc_replicator::replica::{AppliedChanges, ReplicaSink};
use cdc_replicator::source::{FetchError, RowSource};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct SourceState {
    columns: HashMap<String, Vec<String>>,
    rows: HashMap<String, Vec<Row>>,
    /// Remaining transient failures per table
    outages: HashMap<String, u32>,
    fetches: HashMap<String, u32>,
}

/// Primary store backed by per-table row vectors.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, columns: &[&str], rows: Vec<Row>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.columns.insert(
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
            state.rows.insert(table.to_string(), rows);
        }
        self
    }

    pub fn insert(&self, table: &str, row: Row) {
        let mut state = self.state.lock().unwrap();
        state.rows.entry(table.to_string()).or_default().push(row);
    }

    pub fn update(&self, table: &str, id: i64, column: &str, value: ColumnValue) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.rows.get_mut(table) {
            for row in rows.iter_mut() {
                if row.get("id") == Some(&ColumnValue::Int(id)) {
                    row.insert(column.to_string(), value.clone());
                }
            }
        }
    }

    pub fn delete(&self, table: &str, id: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.rows.get_mut(table) {
            rows.retain(|row| row.get("id") != Some(&ColumnValue::Int(id)));
        }
    }

    /// Make the next `attempts` reads of `table` fail transiently.
    pub fn fail_reads(&self, table: &str, attempts: u32) {
        let mut state = self.state.lock().unwrap();
        state.outages.insert(table.to_string(), attempts);
    }

    pub fn fetch_count(&self, table: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.fetches.get(table).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn describe(&self, spec: &TableSpec) -> std::result::Result<TableSchema, FetchError> {
        let state = self.state.lock().unwrap();
        let columns = state
            .columns
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| FetchError::Fatal(anyhow::anyhow!("Table '{}' doesn't exist", spec.name)))?;
        TableSchema::new(&spec.name, spec.primary_key(), columns).map_err(|e| FetchError::Fatal(e.into()))
    }

    async fn fetch_rows(&self, schema: &TableSchema) -> std::result::Result<Vec<Row>, FetchError> {
        let mut state = self.state.lock().unwrap();
        *state.fetches.entry(schema.name.clone()).or_default() += 1;

        if let Some(remaining) = state.outages.get_mut(&schema.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transient(anyhow::anyhow!(
                    "Lost connection to MySQL server during query"
                )));
            }
        }

        state
            .rows
            .get(&schema.name)
            .cloned()
            .ok_or_else(|| FetchError::Fatal(anyhow::anyhow!("Table '{}' doesn't exist", schema.name)))
    }
}

/// A replicated row with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub row: Row,
    pub operation: Operation,
    pub checksum: String,
}

/// Sync bookkeeping kept by the in-memory replica.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub row_count: usize,
    pub last_checksum: String,
    pub status: String,
    pub successful_syncs: u32,
}

#[derive(Default)]
struct ReplicaState {
    tables: HashMap<String, BTreeMap<RowKey, ReplicaRecord>>,
    sync_status: HashMap<String, StatusRecord>,
    prepared: Vec<String>,
    /// Fail the next apply after writing this many rows
    fail_after_rows: Option<usize>,
    applies: u32,
}

/// Replica store with transactional apply semantics.
#[derive(Clone, Default)]
pub struct MemoryReplica {
    state: Arc<Mutex<ReplicaState>>,
}

impl MemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `rows` as if an earlier cycle had inserted them.
    pub fn seed(&self, table: &str, rows: &[Row], checksum: &str) {
        let mut state = self.state.lock().unwrap();
        let records = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = row_key(row, "id").unwrap();
            records.insert(
                key,
                ReplicaRecord {
                    row: row.clone(),
                    operation: Operation::Insert,
                    checksum: checksum.to_string(),
                },
            );
        }
    }

    /// Abort the next apply once `rows` rows have been written.
    pub fn fail_next_apply_after(&self, rows: usize) {
        self.state.lock().unwrap().fail_after_rows = Some(rows);
    }

    pub fn record(&self, table: &str, id: i64) -> Option<ReplicaRecord> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|records| records.get(&id.to_string()))
            .cloned()
    }

    pub fn records(&self, table: &str) -> BTreeMap<RowKey, ReplicaRecord> {
        let state = self.state.lock().unwrap();
        state.tables.get(table).cloned().unwrap_or_default()
    }

    pub fn sync_status(&self, table: &str) -> Option<StatusRecord> {
        self.state.lock().unwrap().sync_status.get(table).cloned()
    }

    pub fn prepared(&self) -> Vec<String> {
        self.state.lock().unwrap().prepared.clone()
    }

    pub fn apply_count(&self) -> u32 {
        self.state.lock().unwrap().applies
    }
}

#[async_trait]
impl ReplicaSink for MemoryReplica {
    async fn prepare(&mut self, schema: &TableSchema) -> Result<()> {
        self.state.lock().unwrap().prepared.push(schema.name.clone());
        Ok(())
    }

    async fn apply(&mut self, schema: &TableSchema, delta: &Delta, checksum: &str) -> Result<AppliedChanges> {
        let mut state = self.state.lock().unwrap();
        state.applies += 1;
        let fail_after = state.fail_after_rows.take();

        // Work on a copy; only a fully successful apply replaces the table.
        let mut staged = state.tables.get(&schema.name).cloned().unwrap_or_default();
        for (written, (operation, row)) in delta.tagged_rows().enumerate() {
            if fail_after == Some(written) {
                return Err(ReplicationError::replica_apply(
                    &schema.name,
                    anyhow::anyhow!("server closed the connection unexpectedly"),
                ));
            }
            let key = row_key(row, &schema.primary_key)?;
            staged.insert(
                key,
                ReplicaRecord {
                    row: row.clone(),
                    operation,
                    checksum: checksum.to_string(),
                },
            );
        }

        let applied = AppliedChanges::for_delta(delta);
        let successful_syncs = state
            .sync_status
            .get(&schema.name)
            .map_or(0, |s| s.successful_syncs)
            + 1;
        state.tables.insert(schema.name.clone(), staged);
        state.sync_status.insert(
            schema.name.clone(),
            StatusRecord {
                row_count: applied.total(),
                last_checksum: checksum.to_string(),
                status: "SUCCESS".to_string(),
                successful_syncs,
            },
        );
        Ok(applied)
    }
}

pub fn student(id: i64, name: &str, email: &str) -> Row {
    cdc_replicator::model::row([
        ("id", ColumnValue::Int(id)),
        ("name", ColumnValue::from(name)),
        ("email", ColumnValue::from(email)),
    ])
}

pub fn course(id: i64, title: &str) -> Row {
    cdc_replicator::model::row([("id", ColumnValue::Int(id)), ("title", ColumnValue::from(title))])
}

pub const STUDENT_COLUMNS: [&str; 3] = ["id", "name", "email"];
pub const COURSE_COLUMNS: [&str; 2] = ["id", "title"];
