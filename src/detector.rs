// ABOUTME: ChangeDetector - snapshot-diff change detection across monitored tables
// ABOUTME: Holds the last known snapshot per table and hands deltas to the replica sink

use std::time::Instant;

use crate::error::{ReplicationError, Result};
use crate::fingerprint;
use crate::model::{TableSchema, TableSnapshot, TableSpec};
use crate::replica::ReplicaSink;
use crate::source::{RowSource, SourceReader};

/// Lifecycle of a monitored table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// No baseline snapshot yet
    Uninitialized,
    /// Last cycle completed; the held snapshot matches the replica
    Synced,
    /// Last cycle failed; the held snapshot is the last applied one
    Error,
}

/// Outcome of one detection cycle (or of initialization, as cycle 0).
#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub tables_checked: usize,
    pub tables_changed: usize,
    pub rows_applied: usize,
    pub errors: Vec<ReplicationError>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Default::default()
        }
    }

    /// Check if every table completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

struct MonitoredTable {
    spec: TableSpec,
    schema: Option<TableSchema>,
    state: TableState,
    previous: Option<TableSnapshot>,
}

/// Detects changes in monitored tables by diffing consecutive snapshots.
///
/// Tables are processed one after another and fail independently. The held
/// snapshot of a table is replaced only after its delta was applied, so a
/// failed apply is retried in full on the next cycle.
pub struct ChangeDetector<S, W> {
    reader: SourceReader<S>,
    sink: W,
    tables: Vec<MonitoredTable>,
    cycle: u64,
}

impl<S: RowSource, W: ReplicaSink> ChangeDetector<S, W> {
    pub fn new(reader: SourceReader<S>, sink: W, tables: Vec<TableSpec>) -> Self {
        let tables = tables
            .into_iter()
            .map(|spec| MonitoredTable {
                spec,
                schema: None,
                state: TableState::Uninitialized,
                previous: None,
            })
            .collect();

        Self {
            reader,
            sink,
            tables,
            cycle: 0,
        }
    }

    /// Take a baseline snapshot of every table without emitting changes.
    ///
    /// Tables that fail stay `Uninitialized` and are baselined by the next
    /// call to [`detect_and_sync`](Self::detect_and_sync).
    pub async fn initialize(&mut self) -> CycleReport {
        let start = Instant::now();
        let mut report = CycleReport::new(0);

        for table in &mut self.tables {
            report.tables_checked += 1;
            if let Err(e) = baseline(&self.reader, &mut self.sink, table).await {
                tracing::error!("Failed to initialize table {}: {}", table.spec.name, e);
                report.errors.push(e);
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Initialized {}/{} table(s) in {}ms",
            report.tables_checked - report.errors.len(),
            report.tables_checked,
            report.duration_ms
        );
        report
    }

    /// Run one detection cycle over all monitored tables.
    pub async fn detect_and_sync(&mut self) -> CycleReport {
        self.cycle += 1;
        let start = Instant::now();
        let mut report = CycleReport::new(self.cycle);

        for table in &mut self.tables {
            report.tables_checked += 1;

            let result = if table.previous.is_none() {
                baseline(&self.reader, &mut self.sink, table)
                    .await
                    .map(|_| 0)
            } else {
                sync_table(&self.reader, &mut self.sink, table).await
            };

            match result {
                Ok(0) => {}
                Ok(applied) => {
                    report.tables_changed += 1;
                    report.rows_applied += applied;
                }
                Err(e) => {
                    tracing::error!("Failed to sync table {}: {}", table.spec.name, e);
                    if table.previous.is_some() {
                        table.state = TableState::Error;
                    }
                    report.errors.push(e);
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    pub fn table_state(&self, name: &str) -> Option<TableState> {
        self.find(name).map(|t| t.state)
    }

    /// The snapshot the next cycle will diff against.
    pub fn previous_snapshot(&self, name: &str) -> Option<&TableSnapshot> {
        self.find(name).and_then(|t| t.previous.as_ref())
    }

    pub fn monitored_tables(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.spec.name.as_str()).collect()
    }

    /// Number of detection cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn reader(&self) -> &SourceReader<S> {
        &self.reader
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn into_parts(self) -> (SourceReader<S>, W) {
        (self.reader, self.sink)
    }

    fn find(&self, name: &str) -> Option<&MonitoredTable> {
        self.tables.iter().find(|t| t.spec.name == name)
    }
}

/// Resolve the schema if needed, prepare the sink, and hold a first snapshot.
async fn baseline<S: RowSource, W: ReplicaSink>(
    reader: &SourceReader<S>,
    sink: &mut W,
    table: &mut MonitoredTable,
) -> Result<()> {
    let schema = match &table.schema {
        Some(schema) => schema.clone(),
        None => {
            let schema = reader.describe(&table.spec).await?;
            sink.prepare(&schema).await?;
            table.schema = Some(schema.clone());
            schema
        }
    };

    let snapshot = reader.snapshot(&schema).await?;
    tracing::info!(
        "Baseline for {}: {} rows (checksum {})",
        schema.name,
        snapshot.row_count,
        snapshot.checksum
    );

    table.previous = Some(snapshot);
    table.state = TableState::Synced;
    Ok(())
}

/// Diff a fresh snapshot against the held one and apply the delta.
///
/// Returns the number of rows applied.
async fn sync_table<S: RowSource, W: ReplicaSink>(
    reader: &SourceReader<S>,
    sink: &mut W,
    table: &mut MonitoredTable,
) -> Result<usize> {
    let (Some(schema), Some(previous)) = (&table.schema, &table.previous) else {
        return Err(ReplicationError::validation(
            &table.spec.name,
            "table has no baseline snapshot",
        ));
    };

    let current = reader.snapshot(schema).await?;
    let delta = fingerprint::diff(previous, &current)?;

    if delta.is_empty() {
        tracing::debug!("No changes in {}", schema.name);
        table.previous = Some(current);
        table.state = TableState::Synced;
        return Ok(0);
    }

    tracing::info!(
        "Detected changes in {}: {} inserted, {} updated, {} deleted",
        schema.name,
        delta.inserted.len(),
        delta.updated.len(),
        delta.deleted.len()
    );

    let applied = sink.apply(schema, &delta, &current.checksum).await?;

    table.previous = Some(current);
    table.state = TableState::Synced;
    Ok(applied.total())
}
