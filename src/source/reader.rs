// ABOUTME: SourceReader for snapshot-diff sync - reads full table snapshots from the primary
// ABOUTME: Wraps a RowSource with an explicit bounded retry policy for transient failures

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ReplicationError, Result};
use crate::model::{Row, TableMetadata, TableSchema, TableSnapshot, TableSpec};

/// Outcome classification for a single read attempt against the primary.
#[derive(Debug)]
pub enum FetchError {
    /// Connectivity-style failure that may succeed on a later attempt.
    Transient(anyhow::Error),
    /// Failure that will not go away by retrying (missing table, bad SQL).
    Fatal(anyhow::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn into_cause(self) -> anyhow::Error {
        match self {
            FetchError::Transient(e) | FetchError::Fatal(e) => e,
        }
    }
}

/// A primary store that can describe and fully read monitored tables.
///
/// Implementations make exactly one attempt per call; retrying is the
/// reader's job.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Resolve the explicit column list of a monitored table.
    async fn describe(&self, spec: &TableSpec) -> std::result::Result<TableSchema, FetchError>;

    /// Read every row of a table, selecting exactly the schema's columns.
    async fn fetch_rows(&self, schema: &TableSchema) -> std::result::Result<Vec<Row>, FetchError>;
}

/// Bounded retry policy with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Reads table snapshots from a [`RowSource`], retrying transient failures.
pub struct SourceReader<S> {
    source: S,
    retry: RetryPolicy,
}

impl<S: RowSource> SourceReader<S> {
    pub fn new(source: S, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    /// Get a reference to the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Resolve a table's column schema.
    pub async fn describe(&self, spec: &TableSpec) -> Result<TableSchema> {
        self.with_retry(&spec.name, || self.source.describe(spec)).await
    }

    /// Take a full snapshot of a table.
    ///
    /// Fails with `SourceUnavailable` once the retry policy is exhausted or a
    /// fatal error is hit, and with `Validation` if rows cannot be keyed or
    /// fingerprinted.
    pub async fn snapshot(&self, schema: &TableSchema) -> Result<TableSnapshot> {
        let rows = self
            .with_retry(&schema.name, || self.source.fetch_rows(schema))
            .await?;

        let snapshot = TableSnapshot::from_rows(schema, rows)?;
        tracing::debug!(
            "Read {} rows from {} (checksum {})",
            snapshot.row_count,
            schema.name,
            snapshot.checksum
        );
        Ok(snapshot)
    }

    /// Row count, table checksum, and rows of a table.
    ///
    /// The checksum is the table fingerprint computed while keying the snapshot.
    pub async fn metadata(&self, schema: &TableSchema) -> Result<TableMetadata> {
        Ok(self.snapshot(schema).await?.into())
    }

    async fn with_retry<T, F, Fut>(&self, table: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, FetchError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(FetchError::Fatal(cause)) => {
                    tracing::error!("Reading table {} failed permanently: {:#}", table, cause);
                    return Err(ReplicationError::source_unavailable(table, attempt, cause));
                }
                Err(FetchError::Transient(cause)) => {
                    if attempt >= max_attempts {
                        return Err(ReplicationError::source_unavailable(table, attempt, cause));
                    }
                    tracing::warn!(
                        "Error reading table {}: {:#}. Retry {}/{} in {:?}",
                        table,
                        cause,
                        attempt,
                        max_attempts,
                        self.retry.backoff
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
            }
        }
    }
}
