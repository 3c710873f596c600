// ABOUTME: Replica side of replication - applies deltas to the secondary store
// ABOUTME: Defines the ReplicaSink seam and the PostgreSQL implementation

pub mod convert;
pub mod status;
pub mod writer;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Delta, TableSchema};

pub use status::{
    ensure_sync_status_table, load_sync_status, stale_tables, sync_status_exists,
    SYNC_STATUS_TABLE,
};
pub use writer::PostgresReplicaWriter;

/// Number of rows written per operation by one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl AppliedChanges {
    pub fn for_delta(delta: &Delta) -> Self {
        Self {
            inserted: delta.inserted.len(),
            updated: delta.updated.len(),
            deleted: delta.deleted.len(),
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// A secondary store that records deltas and sync bookkeeping.
///
/// `apply` is all-or-nothing: either every row of the delta and the table's
/// sync status are committed, or nothing is. Re-applying the same delta must
/// leave the store in the same state.
#[async_trait]
pub trait ReplicaSink: Send {
    /// Validate that the replica can receive rows for `schema`.
    async fn prepare(&mut self, schema: &TableSchema) -> Result<()>;

    /// Apply one table's delta in a single transaction.
    async fn apply(
        &mut self,
        schema: &TableSchema,
        delta: &Delta,
        checksum: &str,
    ) -> Result<AppliedChanges>;
}
