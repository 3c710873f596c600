// ABOUTME: Error taxonomy for the replication core
// ABOUTME: Separates source outages, replica apply failures, and row validation errors

use thiserror::Error;

/// Errors raised while replicating a single monitored table.
///
/// Every variant names the table it belongs to, so the change detector can
/// record it against that table and move on to the next one.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The primary store could not be read, either after exhausting the retry
    /// policy or because the failure was not worth retrying.
    #[error("source unavailable for table '{table}' after {attempts} attempt(s): {cause:#}")]
    SourceUnavailable {
        table: String,
        attempts: u32,
        #[source]
        cause: anyhow::Error,
    },

    /// A statement inside the replica transaction failed. The transaction was
    /// rolled back and nothing from the delta is visible.
    #[error("failed to apply changes to replica table '{table}': {cause:#}")]
    ReplicaApplyFailure {
        table: String,
        #[source]
        cause: anyhow::Error,
    },

    /// A row or schema could not be canonically represented.
    #[error("validation failed for table '{table}': {message}")]
    Validation { table: String, message: String },
}

impl ReplicationError {
    pub fn source_unavailable(table: impl Into<String>, attempts: u32, cause: anyhow::Error) -> Self {
        Self::SourceUnavailable {
            table: table.into(),
            attempts,
            cause,
        }
    }

    pub fn replica_apply(table: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::ReplicaApplyFailure {
            table: table.into(),
            cause,
        }
    }

    pub fn validation(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Name of the table the error belongs to.
    pub fn table(&self) -> &str {
        match self {
            Self::SourceUnavailable { table, .. }
            | Self::ReplicaApplyFailure { table, .. }
            | Self::Validation { table, .. } => table,
        }
    }

    /// Attach a table name to a validation error raised without one.
    pub(crate) fn for_table(self, name: &str) -> Self {
        match self {
            Self::Validation { table, message } if table.is_empty() => Self::Validation {
                table: name.to_string(),
                message,
            },
            other => other,
        }
    }
}

pub type Result<T, E = ReplicationError> = std::result::Result<T, E>;
