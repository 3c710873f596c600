// ABOUTME: Library root for cdc-replicator
// ABOUTME: Snapshot-diff replication of MySQL tables into a PostgreSQL change log

pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod postgres;
pub mod preflight;
pub mod replica;
pub mod source;
pub mod utils;

pub use detector::{ChangeDetector, CycleReport, TableState};
pub use driver::PollDriver;
pub use error::ReplicationError;
