// ABOUTME: Source side of replication - reading full table snapshots from the primary store
// ABOUTME: RowSource abstracts the store; SourceReader adds retry and snapshot keying

pub mod mysql;
pub mod reader;

pub use mysql::MySqlSource;
pub use reader::{FetchError, RetryPolicy, RowSource, SourceReader};
