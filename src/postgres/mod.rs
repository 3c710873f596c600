// ABOUTME: PostgreSQL connectivity shared by the replica writer and the CLI
// ABOUTME: Re-exports connection helpers

pub mod connection;

pub use connection::{connect, connect_with_retry, TlsPolicy};
