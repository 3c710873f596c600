// ABOUTME: Pre-flight validation checks for replication prerequisites
// ABOUTME: Verifies connectivity, source table schemas, and replica shadow tables

use crate::config::ReplicatorConfig;
use crate::model::TableSchema;
use crate::postgres::{self, TlsPolicy};
use crate::replica::{sync_status_exists, PostgresReplicaWriter, ReplicaSink};
use crate::source::{MySqlSource, RetryPolicy, SourceReader};
use crate::utils::strip_password_from_url;

/// Individual check result
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Complete pre-flight results
#[derive(Debug, Default)]
pub struct PreflightResult {
    pub network: Vec<CheckResult>,
    pub source_tables: Vec<CheckResult>,
    pub replica_tables: Vec<CheckResult>,
}

impl PreflightResult {
    pub fn new() -> Self {
        Self::default()
    }

    fn checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.network
            .iter()
            .chain(&self.source_tables)
            .chain(&self.replica_tables)
    }

    pub fn all_passed(&self) -> bool {
        self.checks().all(|c| c.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.checks().filter(|c| !c.passed).count()
    }

    /// Print formatted output
    pub fn print(&self) {
        println!();
        println!("Pre-flight Checks");
        println!("{}", "═".repeat(61));
        println!();

        print_section("Network Connectivity:", &self.network);
        print_section("Source Tables:", &self.source_tables);
        print_section("Replica Tables:", &self.replica_tables);

        println!("{}", "═".repeat(61));
        if self.all_passed() {
            println!("PASSED: All pre-flight checks successful");
        } else {
            println!("FAILED: {} check(s) must be resolved", self.failed_count());
        }
    }
}

fn print_section(title: &str, checks: &[CheckResult]) {
    if checks.is_empty() {
        return;
    }
    println!("{}", title);
    for check in checks {
        let icon = if check.passed { "✓" } else { "✗" };
        println!("  {} {}", icon, check.message);
        if let Some(ref details) = check.details {
            println!("      {}", details);
        }
    }
    println!();
}

/// Run all pre-flight checks against the configured stores.
///
/// Makes a single connection attempt per store and never writes to either.
pub async fn run_preflight_checks(config: &ReplicatorConfig, tls: TlsPolicy) -> PreflightResult {
    let mut result = PreflightResult::new();

    // 1. Source connectivity and table schemas
    let mut schemas: Vec<TableSchema> = Vec::new();
    match MySqlSource::connect(&config.source_url).await {
        Ok(source) => {
            result.network.push(CheckResult::pass(
                "source",
                format!(
                    "Connected to source {}",
                    strip_password_from_url(&config.source_url)
                ),
            ));

            let reader = SourceReader::new(source, RetryPolicy::no_retry());
            for spec in &config.tables {
                match reader.describe(spec).await {
                    Ok(schema) => {
                        result.source_tables.push(CheckResult::pass(
                            spec.name.clone(),
                            format!(
                                "{}: {} column(s), primary key '{}'",
                                schema.name,
                                schema.columns.len(),
                                schema.primary_key
                            ),
                        ));
                        schemas.push(schema);
                    }
                    Err(e) => result.source_tables.push(
                        CheckResult::fail(spec.name.clone(), format!("{}: not readable", spec.name))
                            .with_details(e.to_string()),
                    ),
                }
            }

            if let Err(e) = reader.into_source().disconnect().await {
                tracing::debug!("Failed to close source pool: {:#}", e);
            }
        }
        Err(e) => result.network.push(
            CheckResult::fail("source", "Cannot connect to source").with_details(format!("{:#}", e)),
        ),
    }

    // 2. Replica connectivity, sync_status, and shadow tables
    let client = match postgres::connect(&config.replica_url, tls).await {
        Ok(client) => client,
        Err(e) => {
            result.network.push(
                CheckResult::fail("replica", "Cannot connect to replica")
                    .with_details(format!("{:#}", e)),
            );
            return result;
        }
    };
    result.network.push(CheckResult::pass(
        "replica",
        format!(
            "Connected to replica {}",
            strip_password_from_url(&config.replica_url)
        ),
    ));

    match sync_status_exists(&client, &config.replica_schema).await {
        Ok(true) => result.replica_tables.push(CheckResult::pass(
            "sync_status",
            format!("{}.sync_status exists", config.replica_schema),
        )),
        // Created on startup by `run`, so only informational.
        Ok(false) => result.replica_tables.push(CheckResult::pass(
            "sync_status",
            format!(
                "{}.sync_status missing (created on first run)",
                config.replica_schema
            ),
        )),
        Err(e) => result.replica_tables.push(
            CheckResult::fail("sync_status", "Cannot inspect sync_status")
                .with_details(format!("{:#}", e)),
        ),
    }

    let mut writer =
        match PostgresReplicaWriter::new(client, config.replica_schema.clone(), config.batch_size) {
            Ok(writer) => writer,
            Err(e) => {
                result.replica_tables.push(
                    CheckResult::fail("replica", "Invalid replica settings")
                        .with_details(format!("{:#}", e)),
                );
                return result;
            }
        };

    for schema in &schemas {
        match writer.prepare(schema).await {
            Ok(()) => result.replica_tables.push(CheckResult::pass(
                schema.name.clone(),
                format!("{}.{} is ready", config.replica_schema, schema.name),
            )),
            Err(e) => result.replica_tables.push(
                CheckResult::fail(
                    schema.name.clone(),
                    format!("{}.{} is not ready", config.replica_schema, schema.name),
                )
                .with_details(e.to_string()),
            ),
        }
    }

    result
}
