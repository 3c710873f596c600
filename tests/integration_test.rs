// ABOUTME: Live replication tests against a MySQL primary and PostgreSQL replica
// ABOUTME: Requires TEST_SOURCE_URL and TEST_REPLICA_URL; run with --ignored

use cdc_replicator::model::{row, ColumnValue, Delta, Row, TableSchema, TableSpec};
use cdc_replicator::postgres::TlsPolicy;
use cdc_replicator::replica::{PostgresReplicaWriter, ReplicaSink};
use cdc_replicator::source::{MySqlSource, RetryPolicy, RowSource, SourceReader};
use cdc_replicator::{ChangeDetector, ReplicationError};
use mysql_async::prelude::Queryable;
use std::env;

const REPLICA_SCHEMA: &str = "cdc_it";

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let replica = env::var("TEST_REPLICA_URL").ok()?;
    Some((source, replica))
}

/// Create the primary table and its replica shadow table
async fn setup_test_table(
    source_url: &str,
    replica: &tokio_postgres::Client,
    table_name: &str,
) -> anyhow::Result<()> {
    let pool = mysql_async::Pool::new(mysql_async::Opts::from_url(source_url)?);
    let mut conn = pool.get_conn().await?;
    conn.query_drop(format!("DROP TABLE IF EXISTS `{}`", table_name))
        .await?;
    conn.query_drop(format!(
        "CREATE TABLE `{}` (id INT PRIMARY KEY, name VARCHAR(100) NOT NULL, credits DECIMAL(4,1) NULL)",
        table_name
    ))
    .await?;
    conn.query_drop(format!(
        "INSERT INTO `{}` (id, name, credits) VALUES (1, 'Algebra', 3.0)",
        table_name
    ))
    .await?;
    drop(conn);
    pool.disconnect().await?;

    create_shadow_table(replica, table_name).await
}

/// Create the replica shadow table and clear its sync_status row
async fn create_shadow_table(
    replica: &tokio_postgres::Client,
    table_name: &str,
) -> anyhow::Result<()> {
    let ddl = format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS "{schema}";
        DROP TABLE IF EXISTS "{schema}"."{table}";
        CREATE TABLE "{schema}"."{table}" (
            id INTEGER PRIMARY KEY,
            name VARCHAR(100),
            credits NUMERIC(4,1),
            cdc_operation CHAR(1) NOT NULL,
            cdc_timestamp TIMESTAMPTZ NOT NULL,
            cdc_checksum VARCHAR(64) NOT NULL
        )
        "#,
        schema = REPLICA_SCHEMA,
        table = table_name
    );
    replica.batch_execute(&ddl).await?;

    let status_exists: bool = replica
        .query_one(
            "SELECT to_regclass($1) IS NOT NULL",
            &[&format!("{}.sync_status", REPLICA_SCHEMA)],
        )
        .await?
        .get(0);
    if status_exists {
        replica
            .execute(
                &format!(
                    r#"DELETE FROM "{}".sync_status WHERE table_name = $1"#,
                    REPLICA_SCHEMA
                ),
                &[&table_name],
            )
            .await?;
    }
    Ok(())
}

/// Run statements against the primary
async fn source_exec(source_url: &str, statements: &[String]) -> anyhow::Result<()> {
    let pool = mysql_async::Pool::new(mysql_async::Opts::from_url(source_url)?);
    let mut conn = pool.get_conn().await?;
    for statement in statements {
        conn.query_drop(statement).await?;
    }
    drop(conn);
    pool.disconnect().await?;
    Ok(())
}

/// Helper to drop test tables from both databases
async fn cleanup_test_table(source_url: &str, replica: &tokio_postgres::Client, table_name: &str) {
    let _ = source_exec(source_url, &[format!("DROP TABLE IF EXISTS `{}`", table_name)]).await;
    let _ = replica
        .batch_execute(&format!(
            r#"DROP TABLE IF EXISTS "{}"."{}""#,
            REPLICA_SCHEMA, table_name
        ))
        .await;
}

async fn replica_rows(
    replica: &tokio_postgres::Client,
    table_name: &str,
) -> Vec<(i32, String, String)> {
    replica
        .query(
            &format!(
                r#"SELECT id, name, cdc_operation::text FROM "{}"."{}" ORDER BY id"#,
                REPLICA_SCHEMA, table_name
            ),
            &[],
        )
        .await
        .expect("Failed to query replica")
        .iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect()
}

#[tokio::test]
#[ignore]
async fn test_insert_update_delete_roundtrip() {
    let (source_url, replica_url) = match get_test_urls() {
        Some(urls) => urls,
        None => {
            println!("Skipping test: TEST_SOURCE_URL and TEST_REPLICA_URL not set");
            return;
        }
    };
    let table = "cdc_it_course";

    let replica = cdc_replicator::postgres::connect(&replica_url, TlsPolicy::default())
        .await
        .expect("Failed to connect to replica");
    setup_test_table(&source_url, &replica, table)
        .await
        .expect("Failed to set up test table");

    let source = MySqlSource::connect(&source_url)
        .await
        .expect("Failed to connect to source");
    let mut writer = PostgresReplicaWriter::connect(
        &replica_url,
        TlsPolicy::default(),
        REPLICA_SCHEMA.to_string(),
        100,
    )
    .await
    .expect("Failed to create writer");
    writer
        .ensure_sync_status_table()
        .await
        .expect("Failed to create sync_status");

    let mut detector = ChangeDetector::new(
        SourceReader::new(source, RetryPolicy::no_retry()),
        writer,
        vec![TableSpec::new(table)],
    );
    let report = detector.initialize().await;
    assert!(report.is_success(), "initialize failed: {:?}", report.errors);
    println!("✓ Baseline taken");

    source_exec(
        &source_url,
        &[format!(
            "INSERT INTO `{}` (id, name, credits) VALUES (2, 'Biology', NULL)",
            table
        )],
    )
    .await
    .expect("Failed to insert");
    let report = detector.detect_and_sync().await;
    assert!(report.is_success(), "cycle failed: {:?}", report.errors);
    assert_eq!(
        replica_rows(&replica, table).await,
        vec![(2, "Biology".to_string(), "I".to_string())]
    );
    println!("✓ Insert replicated");

    source_exec(
        &source_url,
        &[
            format!("UPDATE `{}` SET name = 'Linear Algebra' WHERE id = 1", table),
            format!("DELETE FROM `{}` WHERE id = 2", table),
        ],
    )
    .await
    .expect("Failed to modify");
    let report = detector.detect_and_sync().await;
    assert!(report.is_success(), "cycle failed: {:?}", report.errors);
    assert_eq!(
        replica_rows(&replica, table).await,
        vec![
            (1, "Linear Algebra".to_string(), "U".to_string()),
            (2, "Biology".to_string(), "D".to_string()),
        ]
    );
    println!("✓ Update and delete replicated");

    let statuses = detector
        .sink()
        .client()
        .query(
            &format!(
                r#"SELECT row_count, status FROM "{}".sync_status WHERE table_name = $1"#,
                REPLICA_SCHEMA
            ),
            &[&table],
        )
        .await
        .expect("Failed to read sync_status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].get::<_, i64>(0), 2);
    assert_eq!(statuses[0].get::<_, String>(1), "SUCCESS");
    println!("✓ sync_status recorded");

    let (reader, _writer) = detector.into_parts();
    let _ = reader.into_source().disconnect().await;
    cleanup_test_table(&source_url, &replica, table).await;
}

#[tokio::test]
#[ignore]
async fn test_missing_shadow_column_fails_prepare() {
    let (source_url, replica_url) = match get_test_urls() {
        Some(urls) => urls,
        None => {
            println!("Skipping test: TEST_SOURCE_URL and TEST_REPLICA_URL not set");
            return;
        }
    };
    let table = "cdc_it_broken";

    let replica = cdc_replicator::postgres::connect(&replica_url, TlsPolicy::default())
        .await
        .expect("Failed to connect to replica");
    setup_test_table(&source_url, &replica, table)
        .await
        .expect("Failed to set up test table");
    replica
        .batch_execute(&format!(
            r#"ALTER TABLE "{}"."{}" DROP COLUMN cdc_checksum"#,
            REPLICA_SCHEMA, table
        ))
        .await
        .expect("Failed to alter shadow table");

    let source = MySqlSource::connect(&source_url)
        .await
        .expect("Failed to connect to source");
    let writer = PostgresReplicaWriter::connect(
        &replica_url,
        TlsPolicy::default(),
        REPLICA_SCHEMA.to_string(),
        100,
    )
    .await
    .expect("Failed to create writer");

    let mut detector = ChangeDetector::new(
        SourceReader::new(source, RetryPolicy::no_retry()),
        writer,
        vec![TableSpec::new(table)],
    );
    let report = detector.initialize().await;
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].table(), table);
    println!("✓ Missing cdc_checksum detected");

    let (reader, _writer) = detector.into_parts();
    let _ = reader.into_source().disconnect().await;
    cleanup_test_table(&source_url, &replica, table).await;
}

/// Full replica state of a table, excluding `cdc_timestamp`
type ShadowRow = (i32, Option<String>, Option<String>, String, String);

async fn shadow_state(
    replica: &tokio_postgres::Client,
    table_name: &str,
) -> (Vec<ShadowRow>, Option<(i64, String, String)>) {
    let rows = replica
        .query(
            &format!(
                r#"SELECT id, name, credits::text, cdc_operation::text, cdc_checksum::text
                   FROM "{}"."{}" ORDER BY id"#,
                REPLICA_SCHEMA, table_name
            ),
            &[],
        )
        .await
        .expect("Failed to query replica")
        .iter()
        .map(|r| (r.get(0), r.get(1), r.get(2), r.get(3), r.get(4)))
        .collect();

    let status = replica
        .query_opt(
            &format!(
                r#"SELECT row_count, last_checksum::text, status::text
                   FROM "{}".sync_status WHERE table_name = $1"#,
                REPLICA_SCHEMA
            ),
            &[&table_name],
        )
        .await
        .expect("Failed to read sync_status")
        .map(|r| (r.get(0), r.get(1), r.get(2)));

    (rows, status)
}

fn course_row(id: i64, name: &str, credits: Option<&str>) -> Row {
    row([
        ("id", ColumnValue::Int(id)),
        ("name", ColumnValue::from(name)),
        (
            "credits",
            credits.map_or(ColumnValue::Null, ColumnValue::from),
        ),
    ])
}

fn course_schema(table_name: &str) -> TableSchema {
    TableSchema::new(
        table_name,
        "id",
        vec!["id".to_string(), "name".to_string(), "credits".to_string()],
    )
    .expect("valid schema")
}

/// Writer with one row per statement, so a delta spans several statements
async fn batch_of_one_writer(replica_url: &str, table_name: &str) -> PostgresReplicaWriter {
    let mut writer = PostgresReplicaWriter::connect(
        replica_url,
        TlsPolicy::default(),
        REPLICA_SCHEMA.to_string(),
        1,
    )
    .await
    .expect("Failed to create writer");
    writer
        .ensure_sync_status_table()
        .await
        .expect("Failed to create sync_status");
    writer
        .prepare(&course_schema(table_name))
        .await
        .expect("Failed to prepare shadow table");
    writer
}

#[tokio::test]
#[ignore]
async fn test_reapplying_delta_leaves_same_state() {
    let replica_url = match env::var("TEST_REPLICA_URL") {
        Ok(url) => url,
        Err(_) => {
            println!("Skipping test: TEST_REPLICA_URL not set");
            return;
        }
    };
    let table = "cdc_it_idempotent";

    let replica = cdc_replicator::postgres::connect(&replica_url, TlsPolicy::default())
        .await
        .expect("Failed to connect to replica");
    create_shadow_table(&replica, table)
        .await
        .expect("Failed to create shadow table");
    let mut writer = batch_of_one_writer(&replica_url, table).await;
    let schema = course_schema(table);

    let delta = Delta {
        inserted: vec![course_row(1, "Algebra", Some("3.0"))],
        updated: vec![course_row(2, "Biology", None)],
        deleted: vec![course_row(3, "Chemistry", Some("4.5"))],
    };

    let first = writer
        .apply(&schema, &delta, "checksum-1")
        .await
        .expect("First apply failed");
    let after_first = shadow_state(&replica, table).await;

    let second = writer
        .apply(&schema, &delta, "checksum-1")
        .await
        .expect("Second apply failed");
    let after_second = shadow_state(&replica, table).await;

    assert_eq!(first, second);
    assert_eq!(after_first, after_second);

    let (rows, status) = after_second;
    let ops: Vec<&str> = rows.iter().map(|r| r.3.as_str()).collect();
    assert_eq!(ops, vec!["I", "U", "D"]);
    assert_eq!(rows[1].2, None);
    assert_eq!(
        status,
        Some((3, "checksum-1".to_string(), "SUCCESS".to_string()))
    );
    println!("✓ Re-applied delta left the replica unchanged");

    let _ = replica
        .batch_execute(&format!(
            r#"DROP TABLE IF EXISTS "{}"."{}""#,
            REPLICA_SCHEMA, table
        ))
        .await;
}

#[tokio::test]
#[ignore]
async fn test_failing_row_rolls_back_whole_delta() {
    let replica_url = match env::var("TEST_REPLICA_URL") {
        Ok(url) => url,
        Err(_) => {
            println!("Skipping test: TEST_REPLICA_URL not set");
            return;
        }
    };
    let table = "cdc_it_atomic";

    let replica = cdc_replicator::postgres::connect(&replica_url, TlsPolicy::default())
        .await
        .expect("Failed to connect to replica");
    create_shadow_table(&replica, table)
        .await
        .expect("Failed to create shadow table");
    replica
        .batch_execute(&format!(
            r#"ALTER TABLE "{}"."{}" ADD CONSTRAINT no_withdrawn CHECK (name <> 'WITHDRAWN')"#,
            REPLICA_SCHEMA, table
        ))
        .await
        .expect("Failed to add constraint");
    let mut writer = batch_of_one_writer(&replica_url, table).await;
    let schema = course_schema(table);

    let baseline = Delta {
        inserted: vec![course_row(1, "Algebra", Some("3.0"))],
        ..Default::default()
    };
    writer
        .apply(&schema, &baseline, "checksum-1")
        .await
        .expect("Baseline apply failed");
    let before = shadow_state(&replica, table).await;

    // The first two rows go through in their own statements before the
    // third violates the constraint.
    let delta = Delta {
        inserted: vec![
            course_row(2, "Biology", Some("4.0")),
            course_row(3, "WITHDRAWN", None),
        ],
        updated: vec![course_row(1, "Linear Algebra", Some("3.0"))],
        deleted: vec![],
    };
    let result = writer.apply(&schema, &delta, "checksum-2").await;

    assert!(matches!(
        result,
        Err(ReplicationError::ReplicaApplyFailure { .. })
    ));
    assert_eq!(shadow_state(&replica, table).await, before);
    println!("✓ Failed apply left no partial rows and sync_status unchanged");

    // The writer is still usable after the rollback.
    let retry = Delta {
        inserted: vec![course_row(2, "Biology", Some("4.0"))],
        ..Default::default()
    };
    writer
        .apply(&schema, &retry, "checksum-3")
        .await
        .expect("Apply after rollback failed");
    let (rows, status) = shadow_state(&replica, table).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(status.map(|s| s.1), Some("checksum-3".to_string()));

    let _ = replica
        .batch_execute(&format!(
            r#"DROP TABLE IF EXISTS "{}"."{}""#,
            REPLICA_SCHEMA, table
        ))
        .await;
}

#[tokio::test]
#[ignore]
async fn test_source_rows_arrive_typed() {
    let (source_url, replica_url) = match get_test_urls() {
        Some(urls) => urls,
        None => {
            println!("Skipping test: TEST_SOURCE_URL and TEST_REPLICA_URL not set");
            return;
        }
    };
    let table = "cdc_it_typed";

    let replica = cdc_replicator::postgres::connect(&replica_url, TlsPolicy::default())
        .await
        .expect("Failed to connect to replica");
    setup_test_table(&source_url, &replica, table)
        .await
        .expect("Failed to set up test table");

    let source = MySqlSource::connect(&source_url)
        .await
        .expect("Failed to connect to source");
    let schema = source
        .describe(&TableSpec::new(table))
        .await
        .expect("Failed to describe table");
    let rows = source.fetch_rows(&schema).await.expect("Failed to read rows");

    assert_eq!(rows.len(), 1);
    // Integers come back as integers, not as their text form.
    assert_eq!(rows[0]["id"], ColumnValue::Int(1));
    assert_eq!(rows[0]["name"], ColumnValue::from("Algebra"));
    assert_eq!(rows[0]["credits"], ColumnValue::from("3.0"));
    println!("✓ Source values decoded by column type");

    let _ = source.disconnect().await;
    cleanup_test_table(&source_url, &replica, table).await;
}
