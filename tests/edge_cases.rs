//! Edge Case Tests
//!
//! Unusual inputs and values flowing through the `SQLite` driver, the classifier and the
//! formatter:
//! - Unicode and special characters
//! - Binary data, numeric extremes, NULLs
//! - Oversized cells and statements
//! - Separators inside literals, trailing terminators, empty results

#![cfg(feature = "sqlite")]

use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use querygate::classifier::MULTI_STATEMENT_REASON;
use querygate::engine::sqlite::{SqliteDriver, MAX_STATEMENT_LEN};
use querygate::output::{render_rows, sanitize_cell, MAX_CELL_WIDTH, NO_RESULTS};
use querygate::{
    BackendKind, Cell, ConnectionSpec, DatabaseDriver, ExecuteOptions, Gateway, GatewayConfig, OutputFormat,
    QueryOutcome, QueryRequest, RowSet,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn create_test_db(setup: &str) -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("edge.db");
    let conn = rusqlite::Connection::open(&path).expect("Failed to create database");
    conn.execute_batch(setup).expect("Failed to run setup");
    (dir, path.to_string_lossy().into_owned())
}

async fn driver(path: &str) -> SqliteDriver {
    let driver = SqliteDriver::new(path);
    driver.connect().await.expect("Failed to connect");
    driver
}

fn read_only(row_limit: usize) -> ExecuteOptions {
    ExecuteOptions { row_limit, timeout: Duration::from_secs(5), read_only: true }
}

async fn select(driver: &SqliteDriver, sql: &str) -> RowSet {
    match driver.execute(sql, &read_only(100)).await.expect("Query failed") {
        QueryOutcome::Rows(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    }
}

// ============================================================================
// Unicode and Special Characters
// ============================================================================

#[tokio::test]
async fn test_unicode_text_survives_every_encoding() {
    let (_dir, path) = create_test_db(
        "CREATE TABLE words (w TEXT);
         INSERT INTO words VALUES ('héllo wörld'), ('日本語'), ('emoji 🚀');",
    );
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT w FROM words ORDER BY rowid").await;

    assert_eq!(rows.rows[1], vec![Cell::text("日本語")]);

    let json: serde_json::Value = serde_json::from_str(&render_rows(&rows, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json[2]["w"], "emoji 🚀");

    let csv = render_rows(&rows, OutputFormat::Csv).unwrap();
    assert_eq!(csv, "w\nhéllo wörld\n日本語\nemoji 🚀");

    // width is counted in characters, so the separator matches the widest cell
    let table = render_rows(&rows, OutputFormat::Table).unwrap();
    assert_eq!(table.lines().nth(1), Some("-----------"));
}

#[tokio::test]
async fn test_quotes_and_separators_in_values() {
    let (_dir, path) = create_test_db(
        r#"CREATE TABLE notes (body TEXT);
           INSERT INTO notes VALUES ('say "hi", then leave'), ('it''s'), ('line one
line two');"#,
    );
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT body FROM notes ORDER BY rowid").await;

    let csv = render_rows(&rows, OutputFormat::Csv).unwrap();
    assert_eq!(csv, "body\n\"say \"\"hi\"\", then leave\"\nit's\n\"line one\nline two\"");

    let mut reader = csv::Reader::from_reader(csv.as_bytes());
    let parsed: Vec<String> = reader.records().map(|r| r.unwrap()[0].to_string()).collect();
    assert_eq!(parsed, vec!["say \"hi\", then leave", "it's", "line one\nline two"]);

    let table = render_rows(&rows, OutputFormat::Table).unwrap();
    assert!(table.contains("line one line two"));
}

#[tokio::test]
async fn test_separator_inside_literal_is_denied_when_read_only() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER);");
    let mut config = GatewayConfig::default();
    config.connections.insert("ro".to_string(), ConnectionSpec::new(BackendKind::Sqlite, &path));
    config.connections.insert("rw".to_string(), ConnectionSpec::new(BackendKind::Sqlite, &path).with_read_only(false));
    let gateway = Gateway::new(config);

    let request = QueryRequest::new("SELECT 'a;b' AS v");
    let denied = gateway.run_query(&request.clone().on("ro")).await.unwrap();
    assert_eq!(denied.outcome, QueryOutcome::Denied { reason: MULTI_STATEMENT_REASON.to_string() });

    let allowed = gateway.run_query(&request.on("rw")).await.unwrap();
    match allowed.outcome {
        QueryOutcome::Rows(rows) => assert_eq!(rows.rows, vec![vec![Cell::text("a;b")]]),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn test_trailing_terminator_and_comment() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);");
    let driver = driver(&path).await;

    assert_eq!(select(&driver, "SELECT x FROM t;  ").await.row_count(), 2);
    assert_eq!(select(&driver, "SELECT x FROM t -- trailing comment").await.row_count(), 2);
}

// ============================================================================
// Value Types
// ============================================================================

#[tokio::test]
async fn test_blob_renders_as_length_marker() {
    let (_dir, path) = create_test_db(
        "CREATE TABLE files (name TEXT, data BLOB);
         INSERT INTO files VALUES ('a', x'DEADBEEF'), ('b', x'');",
    );
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT name, data FROM files ORDER BY name").await;

    assert_eq!(rows.rows[0][1], Cell::Blob(4));
    assert_eq!(sanitize_cell(&rows.rows[1][1]), "[BLOB 0 bytes]");

    let json: serde_json::Value = serde_json::from_str(&render_rows(&rows, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json[0]["data"], "[BLOB 4 bytes]");
    assert!(render_rows(&rows, OutputFormat::Csv).unwrap().contains("a,[BLOB 4 bytes]"));
    assert!(render_rows(&rows, OutputFormat::Table).unwrap().contains("[BLOB 4 bytes]"));
}

#[tokio::test]
async fn test_numeric_extremes_and_nulls() {
    let (_dir, path) = create_test_db(&format!(
        "CREATE TABLE n (i INTEGER, r REAL, t TEXT);
         INSERT INTO n VALUES ({}, 1.5e300, NULL), ({}, -0.25, 'NULL');",
        i64::MAX,
        i64::MIN
    ));
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT i, r, t FROM n ORDER BY rowid").await;

    assert_eq!(rows.rows[0][0], Cell::Int(i64::MAX));
    assert_eq!(rows.rows[1][0], Cell::Int(i64::MIN));
    assert_eq!(rows.rows[0][2], Cell::Null);

    let json: serde_json::Value = serde_json::from_str(&render_rows(&rows, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json[0]["i"], i64::MAX);
    assert_eq!(json[1]["r"], -0.25);
    assert!(json[0]["t"].is_null());
    assert_eq!(json[1]["t"], "NULL");

    let csv = render_rows(&rows, OutputFormat::Csv).unwrap();
    assert!(csv.lines().nth(1).unwrap().ends_with(",NULL"));
    assert!(csv.lines().nth(1).unwrap().contains(",1.5e300,"), "{csv}");
    assert_eq!(csv.lines().nth(2), Some(format!("{},-0.25,NULL", i64::MIN).as_str()));

    let table = render_rows(&rows, OutputFormat::Table).unwrap();
    assert!(table.contains("1.5e300"), "{table}");
}

#[tokio::test]
async fn test_repeated_column_names_survive_the_row_cap() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER);");
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT 1 AS a, 2 AS a").await;

    assert_eq!(rows.columns, vec!["a".to_string(), "a".to_string()]);
    assert_eq!(rows.rows, vec![vec![Cell::Int(1), Cell::Int(2)]]);

    let json: serde_json::Value = serde_json::from_str(&render_rows(&rows, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json[0]["a"], 1);
    assert_eq!(json[0]["a_2"], 2);
}

#[tokio::test]
async fn test_long_text_is_cut_to_max_width() {
    let (_dir, path) = create_test_db("CREATE TABLE big (body TEXT); INSERT INTO big VALUES (hex(zeroblob(250)));");
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT body FROM big").await;

    let shown = sanitize_cell(&rows.rows[0][0]);
    assert_eq!(shown.chars().count(), MAX_CELL_WIDTH);
    assert!(shown.ends_with("..."));

    let json: serde_json::Value = serde_json::from_str(&render_rows(&rows, OutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json[0]["body"].as_str().unwrap().chars().count(), MAX_CELL_WIDTH);
}

// ============================================================================
// Statement Shapes
// ============================================================================

#[tokio::test]
async fn test_empty_result_is_sentinel() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER);");
    let driver = driver(&path).await;
    let rows = select(&driver, "SELECT x FROM t").await;

    assert_eq!(rows.columns, vec!["x".to_string()]);
    for format in [OutputFormat::Table, OutputFormat::Json, OutputFormat::Csv] {
        assert_eq!(render_rows(&rows, format).unwrap(), NO_RESULTS);
    }
}

#[tokio::test]
async fn test_explain_is_a_read() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER PRIMARY KEY);");
    let driver = driver(&path).await;
    let rows = select(&driver, "EXPLAIN QUERY PLAN SELECT x FROM t WHERE x = 1").await;
    assert!(rows.row_count() >= 1);
}

#[tokio::test]
async fn test_oversized_statement_is_rejected() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER);");
    let driver = driver(&path).await;

    let sql = format!("SELECT 1 /* {} */", "x".repeat(MAX_STATEMENT_LEN));
    let err = driver.execute(&sql, &read_only(10)).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
}

#[tokio::test]
async fn test_write_without_result_set_reports_affected_rows() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2), (3);");
    let driver = driver(&path).await;

    let options = ExecuteOptions { read_only: false, ..read_only(10) };
    let outcome = driver.execute("UPDATE t SET x = x + 1 WHERE x > 1", &options).await.unwrap();
    assert_eq!(outcome, QueryOutcome::Affected { rows_affected: 2 });
}

#[tokio::test]
async fn test_close_is_idempotent_and_ping_reports_closed() {
    let (_dir, path) = create_test_db("CREATE TABLE t (x INTEGER);");
    let driver = driver(&path).await;
    assert!(driver.ping().await);

    driver.close().await.unwrap();
    driver.close().await.unwrap();
    assert!(!driver.ping().await);
    assert!(SqliteDriver::new(&path).close().await.is_ok());
}
