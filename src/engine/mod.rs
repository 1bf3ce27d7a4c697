//! Database Drivers and Core Types
//!
//! This module defines the uniform driver contract every backend implements, the closed
//! [`Driver`] enum that dispatches over the compiled-in backends, and the value types that flow
//! between drivers, the formatter and the gateway.
//!
//! # Driver Contract
//! - `connect()` opens the link or pool and runs one liveness probe
//! - `execute()` runs exactly one statement under a row cap, a timeout and a read-only flag
//! - `list_tables()` / `describe_table()` introspect user objects
//! - `ping()` never errors; `close()` is idempotent
//!
//! # Row Limiting
//! Plain reads (`SELECT`, `WITH`, `VALUES`, `TABLE`) are wrapped as
//! `SELECT * FROM (<sql>) AS querygate_capped LIMIT <limit + 1>` so the server stops early.
//! Other row-returning statements (`PRAGMA`, `EXPLAIN`, `SHOW`, ...) are truncated while streaming.
//! The extra row decides `truncated`.
//!
//! # Feature Gating
//! Each backend sits behind a cargo feature. A backend compiled out of the build still parses
//! from configuration and fails on first connection with `DriverUnavailable`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier;
use crate::error::{ConnectionCause, GatewayError, Result};
use crate::output::Cell;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Absolute ceiling on rows returned by any query
pub const HARD_ROW_CAP: usize = 10_000;

/// How far past the row limit a streamed result is counted to report a total
pub(crate) const COUNT_AHEAD_LIMIT: u64 = 10_000;

/// Alias used for wrapped statements
const WRAP_ALIAS: &str = "querygate_capped";

/// Statements that return rows and are therefore subject to the row cap
const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE", "PRAGMA", "EXPLAIN", "SHOW", "DESCRIBE", "DESC"];

/// Statements that can be wrapped in a limiting subquery
const WRAPPABLE_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `SQLite` file or in-memory database
    Sqlite,
    /// `PostgreSQL` server
    Postgres,
    /// `MySQL` / `MariaDB` server
    Mysql,
}

impl BackendKind {
    /// Get the backend name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    /// Cargo feature that compiles this backend in
    #[must_use]
    pub const fn feature(&self) -> &'static str {
        self.as_str()
    }

    /// Whether this build carries the backend's driver
    #[must_use]
    pub const fn is_compiled_in(&self) -> bool {
        match self {
            Self::Sqlite => cfg!(feature = "sqlite"),
            Self::Postgres => cfg!(feature = "postgres"),
            Self::Mysql => cfg!(feature = "mysql"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a listed schema object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

impl TableKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
        }
    }
}

/// Entry of a table listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub kind: TableKind,
}

/// Column information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,

    /// Column data type (backend-specific spelling)
    pub data_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,

    /// Default value expression (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Whether the column is part of the primary key
    pub primary_key: bool,
}

/// Per-execution constraints handed to a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum rows to return (already clamped by the caller)
    pub row_limit: usize,
    /// Wall-clock budget for the statement
    pub timeout: Duration,
    /// Run under the backend's read-only guard
    pub read_only: bool,
}

impl ExecuteOptions {
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Rows returned by a statement
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    /// Column names in result order
    pub columns: Vec<String>,
    /// Rows in result order, one cell per column
    pub rows: Vec<Vec<Cell>>,
    /// More rows existed than were returned
    pub truncated: bool,
    /// Total row count when the backend could tell cheaply
    pub total_rows: Option<u64>,
}

impl RowSet {
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Result of running one request
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Statement produced a result set
    Rows(RowSet),
    /// Statement produced no result set
    Affected { rows_affected: u64 },
    /// The safety classifier refused to run the statement
    Denied { reason: String },
}

/// How a backend enforces statement timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSupport {
    /// Server-side limit plus a client deadline that cancels the statement
    Native,
    /// The statement is interrupted at the deadline from the client side; statements longer
    /// than `max_statement_len` characters are rejected before they run
    Cooperative { max_statement_len: usize },
}

impl TimeoutSupport {
    /// Advisory shown once per live connection when enforcement is weaker than native
    #[must_use]
    pub fn advisory(&self, backend: BackendKind) -> Option<String> {
        match self {
            Self::Native => None,
            Self::Cooperative { max_statement_len } => Some(format!(
                "Note: {backend} timeouts are cooperative. A running statement is interrupted at the deadline, \
                 and statements longer than {max_statement_len} characters are rejected."
            )),
        }
    }
}

/// Uniform driver contract
///
/// All backends implement this trait. Methods take `&self`; drivers manage their own pool or
/// connection internally so a live driver can be shared between concurrent callers.
pub trait DatabaseDriver: Send + Sync {
    /// Backend served by this driver
    fn backend(&self) -> BackendKind;

    /// Timeout mechanics for this backend
    fn timeout_support(&self) -> TimeoutSupport;

    /// Open the underlying link or pool and verify it with one probe
    fn connect(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Execute exactly one statement
    fn execute(
        &self,
        sql: &str,
        options: &ExecuteOptions,
    ) -> impl std::future::Future<Output = Result<QueryOutcome>> + Send;

    /// User tables and views ordered by name, system catalogs excluded
    fn list_tables(&self) -> impl std::future::Future<Output = Result<Vec<TableSummary>>> + Send;

    /// Ordered columns of one table
    ///
    /// Unknown tables fail with `TableNotFound`, never with an empty list.
    fn describe_table(&self, table: &str) -> impl std::future::Future<Output = Result<Vec<ColumnDescriptor>>> + Send;

    /// Cheap liveness check
    fn ping(&self) -> impl std::future::Future<Output = bool> + Send;

    /// Release every resource; safe to call twice or before `connect()`
    fn close(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Closed set of drivers
pub enum Driver {
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteDriver),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresDriver),
    #[cfg(feature = "mysql")]
    Mysql(mysql::MysqlDriver),
    /// Backend configured but compiled out of this build
    Unavailable(BackendKind),
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // locations may carry credentials
        f.debug_tuple("Driver").field(&self.backend()).finish()
    }
}

impl Driver {
    /// Build an unconnected driver for `location` (already environment-expanded)
    #[must_use]
    pub fn new(backend: BackendKind, location: &str) -> Self {
        match backend {
            #[cfg(feature = "sqlite")]
            BackendKind::Sqlite => Self::Sqlite(sqlite::SqliteDriver::new(location)),
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => Self::Postgres(postgres::PostgresDriver::new(location)),
            #[cfg(feature = "mysql")]
            BackendKind::Mysql => Self::Mysql(mysql::MysqlDriver::new(location)),
            #[allow(unreachable_patterns)]
            other => {
                let _ = location;
                Self::Unavailable(other)
            }
        }
    }
}

fn unavailable(backend: BackendKind) -> GatewayError {
    GatewayError::connection(
        ConnectionCause::DriverUnavailable,
        format!("the {backend} backend is not compiled into this build (cargo feature `{}`)", backend.feature()),
    )
}

impl DatabaseDriver for Driver {
    fn backend(&self) -> BackendKind {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.backend(),
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.backend(),
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.backend(),
            Self::Unavailable(kind) => *kind,
        }
    }

    fn timeout_support(&self) -> TimeoutSupport {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.timeout_support(),
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.timeout_support(),
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.timeout_support(),
            Self::Unavailable(_) => TimeoutSupport::Native,
        }
    }

    async fn connect(&self) -> Result<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.connect().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.connect().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.connect().await,
            Self::Unavailable(kind) => Err(unavailable(*kind)),
        }
    }

    async fn execute(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryOutcome> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.execute(sql, options).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.execute(sql, options).await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.execute(sql, options).await,
            Self::Unavailable(kind) => Err(unavailable(*kind)),
        }
    }

    async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.list_tables().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.list_tables().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.list_tables().await,
            Self::Unavailable(kind) => Err(unavailable(*kind)),
        }
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.describe_table(table).await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.describe_table(table).await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.describe_table(table).await,
            Self::Unavailable(kind) => Err(unavailable(*kind)),
        }
    }

    async fn ping(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.ping().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.ping().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.ping().await,
            Self::Unavailable(_) => false,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite(d) => d.close().await,
            #[cfg(feature = "postgres")]
            Self::Postgres(d) => d.close().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(d) => d.close().await,
            Self::Unavailable(_) => Ok(()),
        }
    }
}

// ============================================================================
// Shared statement helpers
// ============================================================================

/// Whether the statement returns rows and falls under the row cap
#[must_use]
pub fn is_read_query(sql: &str) -> bool {
    classifier::leading_keyword(sql).is_some_and(|kw| READ_KEYWORDS.contains(&kw.as_str()))
}

/// Whether the statement can be wrapped in a limiting subquery
///
/// Data-modifying CTEs (`WITH x AS (DELETE ...)`) are never wrapped.
#[must_use]
pub fn is_wrappable(sql: &str) -> bool {
    classifier::leading_keyword(sql).is_some_and(|kw| WRAPPABLE_KEYWORDS.contains(&kw.as_str()))
        && classifier::find_mutation_keyword(sql).is_none()
}

/// Wrap a read statement so the server returns at most `fetch` rows
///
/// Newlines around the body keep a trailing `--` comment from swallowing the closing paren.
#[must_use]
pub fn wrap_with_limit(sql: &str, fetch: usize) -> String {
    let body = classifier::strip_trailing_semicolon(sql);
    format!("SELECT * FROM (\n{body}\n) AS {WRAP_ALIAS} LIMIT {fetch}")
}

/// Split collected rows into the returned window and the truncation flag
///
/// `rows` may hold one more row than `limit`; that extra row only signals truncation.
#[must_use]
pub fn cap_rows(columns: Vec<String>, mut rows: Vec<Vec<Cell>>, limit: usize, total_rows: Option<u64>) -> RowSet {
    let truncated = rows.len() > limit || total_rows.is_some_and(|t| t > limit as u64);
    rows.truncate(limit);
    RowSet { columns, rows, truncated, total_rows: total_rows.filter(|_| truncated) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serialization() {
        assert_eq!(serde_json::to_string(&BackendKind::Postgres).unwrap(), r#""postgres""#);
        assert_eq!(serde_json::to_string(&BackendKind::Mysql).unwrap(), r#""mysql""#);
        assert_eq!(serde_json::to_string(&BackendKind::Sqlite).unwrap(), r#""sqlite""#);
        let parsed: BackendKind = serde_json::from_str(r#""sqlite""#).unwrap();
        assert_eq!(parsed, BackendKind::Sqlite);
        assert!(serde_json::from_str::<BackendKind>(r#""oracle""#).is_err());
    }

    #[test]
    fn test_read_query_detection() {
        assert!(is_read_query("select 1"));
        assert!(is_read_query("  -- note\nPRAGMA table_info(t)"));
        assert!(is_read_query("EXPLAIN SELECT 1"));
        assert!(is_read_query("SHOW TABLES"));
        assert!(!is_read_query("INSERT INTO t VALUES (1)"));
        assert!(!is_read_query("BEGIN"));
    }

    #[test]
    fn test_wrappable_detection() {
        assert!(is_wrappable("SELECT * FROM t"));
        assert!(is_wrappable("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_wrappable("VALUES (1), (2)"));
        assert!(!is_wrappable("PRAGMA table_info(t)"));
        assert!(!is_wrappable("EXPLAIN SELECT 1"));
        assert!(!is_wrappable("WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone"));
    }

    #[test]
    fn test_wrap_with_limit() {
        assert_eq!(
            wrap_with_limit("SELECT * FROM t -- trailing", 11),
            "SELECT * FROM (\nSELECT * FROM t -- trailing\n) AS querygate_capped LIMIT 11"
        );
        // the terminator is stripped even when it ends a line comment; the comment is unaffected
        assert_eq!(
            wrap_with_limit("SELECT * FROM t -- trailing;", 11),
            "SELECT * FROM (\nSELECT * FROM t -- trailing\n) AS querygate_capped LIMIT 11"
        );
        assert_eq!(wrap_with_limit(" SELECT 1; ", 2), "SELECT * FROM (\nSELECT 1\n) AS querygate_capped LIMIT 2");
    }

    #[test]
    fn test_cap_rows_uses_extra_row_for_truncation() {
        let rows: Vec<Vec<Cell>> = (0..4).map(|i| vec![Cell::Int(i)]).collect();
        let capped = cap_rows(vec!["n".into()], rows.clone(), 3, None);
        assert_eq!(capped.rows.len(), 3);
        assert!(capped.truncated);
        assert_eq!(capped.total_rows, None);

        let exact = cap_rows(vec!["n".into()], rows[..3].to_vec(), 3, None);
        assert!(!exact.truncated);
    }

    #[test]
    fn test_cap_rows_reports_total_only_when_truncated() {
        let rows: Vec<Vec<Cell>> = (0..2).map(|i| vec![Cell::Int(i)]).collect();
        let capped = cap_rows(vec!["n".into()], rows.clone(), 2, Some(2));
        assert!(!capped.truncated);
        assert_eq!(capped.total_rows, None);

        let streamed = cap_rows(vec!["n".into()], rows, 2, Some(9));
        assert!(streamed.truncated);
        assert_eq!(streamed.total_rows, Some(9));
    }

    #[test]
    fn test_timeout_advisory() {
        assert_eq!(TimeoutSupport::Native.advisory(BackendKind::Postgres), None);
        let advisory = TimeoutSupport::Cooperative { max_statement_len: 100 }
            .advisory(BackendKind::Sqlite)
            .unwrap();
        assert!(advisory.contains("sqlite timeouts are cooperative"));
        assert!(advisory.contains("100 characters"));
    }

    #[tokio::test]
    async fn test_unavailable_driver_fails_on_connect() {
        let driver = Driver::Unavailable(BackendKind::Mysql);
        let err = driver.connect().await.unwrap_err();
        assert_eq!(err.connection_cause(), Some(ConnectionCause::DriverUnavailable));
        assert!(err.message().contains("`mysql`"));
        assert!(!driver.ping().await);
        assert!(driver.close().await.is_ok());
    }
}
