//! `SQLite` Driver
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`, `file:` URIs)
//! - In-memory connections (`:memory:`)
//! - Introspection via `sqlite_master` and `pragma_table_info`
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous); every call runs on the blocking pool with the connection's
//!   owned mutex guard moved into the task, so one statement runs at a time per connection
//! - Files are opened read-write but never created; a missing file is `FileNotFound`
//! - Read-only mode is enforced with `PRAGMA query_only`
//! - Timeouts are cooperative: `sqlite3_interrupt`, repeated from the deadline until the worker stops,
//!   plus a statement length bound

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, Statement};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classifier::strip_trailing_semicolon;
use crate::engine::{
    cap_rows, is_wrappable, wrap_with_limit, BackendKind, ColumnDescriptor, DatabaseDriver, ExecuteOptions,
    QueryOutcome, TableKind, TableSummary, TimeoutSupport, COUNT_AHEAD_LIMIT,
};
use crate::error::{ConnectionCause, GatewayError, Result};
use crate::output::Cell;

/// Location that opens a private in-memory database
pub const MEMORY_LOCATION: &str = ":memory:";

/// Longest statement accepted, in characters
pub const MAX_STATEMENT_LEN: usize = 100_000;

/// How long a statement waits on a locked database file before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between repeated interrupts while waiting for a timed-out worker
const INTERRUPT_RETRY: Duration = Duration::from_millis(25);

type ColumnsAndRows = (Vec<String>, Vec<Vec<Cell>>, Option<u64>);

/// `SQLite` driver holding a single connection
pub struct SqliteDriver {
    location: String,
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: StdMutex<Option<InterruptHandle>>,
}

impl SqliteDriver {
    /// Create an unconnected driver
    #[must_use]
    pub fn new(location: &str) -> Self {
        Self {
            location: location.trim().to_string(),
            conn: Arc::new(Mutex::new(None)),
            interrupt: StdMutex::new(None),
        }
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let conn = guard.as_ref().ok_or_else(not_connected)?;
            f(conn)
        })
        .await
        .map_err(join_error)?
    }

    fn interrupt_running(&self) {
        let handle = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle.as_ref() {
            handle.interrupt();
        }
    }
}

impl DatabaseDriver for SqliteDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn timeout_support(&self) -> TimeoutSupport {
        TimeoutSupport::Cooperative { max_statement_len: MAX_STATEMENT_LEN }
    }

    async fn connect(&self) -> Result<()> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let location = self.location.clone();

        let handle = tokio::task::spawn_blocking(move || -> Result<InterruptHandle> {
            let mut guard = guard;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.get_interrupt_handle());
            }
            let conn = open_connection(&location)?;
            let handle = conn.get_interrupt_handle();
            *guard = Some(conn);
            Ok(handle)
        })
        .await
        .map_err(join_error)??;

        *self.interrupt.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(location = %self.location, "sqlite: connected");
        Ok(())
    }

    async fn execute(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryOutcome> {
        let length = sql.chars().count();
        if length > MAX_STATEMENT_LEN {
            return Err(GatewayError::invalid_input(format!(
                "Statement is {length} characters long; SQLite connections accept at most {MAX_STATEMENT_LEN}"
            )));
        }

        let sql = sql.to_string();
        let options = *options;
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let mut task = tokio::task::spawn_blocking(move || {
            let conn = guard.as_ref().ok_or_else(not_connected)?;
            run_statement(conn, &sql, &options, &worker_cancelled)
        });

        let finished = tokio::time::timeout(options.timeout, &mut task).await;
        match finished {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                // an interrupt issued before the worker's first step is lost, so repeat until it lands
                loop {
                    self.interrupt_running();
                    if tokio::time::timeout(INTERRUPT_RETRY, &mut task).await.is_ok() {
                        break;
                    }
                }
                warn!(timeout_ms = options.timeout_ms(), "sqlite: statement interrupted at deadline");
                Err(GatewayError::timeout(options.timeout_ms()))
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, type FROM sqlite_master
                     WHERE type IN ('table', 'view')
                     AND name NOT LIKE 'sqlite_%'
                     ORDER BY name",
                )
                .map_err(engine_error("Failed to query tables"))?;

            let tables = stmt
                .query_map([], |row| {
                    let name: String = row.get(0)?;
                    let kind: String = row.get(1)?;
                    Ok(TableSummary {
                        name,
                        kind: if kind == "view" { TableKind::View } else { TableKind::Table },
                    })
                })
                .map_err(engine_error("Failed to fetch table names"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(engine_error("Failed to collect table names"))?;

            Ok(tables)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master
                     WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE)",
                    [&table],
                    |row| row.get(0),
                )
                .map_err(engine_error("Failed to look up table"))?;
            if !exists {
                return Err(GatewayError::table_not_found(&table));
            }

            let mut stmt = conn
                .prepare(
                    "SELECT name, type, \"notnull\", dflt_value, pk
                     FROM pragma_table_info(?1)
                     ORDER BY cid",
                )
                .map_err(engine_error("Failed to prepare table_info"))?;

            let columns = stmt
                .query_map([&table], |row| {
                    Ok(ColumnDescriptor {
                        name: row.get(0)?,
                        data_type: row.get(1)?,
                        nullable: row.get::<_, i64>(2)? == 0, // notnull: 0 = nullable
                        default: row.get(3)?,
                        primary_key: row.get::<_, i64>(4)? > 0,
                    })
                })
                .map_err(engine_error("Failed to query columns"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(engine_error("Failed to collect columns"))?;

            Ok(columns)
        })
        .await
    }

    async fn ping(&self) -> bool {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(engine_error("Ping failed"))
        })
        .await
        .is_ok()
    }

    async fn close(&self) -> Result<()> {
        let taken = self.conn.lock().await.take();
        self.interrupt.lock().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(conn) = taken {
            conn.close()
                .map_err(|(_, e)| GatewayError::engine_error("sqlite", format!("Failed to close connection: {e}")))?;
            debug!(location = %self.location, "sqlite: closed");
        }
        Ok(())
    }
}

/// Open and probe a connection without ever creating a file
fn open_connection(location: &str) -> Result<Connection> {
    let conn = if location == MEMORY_LOCATION {
        Connection::open_in_memory()
    } else {
        if !location.starts_with("file:") && !Path::new(location).exists() {
            return Err(GatewayError::connection(
                ConnectionCause::FileNotFound,
                format!("'{location}' does not exist"),
            ));
        }
        Connection::open_with_flags(
            location,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
    .map_err(|e| translate_open_error(location, &e))?;

    conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| translate_open_error(location, &e))?;

    // a file that is not a database only fails once it is read
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|e| translate_open_error(location, &e))?;

    Ok(conn)
}

fn translate_open_error(location: &str, err: &rusqlite::Error) -> GatewayError {
    let cause = match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen) => ConnectionCause::FileNotFound,
        _ => ConnectionCause::Other,
    };
    GatewayError::connection(cause, format!("cannot open SQLite database '{location}': {err}"))
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    options: &ExecuteOptions,
    cancelled: &AtomicBool,
) -> Result<QueryOutcome> {
    if cancelled.load(Ordering::SeqCst) {
        return Err(interrupted());
    }
    conn.pragma_update(None, "query_only", options.read_only)
        .map_err(engine_error("Failed to set query_only"))?;

    let sql = strip_trailing_semicolon(sql);
    let limit = options.row_limit;

    if is_wrappable(sql) {
        match conn.prepare(&wrap_with_limit(sql, limit + 1)) {
            // the subquery renames repeated columns ("a", "a:1"), so only keep the wrap when names survive
            Ok(mut stmt) if same_columns(conn, sql, &stmt) => {
                let (columns, rows, _) = collect_rows(&mut stmt, limit + 1, false, cancelled)?;
                return Ok(QueryOutcome::Rows(cap_rows(columns, rows, limit, None)));
            }
            Ok(_) => debug!("sqlite: wrapping would rename columns, streaming instead"),
            Err(e) => debug!(error = %e, "sqlite: wrapped statement rejected, streaming instead"),
        }
    }

    let mut stmt = conn.prepare(sql).map_err(query_failed)?;
    if stmt.column_count() == 0 {
        let changed = stmt.execute([]).map_err(query_failed)?;
        return Ok(QueryOutcome::Affected { rows_affected: changed as u64 });
    }

    let (columns, rows, total) = collect_rows(&mut stmt, limit + 1, true, cancelled)?;
    Ok(QueryOutcome::Rows(cap_rows(columns, rows, limit, total)))
}

fn same_columns(conn: &Connection, sql: &str, wrapped: &Statement<'_>) -> bool {
    conn.prepare(sql).is_ok_and(|plain| plain.column_names() == wrapped.column_names())
}

/// Read up to `fetch` rows; with `count_rest`, keep counting to report a total
fn collect_rows(
    stmt: &mut Statement<'_>,
    fetch: usize,
    count_rest: bool,
    cancelled: &AtomicBool,
) -> Result<ColumnsAndRows> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut seen: u64 = 0;
    let mut cursor = stmt.query([]).map_err(query_failed)?;

    while let Some(row) = cursor.next().map_err(query_failed)? {
        if cancelled.load(Ordering::Relaxed) {
            return Err(interrupted());
        }
        seen += 1;
        if rows.len() < fetch {
            let cells = (0..width)
                .map(|idx| row.get_ref(idx).map(cell_from_value).map_err(query_failed))
                .collect::<Result<Vec<_>>>()?;
            rows.push(cells);
        } else if !count_rest {
            break;
        } else if seen > fetch as u64 + COUNT_AHEAD_LIMIT {
            return Ok((columns, rows, None));
        }
    }

    Ok((columns, rows, count_rest.then_some(seen)))
}

fn cell_from_value(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Int(i),
        ValueRef::Real(f) => Cell::Float(f),
        ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Cell::blob(b),
    }
}

fn not_connected() -> GatewayError {
    GatewayError::engine_error("sqlite", "connection is not open")
}

fn interrupted() -> GatewayError {
    GatewayError::query_failed("interrupted")
}

fn join_error(e: tokio::task::JoinError) -> GatewayError {
    GatewayError::engine_error("sqlite", format!("Worker task failed: {e}"))
}

fn query_failed(e: rusqlite::Error) -> GatewayError {
    GatewayError::query_failed(e.to_string())
}

fn engine_error(context: &'static str) -> impl Fn(rusqlite::Error) -> GatewayError {
    move |e| GatewayError::engine_error("sqlite", format!("{context}: {e}"))
}
