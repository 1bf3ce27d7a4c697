//! `PostgreSQL` Driver
//!
//! # Features
//! - Connection strings in URL (`postgres://...`) or key/value (`host=... dbname=...`) form
//! - Bounded client pool: 4 permits, idle clients reused
//! - Introspection via `information_schema`
//! - Rich type support (JSON/JSONB, timestamps, UUID, NUMERIC, common arrays)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` with `NoTls`; each client's connection task is spawned on the runtime
//! - Timeouts: session `statement_timeout` plus a client deadline that sends a cancel request and
//!   discards the client
//! - Read-only mode runs every statement inside `START TRANSACTION READ ONLY`
//! - BYTEA renders as its length only

use std::error::Error as StdError;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{pin_mut, TryStreamExt};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, Config, GenericClient, NoTls, Row};
use tracing::{debug, info, warn};

use crate::classifier::strip_trailing_semicolon;
use crate::engine::{
    cap_rows, is_wrappable, wrap_with_limit, BackendKind, ColumnDescriptor, DatabaseDriver, ExecuteOptions,
    QueryOutcome, TableKind, TableSummary, TimeoutSupport, COUNT_AHEAD_LIMIT,
};
use crate::error::{ConnectionCause, GatewayError, Result};
use crate::output::Cell;

/// Concurrent clients per connection name
pub const POOL_SIZE: usize = 4;

/// TCP connect limit used when the connection string sets none
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time the client waits past `statement_timeout` before cancelling on its own
const CLIENT_GRACE: Duration = Duration::from_millis(250);

type SqlError = Box<dyn StdError + Sync + Send>;

/// `PostgreSQL` driver
pub struct PostgresDriver {
    location: String,
    pool: StdMutex<Option<Arc<ClientPool>>>,
}

/// Semaphore-bounded set of clients
struct ClientPool {
    config: Config,
    permits: Arc<Semaphore>,
    idle: StdMutex<Vec<Client>>,
}

impl ClientPool {
    fn new(config: Config) -> Self {
        Self { config, permits: Arc::new(Semaphore::new(POOL_SIZE)), idle: StdMutex::new(Vec::new()) }
    }

    /// Wait for a permit, then reuse an idle client or open a new one
    async fn checkout(&self) -> Result<(Client, OwnedSemaphorePermit)> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::engine_error("postgres", "connection pool is closed"))?;

        let reused = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| idle.pop()).find(|client| !client.is_closed())
        };

        let client = match reused {
            Some(client) => client,
            None => open_client(&self.config).await.map_err(|e| translate_connect_error(&e))?,
        };
        Ok((client, permit))
    }

    fn checkin(&self, client: Client) {
        if !client.is_closed() && !self.permits.is_closed() {
            self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(client);
        }
    }

    fn shutdown(&self) {
        self.permits.close();
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl PostgresDriver {
    /// Create an unconnected driver
    #[must_use]
    pub fn new(location: &str) -> Self {
        Self { location: location.trim().to_string(), pool: StdMutex::new(None) }
    }

    fn pool(&self) -> Result<Arc<ClientPool>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GatewayError::engine_error("postgres", "connection is not open"))
    }

    /// Run a catalog query on a pooled client
    async fn catalog_query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        let pool = self.pool()?;
        let (client, permit) = pool.checkout().await?;
        let rows = client.query(sql, params).await;
        pool.checkin(client);
        drop(permit);
        rows.map_err(|e| GatewayError::engine_error("postgres", format!("Catalog query failed: {}", db_message(&e))))
    }
}

impl DatabaseDriver for PostgresDriver {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn timeout_support(&self) -> TimeoutSupport {
        TimeoutSupport::Native
    }

    async fn connect(&self) -> Result<()> {
        if self.pool().is_ok() {
            return Ok(());
        }

        let mut config = Config::from_str(&self.location).map_err(|e| {
            GatewayError::connection(ConnectionCause::Other, format!("invalid PostgreSQL connection string: {e}"))
        })?;
        if config.get_connect_timeout().is_none() {
            config.connect_timeout(DEFAULT_CONNECT_TIMEOUT);
        }

        let pool = Arc::new(ClientPool::new(config));
        let (client, permit) = pool.checkout().await?;
        let probe = client.simple_query("SELECT 1").await;
        if let Err(e) = probe {
            return Err(translate_connect_error(&e));
        }
        pool.checkin(client);
        drop(permit);

        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        info!("postgres: connected");
        Ok(())
    }

    async fn execute(&self, sql: &str, options: &ExecuteOptions) -> Result<QueryOutcome> {
        let pool = self.pool()?;
        // opening a fresh client counts against the same budget as the statement
        let (mut client, permit) = tokio::time::timeout(options.timeout, pool.checkout())
            .await
            .map_err(|_| GatewayError::timeout(options.timeout_ms()))??;
        let cancel = client.cancel_token();

        let deadline = options.timeout + CLIENT_GRACE;
        let finished = tokio::time::timeout(deadline, run_statement(&mut client, sql, options)).await;
        match finished {
            Ok(result) => {
                pool.checkin(client);
                drop(permit);
                result
            }
            Err(_) => {
                warn!(timeout_ms = options.timeout_ms(), "postgres: client deadline reached, cancelling");
                if let Err(e) = cancel.cancel_query(NoTls).await {
                    debug!(error = %e, "postgres: cancel request failed");
                }
                drop(client);
                drop(permit);
                Err(GatewayError::timeout(options.timeout_ms()))
            }
        }
    }

    async fn list_tables(&self) -> Result<Vec<TableSummary>> {
        let rows = self
            .catalog_query(
                "SELECT table_schema::text, table_name::text, table_type::text,
                        table_schema = current_schema()
                 FROM information_schema.tables
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
                   AND table_schema NOT LIKE 'pg_toast%'
                   AND table_schema NOT LIKE 'pg_temp%'",
                &[],
            )
            .await?;

        let mut tables: Vec<TableSummary> = rows
            .iter()
            .map(|row| {
                let schema: String = row.get(0);
                let name: String = row.get(1);
                let table_type: String = row.get(2);
                let in_current: Option<bool> = row.get(3);
                TableSummary {
                    name: if in_current.unwrap_or(false) { name } else { format!("{schema}.{name}") },
                    kind: if table_type == "VIEW" { TableKind::View } else { TableKind::Table },
                }
            })
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };

        let exists = self
            .catalog_query(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = COALESCE($1::text, current_schema()) AND table_name = $2::text
                 )",
                &[&schema, &name],
            )
            .await?;
        if !exists.first().is_some_and(|row| row.get::<_, bool>(0)) {
            return Err(GatewayError::table_not_found(table));
        }

        let rows = self
            .catalog_query(
                "SELECT c.column_name::text, c.data_type::text, c.is_nullable = 'YES', c.column_default::text,
                        EXISTS (
                            SELECT 1 FROM information_schema.table_constraints tc
                            JOIN information_schema.key_column_usage k
                              ON k.constraint_name = tc.constraint_name
                             AND k.table_schema = tc.table_schema
                             AND k.table_name = tc.table_name
                            WHERE tc.constraint_type = 'PRIMARY KEY'
                              AND tc.table_schema = c.table_schema
                              AND tc.table_name = c.table_name
                              AND k.column_name = c.column_name
                        )
                 FROM information_schema.columns c
                 WHERE c.table_schema = COALESCE($1::text, current_schema()) AND c.table_name = $2::text
                 ORDER BY c.ordinal_position",
                &[&schema, &name],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnDescriptor {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get(2),
                default: row.get(3),
                primary_key: row.get(4),
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        let Ok(pool) = self.pool() else {
            return false;
        };
        let Ok((client, permit)) = pool.checkout().await else {
            return false;
        };
        let alive = client.simple_query("SELECT 1").await.is_ok();
        pool.checkin(client);
        drop(permit);
        alive
    }

    async fn close(&self) -> Result<()> {
        let taken = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = taken {
            pool.shutdown();
            debug!("postgres: pool closed");
        }
        Ok(())
    }
}

async fn open_client(config: &Config) -> std::result::Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;

    // Connection errors are logged without the config to keep credentials out of logs
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "postgres: connection task ended");
        }
    });

    Ok(client)
}

fn translate_connect_error(e: &tokio_postgres::Error) -> GatewayError {
    let cause = match e.as_db_error().map(|db| db.code()) {
        Some(code) if *code == SqlState::INVALID_PASSWORD || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION => {
            ConnectionCause::AuthenticationFailed
        }
        Some(code) if *code == SqlState::INVALID_CATALOG_NAME => ConnectionCause::DatabaseNotFound,
        Some(_) => ConnectionCause::Other,
        None if e.source().is_some_and(|s| s.downcast_ref::<std::io::Error>().is_some()) => ConnectionCause::Refused,
        None => ConnectionCause::Other,
    };
    GatewayError::connection(cause, db_message(e))
}

fn db_message(e: &tokio_postgres::Error) -> String {
    e.as_db_error().map_or_else(|| e.to_string(), |db| db.message().to_string())
}

fn query_error(e: &tokio_postgres::Error, timeout_ms: u64) -> GatewayError {
    if e.code() == Some(&SqlState::QUERY_CANCELED) {
        GatewayError::timeout(timeout_ms)
    } else {
        GatewayError::query_failed(db_message(e))
    }
}

async fn run_statement(client: &mut Client, sql: &str, options: &ExecuteOptions) -> Result<QueryOutcome> {
    let timeout_ms = options.timeout_ms();
    client
        .batch_execute(&format!("SET statement_timeout = {timeout_ms}"))
        .await
        .map_err(|e| query_error(&e, timeout_ms))?;

    let sql = strip_trailing_semicolon(sql);
    if options.read_only {
        let tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|e| query_error(&e, timeout_ms))?;
        let outcome = run_in(&tx, sql, options.row_limit, timeout_ms).await?;
        tx.commit().await.map_err(|e| query_error(&e, timeout_ms))?;
        Ok(outcome)
    } else {
        run_in(&*client, sql, options.row_limit, timeout_ms).await
    }
}

async fn run_in<C: GenericClient + Sync>(client: &C, sql: &str, limit: usize, timeout_ms: u64) -> Result<QueryOutcome> {
    let err = |e: tokio_postgres::Error| query_error(&e, timeout_ms);

    if is_wrappable(sql) {
        let stmt = client.prepare(&wrap_with_limit(sql, limit + 1)).await.map_err(err)?;
        let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = client.query(&stmt, &[]).await.map_err(err)?;
        let cells = rows.iter().map(row_cells).collect::<Result<Vec<_>>>()?;
        return Ok(QueryOutcome::Rows(cap_rows(columns, cells, limit, None)));
    }

    let stmt = client.prepare(sql).await.map_err(err)?;
    if stmt.columns().is_empty() {
        let rows_affected = client.execute(&stmt, &[]).await.map_err(err)?;
        return Ok(QueryOutcome::Affected { rows_affected });
    }

    let columns = stmt.columns().iter().map(|c| c.name().to_string()).collect();
    let stream = client.query_raw(&stmt, std::iter::empty::<i32>()).await.map_err(err)?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    let mut seen: u64 = 0;
    let mut complete = true;
    while let Some(row) = stream.try_next().await.map_err(err)? {
        seen += 1;
        if rows.len() <= limit {
            rows.push(row_cells(&row)?);
        } else if seen > limit as u64 + 1 + COUNT_AHEAD_LIMIT {
            complete = false;
            break;
        }
    }

    Ok(QueryOutcome::Rows(cap_rows(columns, rows, limit, complete.then_some(seen))))
}

fn row_cells(row: &Row) -> Result<Vec<Cell>> {
    row.columns().iter().enumerate().map(|(idx, column)| cell_at(row, idx, column.type_())).collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx)
        .map_err(|e| GatewayError::query_failed(format!("Failed to read column {idx}: {e}")))
}

fn array_cell<'a, T>(row: &'a Row, idx: usize) -> Result<Cell>
where
    T: FromSql<'a> + Into<Value>,
{
    Ok(get::<Vec<Option<T>>>(row, idx)?.map_or(Cell::Null, |items| {
        Cell::Json(Value::Array(items.into_iter().map(|v| v.map_or(Value::Null, Into::into)).collect()))
    }))
}

/// Convert `PostgreSQL` value to a cell
fn cell_at(row: &Row, idx: usize, ty: &Type) -> Result<Cell> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let cell = match *ty {
        Type::BOOL => get::<bool>(row, idx)?.map_or(Cell::Null, Cell::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map_or(Cell::Null, |v| Cell::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx)?.map_or(Cell::Null, |v| Cell::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx)?.map_or(Cell::Null, Cell::Int),
        Type::OID => get::<u32>(row, idx)?.map_or(Cell::Null, |v| Cell::UInt(v.into())),
        Type::FLOAT4 => get::<f32>(row, idx)?.map_or(Cell::Null, |v| Cell::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx)?.map_or(Cell::Null, Cell::Float),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map_or(Cell::Null, |n| Cell::Text(n.0)),
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?.map_or(Cell::Null, Cell::Json),
        Type::BYTEA => get::<&[u8]>(row, idx)?.map_or(Cell::Null, Cell::blob),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)?
            .map_or(Cell::Null, |v| Cell::Text(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)?.map_or(Cell::Null, |v| Cell::Text(v.to_rfc3339())),
        Type::DATE => get::<NaiveDate>(row, idx)?.map_or(Cell::Null, |v| Cell::Text(v.format("%Y-%m-%d").to_string())),
        Type::TIME => get::<NaiveTime>(row, idx)?.map_or(Cell::Null, |v| Cell::Text(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map_or(Cell::Null, |v| Cell::Text(v.to_string())),
        Type::BOOL_ARRAY => array_cell::<bool>(row, idx)?,
        Type::INT2_ARRAY => array_cell::<i16>(row, idx)?,
        Type::INT4_ARRAY => array_cell::<i32>(row, idx)?,
        Type::INT8_ARRAY => array_cell::<i64>(row, idx)?,
        Type::FLOAT8_ARRAY => array_cell::<f64>(row, idx)?,
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array_cell::<String>(row, idx)?,
        _ if <String as FromSql<'static>>::accepts(ty) => get::<String>(row, idx)?.map_or(Cell::Null, Cell::Text),
        _ => get::<Opaque>(row, idx)?.map_or(Cell::Null, |_| Cell::Text(format!("<{}>", ty.name()))),
    };

    Ok(cell)
}

/// Any value whose binary format is not decoded; only its presence is reported
struct Opaque;

impl<'a> FromSql<'a> for Opaque {
    fn from_sql(_: &Type, _: &'a [u8]) -> std::result::Result<Self, SqlError> {
        Ok(Self)
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// NUMERIC decoded to its exact decimal text
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, SqlError> {
        decode_numeric(raw).map(Self)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary NUMERIC layout: ndigits, weight, sign, dscale, then base-10000 digits
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, SqlError> {
    let read = |i: usize| -> std::result::Result<u16, SqlError> {
        raw.get(i..i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = usize::from(read(0)?);
    let weight = i32::from(read(2)? as i16);
    let sign = read(4)?;
    let dscale = usize::from(read(6)?);

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits).map(|i| read(8 + 2 * i)).collect::<std::result::Result<Vec<u16>, _>>()?;
    let digit = |group: i32| -> u16 {
        usize::try_from(group).ok().and_then(|g| digits.get(g).copied()).unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for group in 0..=weight {
            if group == 0 {
                out.push_str(&digit(group).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(group)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut group = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(group)));
            group += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
