//! Gateway Façade
//!
//! Every surface (CLI, MCP tools) goes through [`Gateway`]. A query request flows through:
//!
//! 1. Resolve the connection name (explicit, default, or sole connection)
//! 2. Resolve the effective read-only mode for that connection
//! 3. Classify the SQL; a denial is returned as an outcome and nothing connects
//! 4. Acquire the live connection from the registry and execute with the row cap and timeout
//! 5. Render the outcome
//!
//! `execute_query` and `describe_schema` never fail: errors come back rendered as
//! `Error [CODE]: message`. `query_text` and `schema_text` return the same text with errors kept
//! typed.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::classifier::{classify, Verdict};
use crate::config::GatewayConfig;
use crate::engine::{
    BackendKind, ColumnDescriptor, DatabaseDriver, ExecuteOptions, QueryOutcome, RowSet, TableSummary,
};
use crate::error::{GatewayError, Result};
use crate::output::{render_outcome, render_rows, Cell, OutputFormat};
use crate::policy::{effective_read_only, mode_label};
use crate::registry::{ConnectionRegistry, LiveConnection};

/// One query to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Target connection; `None` uses the default
    pub connection: Option<String>,
    pub sql: String,
    /// Requested row limit; capped by the configured maximum
    pub limit: Option<usize>,
    pub format: OutputFormat,
}

impl QueryRequest {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self { connection: None, sql: sql.into(), limit: None, format: OutputFormat::default() }
    }

    #[must_use]
    pub fn on(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Result of [`Gateway::run_query`]
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    /// Connection the request resolved to
    pub connection: String,
    pub outcome: QueryOutcome,
    /// Timeout advisory, present the first time a cooperative-timeout connection is used
    pub advisory: Option<String>,
}

/// Row of `list_connections`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub is_default: bool,
    pub backend: BackendKind,
    /// Location with credentials and query parameters removed
    pub location: String,
    /// `read-only` or `read-write`
    pub mode: &'static str,
    /// A driver is currently connected
    pub live: bool,
}

/// Entry point shared by every surface
pub struct Gateway {
    config: GatewayConfig,
    registry: ConnectionRegistry,
}

impl Gateway {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let registry = ConnectionRegistry::default().with_connect_timeout(config.query_timeout());
        Self::with_registry(config, registry)
    }

    #[must_use]
    pub const fn with_registry(config: GatewayConfig, registry: ConnectionRegistry) -> Self {
        Self { config, registry }
    }

    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Rows a request may return: the requested limit, never above the configured cap
    pub fn row_limit(&self, requested: Option<usize>) -> Result<usize> {
        let cap = self.config.row_cap();
        match requested {
            Some(0) => Err(GatewayError::invalid_input("limit must be at least 1")),
            Some(limit) => Ok(limit.min(cap)),
            None => Ok(cap),
        }
    }

    async fn live(&self, connection: Option<&str>) -> Result<Arc<LiveConnection>> {
        let name = self.config.resolve_name(connection)?;
        let spec = self.config.connection(&name)?;
        self.registry.get_or_connect(&name, spec).await
    }

    /// Run catalog work under the same timeout as queries
    async fn bounded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.query_timeout();
        tokio::time::timeout(timeout, work)
            .await
            .unwrap_or_else(|_| Err(GatewayError::timeout(self.config.query_timeout_ms)))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Classify and execute one statement
    pub async fn run_query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let name = self.config.resolve_name(request.connection.as_deref())?;
        let spec = self.config.connection(&name)?;

        let sql = request.sql.trim();
        if sql.is_empty() {
            return Err(GatewayError::invalid_input("SQL statement is empty"));
        }
        let row_limit = self.row_limit(request.limit)?;

        // recomputed per request so config changes apply without reconnecting
        let read_only = effective_read_only(spec.read_only, self.config.allow_mutations);
        debug!(connection = %name, mode = mode_label(read_only), row_limit, "classifying query");

        if let Verdict::Denied { reason } = classify(sql, !read_only) {
            warn!(connection = %name, %reason, "query denied");
            return Ok(QueryResponse { connection: name, outcome: QueryOutcome::Denied { reason }, advisory: None });
        }

        let live = self.registry.get_or_connect(&name, spec).await?;
        let options = ExecuteOptions { row_limit, timeout: self.config.query_timeout(), read_only };
        let outcome = live.driver().execute(sql, &options).await?;

        if let QueryOutcome::Rows(rows) = &outcome {
            debug!(connection = %name, rows = rows.row_count(), truncated = rows.truncated, "query finished");
        }

        let advisory = live.take_advisory();
        if let Some(advisory) = &advisory {
            warn!(connection = %name, "{advisory}");
        }
        Ok(QueryResponse { connection: name, outcome, advisory })
    }

    /// Execute and render the outcome, followed by the advisory when there is one
    pub async fn query_text(&self, request: &QueryRequest) -> Result<String> {
        let response = self.run_query(request).await?;
        let body = render_outcome(&response.outcome, request.format)?;
        Ok(match response.advisory {
            Some(advisory) => format!("{body}\n\n{advisory}"),
            None => body,
        })
    }

    /// Execute and render; errors are rendered too
    pub async fn execute_query(
        &self,
        connection: Option<&str>,
        sql: &str,
        format: Option<OutputFormat>,
        limit: Option<usize>,
    ) -> String {
        let request = QueryRequest {
            connection: connection.map(str::to_string),
            sql: sql.to_string(),
            limit,
            format: format.unwrap_or_default(),
        };
        self.query_text(&request).await.unwrap_or_else(|e| e.render())
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Tables and views of a connection, ordered by name
    pub async fn list_tables(&self, connection: Option<&str>) -> Result<Vec<TableSummary>> {
        let live = self.live(connection).await?;
        self.bounded(live.driver().list_tables()).await
    }

    /// Columns of one table
    pub async fn describe_table(&self, connection: Option<&str>, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let table = table.trim();
        if table.is_empty() {
            return Err(GatewayError::invalid_input("table name is empty"));
        }
        let live = self.live(connection).await?;
        self.bounded(live.driver().describe_table(table)).await
    }

    /// The table list, or one table's columns when `table` is given, as text
    pub async fn schema_text(&self, connection: Option<&str>, table: Option<&str>) -> Result<String> {
        match table {
            Some(table) => {
                let columns = self.describe_table(connection, table).await?;
                render_columns(table.trim(), &columns)
            }
            None => render_tables(&self.list_tables(connection).await?),
        }
    }

    /// Render the schema; errors are rendered too
    pub async fn describe_schema(&self, connection: Option<&str>, table: Option<&str>) -> String {
        self.schema_text(connection, table).await.unwrap_or_else(|e| e.render())
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Every configured connection with its effective mode and live status
    #[must_use]
    pub fn list_connections(&self) -> Vec<ConnectionStatus> {
        let default = self.config.resolve_name(None).ok();
        self.config
            .connections
            .iter()
            .map(|(name, spec)| ConnectionStatus {
                name: name.clone(),
                is_default: default.as_deref() == Some(name.as_str()),
                backend: spec.backend,
                location: spec.masked_location(),
                mode: mode_label(effective_read_only(spec.read_only, self.config.allow_mutations)),
                live: self.registry.is_live(name),
            })
            .collect()
    }

    /// Connect if needed, then ping; a ping that outlasts the query timeout counts as no answer
    pub async fn check_connection(&self, connection: Option<&str>) -> Result<bool> {
        let live = self.live(connection).await?;
        Ok(tokio::time::timeout(self.config.query_timeout(), live.driver().ping()).await.unwrap_or(false))
    }

    /// Close every live connection
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Render connection statuses as a table
pub fn render_connections(statuses: &[ConnectionStatus]) -> Result<String> {
    if statuses.is_empty() {
        return Ok("No connections configured.".to_string());
    }
    let rows = RowSet {
        columns: ["name", "default", "backend", "location", "mode", "status"].map(String::from).to_vec(),
        rows: statuses
            .iter()
            .map(|s| {
                vec![
                    Cell::text(&s.name),
                    Cell::text(if s.is_default { "*" } else { "" }),
                    Cell::text(s.backend.as_str()),
                    Cell::text(&s.location),
                    Cell::text(s.mode),
                    Cell::text(if s.live { "connected" } else { "idle" }),
                ]
            })
            .collect(),
        truncated: false,
        total_rows: None,
    };
    render_rows(&rows, OutputFormat::Table)
}

fn render_tables(tables: &[TableSummary]) -> Result<String> {
    if tables.is_empty() {
        return Ok("No tables found.".to_string());
    }
    let rows = RowSet {
        columns: vec!["name".to_string(), "kind".to_string()],
        rows: tables.iter().map(|t| vec![Cell::text(&t.name), Cell::text(t.kind.as_str())]).collect(),
        truncated: false,
        total_rows: None,
    };
    render_rows(&rows, OutputFormat::Table)
}

fn render_columns(table: &str, columns: &[ColumnDescriptor]) -> Result<String> {
    let rows = RowSet {
        columns: ["column", "type", "nullable", "default", "primary_key"].map(String::from).to_vec(),
        rows: columns
            .iter()
            .map(|c| {
                vec![
                    Cell::text(&c.name),
                    Cell::text(&c.data_type),
                    Cell::text(if c.nullable { "YES" } else { "NO" }),
                    c.default.as_ref().map_or(Cell::text(""), Cell::text),
                    Cell::text(if c.primary_key { "YES" } else { "" }),
                ]
            })
            .collect(),
        truncated: false,
        total_rows: None,
    };
    Ok(format!("Table: {table}\n\n{}", render_rows(&rows, OutputFormat::Table)?))
}
