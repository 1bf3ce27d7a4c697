//! MCP (Model Context Protocol) Server
//!
//! Manual JSON-RPC 2.0 over stdio, one JSON document per line.
//!
//! # Architecture
//!
//! - **Transport**: requests are read line by line from stdin; each request is handled on its own
//!   task so a slow query does not hold up other calls, and responses are written to stdout by a
//!   single writer task
//! - **State**: one [`Gateway`] (and therefore one connection registry) per server lifetime;
//!   connections opened by earlier calls are reused and all of them are closed on EOF
//! - **Tool results**: plain text content; failures set `isError: true`
//!
//! # MCP Tools
//!
//! - `query` - Run one SQL statement under the read-only policy and row cap
//! - `describe_schema` - List tables, or describe one table's columns
//! - `list_connections` - Configured connections with mode and live status
//!
//! # Usage
//!
//! Start the server with `querygate mcp`. Client configuration:
//! ```json
//! {
//!   "mcpServers": {
//!     "querygate": {
//!       "command": "querygate",
//!       "args": ["mcp"]
//!     }
//!   }
//! }
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::gateway::{render_connections, Gateway, QueryRequest};
use crate::output::OutputFormat;

const PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn result(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn error(id: Option<Value>, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcError {
    const PARSE_ERROR: i32 = -32700;
    const METHOD_NOT_FOUND: i32 = -32601;
    const INVALID_PARAMS: i32 = -32602;
    const INTERNAL_ERROR: i32 = -32603;

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    fn text(text: String, is_error: bool) -> Self {
        Self { content: vec![TextContent { content_type: "text", text }], is_error }
    }

    fn from_result(result: crate::Result<String>) -> Self {
        match result {
            Ok(text) => Self::text(text, false),
            Err(e) => Self::text(e.render(), true),
        }
    }
}

// ============================================================================
// Tool Arguments
// ============================================================================

/// Arguments of the `query` tool
#[derive(Debug, Deserialize, JsonSchema)]
struct QueryArgs {
    /// Exactly one SQL statement. Mutations are refused unless the connection is read-write.
    sql: String,
    /// Connection name; omit to use the default connection
    #[serde(default)]
    connection: Option<String>,
    /// Output encoding (default: table)
    #[serde(default)]
    format: Option<OutputFormat>,
    /// Maximum rows to return; capped by the configured maximum
    #[serde(default)]
    limit: Option<usize>,
}

/// Arguments of the `describe_schema` tool
#[derive(Debug, Default, Deserialize, JsonSchema)]
struct DescribeSchemaArgs {
    /// Connection name; omit to use the default connection
    #[serde(default)]
    connection: Option<String>,
    /// Table to describe; omit to list all tables and views
    #[serde(default)]
    table: Option<String>,
}

/// Arguments of the `list_connections` tool
#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ListConnectionsArgs {}

fn input_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| {
            settings.inline_subschemas = true;
            settings.meta_schema = None;
        })
        .into_generator();
    serde_json::to_value(generator.into_root_schema_for::<T>()).unwrap_or_else(|_| json!({ "type": "object" }))
}

fn parse_args<T: for<'de> Deserialize<'de> + Default>(tool: &str, arguments: Option<Value>) -> crate::Result<T> {
    match arguments {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| crate::GatewayError::invalid_input(format!("invalid arguments for {tool}: {e}"))),
    }
}

// ============================================================================
// MCP Server
// ============================================================================

/// Run the MCP server until stdin closes
///
/// In-flight calls finish and every live connection is closed before this returns.
///
/// # Errors
///
/// Returns an error if stdio fails.
pub async fn serve(gateway: Gateway) -> Result<()> {
    let gateway = Arc::new(gateway);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    info!("mcp: serving on stdio");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    JsonRpcResponse::error(None, JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("Parse error: {e}")));
                send(&tx, &response);
                continue;
            }
        };

        let gateway = Arc::clone(&gateway);
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(response) = handle_request(&gateway, request).await {
                send(&tx, &response);
            }
        });
    }

    debug!("mcp: stdin closed, draining in-flight calls");
    while in_flight.join_next().await.is_some() {}
    drop(tx);
    writer.await.map_err(|e| anyhow!("stdout writer failed: {e}"))??;

    gateway.shutdown().await;
    Ok(())
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            if tx.send(line).is_err() {
                warn!("mcp: stdout writer is gone, dropping response");
            }
        }
        Err(e) => warn!(error = %e, "mcp: failed to serialize response"),
    }
}

/// Route one request; notifications get no response
async fn handle_request(gateway: &Gateway, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    if request.method.starts_with("notifications/") {
        debug!(method = %request.method, "mcp: notification");
        return None;
    }

    let result = match request.method.as_str() {
        "initialize" => Ok(handle_initialize()),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(handle_list_tools()),
        "tools/call" => handle_call_tool(gateway, request.params).await,
        other => Err(JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, format!("Unknown method: {other}"))),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::result(request.id, value),
        Err(error) => JsonRpcResponse::error(request.id, error),
    })
}

// ============================================================================
// MCP Protocol Handlers
// ============================================================================

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "querygate",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

fn handle_list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "query",
                "description": "Run exactly one SQL statement against a configured connection. Connections are read-only unless configured otherwise: statements containing INSERT, UPDATE, DELETE, DROP, ALTER, CREATE and similar keywords are refused with an explanation, as are multiple statements. Results are capped at the configured row limit; the output says when rows were cut off.",
                "inputSchema": input_schema::<QueryArgs>()
            },
            {
                "name": "describe_schema",
                "description": "List the tables and views of a connection, or pass 'table' to get its columns (type, nullability, default, primary key).",
                "inputSchema": input_schema::<DescribeSchemaArgs>()
            },
            {
                "name": "list_connections",
                "description": "List configured connections with backend, location (credentials removed), read-only or read-write mode, and whether each is currently connected.",
                "inputSchema": input_schema::<ListConnectionsArgs>()
            }
        ]
    })
}

async fn handle_call_tool(gateway: &Gateway, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let mut params = params.ok_or_else(|| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "Missing params"))?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "Missing tool name"))?
        .to_string();
    let arguments = params.get_mut("arguments").map(Value::take);

    debug!(tool = %name, "mcp: tool call");
    let result = match name.as_str() {
        "query" => CallToolResult::from_result(tool_query(gateway, arguments).await),
        "describe_schema" => CallToolResult::from_result(tool_describe_schema(gateway, arguments).await),
        "list_connections" => CallToolResult::from_result(
            parse_args::<ListConnectionsArgs>("list_connections", arguments)
                .and_then(|_| render_connections(&gateway.list_connections())),
        ),
        other => CallToolResult::text(format!("Unknown tool: {other}"), true),
    };

    serde_json::to_value(result).map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
}

async fn tool_query(gateway: &Gateway, arguments: Option<Value>) -> crate::Result<String> {
    let arguments = arguments.ok_or_else(|| crate::GatewayError::invalid_input("query requires 'sql'"))?;
    let args: QueryArgs = serde_json::from_value(arguments)
        .map_err(|e| crate::GatewayError::invalid_input(format!("invalid arguments for query: {e}")))?;

    let request = QueryRequest {
        connection: args.connection,
        sql: args.sql,
        limit: args.limit,
        format: args.format.unwrap_or_default(),
    };
    gateway.query_text(&request).await
}

async fn tool_describe_schema(gateway: &Gateway, arguments: Option<Value>) -> crate::Result<String> {
    let args: DescribeSchemaArgs = parse_args("describe_schema", arguments)?;
    gateway.schema_text(args.connection.as_deref(), args.table.as_deref()).await
}
