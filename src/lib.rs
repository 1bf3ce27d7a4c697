//! querygate - Safety-Gated SQL Execution Gateway
//!
//! querygate runs SQL from automated agents and command lines against configured databases. It
//! classifies each statement as mutating or not, refuses mutations unless the connection is
//! read-write, executes under a row cap and a timeout, and renders the result as bounded text.
//!
//! # Core Principles
//! - Read-only by default; writes need an explicit global switch or per-connection override
//! - Accident prevention, not injection defense: callers are trusted to issue arbitrary reads
//! - Bounded output: capped rows, capped cell width, truncation always reported
//! - Native drivers per backend, no query language abstraction
//!
//! # Architecture
//! The CLI and the MCP server are thin wrappers over [`Gateway`], which resolves the connection,
//! resolves the policy, classifies the SQL, executes it through the [`registry`] and renders the
//! outcome.
//!
//! # Module Organization
//! - [`policy`] - Effective read-only mode
//! - [`classifier`] - Mutation and multi-statement detection
//! - [`output`] - Cell sanitizing and table/JSON/CSV rendering
//! - [`engine`] - Driver contract and the `SQLite`, `PostgreSQL` and `MySQL` drivers
//! - [`registry`] - Lazily connected, single-flight connection cache
//! - [`gateway`] - Façade used by every surface
//! - [`config`] - Configuration loading and environment expansion
//! - [`error`] - Error taxonomy
//! - [`mcp`] - MCP server (manual JSON-RPC 2.0 over stdio)

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod mcp;
pub mod output;
pub mod policy;
pub mod registry;

pub use classifier::{classify, Verdict};
pub use config::{ConnectionSpec, GatewayConfig};
pub use engine::{
    BackendKind, ColumnDescriptor, DatabaseDriver, Driver, ExecuteOptions, QueryOutcome, RowSet, TableKind,
    TableSummary, HARD_ROW_CAP,
};
pub use error::{ConnectionCause, GatewayError, Result};
pub use gateway::{ConnectionStatus, Gateway, QueryRequest, QueryResponse};
pub use output::{Cell, OutputFormat};
pub use policy::effective_read_only;
pub use registry::{ConnectionRegistry, Connector, DriverConnector, LiveConnection};
