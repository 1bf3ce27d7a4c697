//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout querygate.
//! All errors are structured and map to stable error codes for text and MCP output.
//!
//! # Error Categories
//! - `Config`: unknown connection, no connections, ambiguous default, unknown backend
//! - `Environment`: a `$VAR` referenced by a connection location is not set
//! - `Connection`: refused, authentication, missing database/file, driver unavailable
//! - `QueryFailed` / `Timeout` / `TableNotFound`: execution errors
//! - `InvalidInput`: malformed request (empty SQL, oversized statement)
//! - `Engine`: backend-specific failures outside query execution (introspection, pooling)
//!
//! Safety denials are *not* errors; they are a [`crate::engine::QueryOutcome`] variant.

use std::fmt;

use thiserror::Error;

/// Named cause of a failed connection attempt
///
/// Raw driver errors are translated into one of these so callers get an actionable message
/// instead of a driver-specific dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCause {
    /// Server refused the TCP connection or the host could not be resolved
    Refused,
    /// Credentials were rejected
    AuthenticationFailed,
    /// The named database does not exist on the server
    DatabaseNotFound,
    /// The `SQLite` database file does not exist
    FileNotFound,
    /// The backend was compiled out of this build
    DriverUnavailable,
    /// Anything the translation layer does not recognize
    Other,
}

impl ConnectionCause {
    /// Short remediation hint appended to the error message
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self {
            Self::Refused => "check that the server is running and the host/port are reachable",
            Self::AuthenticationFailed => "check the user name and password in the connection string",
            Self::DatabaseNotFound => "check the database name in the connection string",
            Self::FileNotFound => "check the file path; querygate never creates database files",
            Self::DriverUnavailable => "rebuild querygate with the matching cargo feature enabled",
            Self::Other => "inspect the connection settings",
        }
    }

    /// Stable label used in messages
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Refused => "connection refused",
            Self::AuthenticationFailed => "authentication failed",
            Self::DatabaseNotFound => "database not found",
            Self::FileNotFound => "database file not found",
            Self::DriverUnavailable => "driver not available",
            Self::Other => "connection error",
        }
    }
}

impl fmt::Display for ConnectionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for querygate operations
///
/// `Clone` because a single failed connection attempt is shared by every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Configuration problem (never retried)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Environment variable referenced in a connection location is missing
    #[error("Environment variable ${variable} is not set (referenced by {context})")]
    Environment { variable: String, context: String },

    /// Database connection failed
    #[error("Connection failed ({cause}): {detail}. Hint: {}", cause.hint())]
    Connection { cause: ConnectionCause, detail: String },

    /// Query execution failed in the backend
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Query exceeded its timeout budget
    #[error("Query exceeded timeout of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Table requested for introspection does not exist
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific database error
    #[error("Engine error ({engine}): {detail}")]
    Engine { engine: String, detail: String },
}

impl GatewayError {
    /// Convert error to error code string
    ///
    /// Error codes are stable and suitable for programmatic handling by agents.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Environment { .. } => "ENV_VAR_MISSING",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::QueryFailed(_) => "QUERY_FAILED",
            Self::Timeout { .. } => "QUERY_TIMEOUT",
            Self::TableNotFound(_) => "TABLE_NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Engine { .. } => "ENGINE_ERROR",
        }
    }

    /// Get human-readable error message (agent-appropriate, no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Render as the plain-text form used by every text surface
    #[must_use]
    pub fn render(&self) -> String {
        format!("Error [{}]: {}", self.error_code(), self.message())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a missing environment variable error
    pub fn environment(variable: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Environment { variable: variable.into(), context: context.into() }
    }

    /// Create a connection error with a named cause
    pub fn connection(cause: ConnectionCause, detail: impl Into<String>) -> Self {
        Self::Connection { cause, detail: detail.into() }
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    /// Create a timeout error
    #[must_use]
    pub const fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a table-not-found error
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound(table.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Engine { engine: engine.into(), detail: detail.into() }
    }

    /// Connection cause, if this is a connection error
    #[must_use]
    pub const fn connection_cause(&self) -> Option<ConnectionCause> {
        match self {
            Self::Connection { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

/// Result type alias for querygate operations
pub type Result<T> = std::result::Result<T, GatewayError>;
