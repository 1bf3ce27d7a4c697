//! Result Normalization and Formatting
//!
//! Backend values arrive as [`Cell`]s. This module turns them into bounded text and renders
//! whole row sets in one of three encodings.
//!
//! # Output Contract
//! - Table: aligned columns, `-+-` separator, row-count caption
//! - JSON: pretty-printed array of objects, keys in column order
//! - CSV: header plus rows, RFC 4180 quoting
//! - Empty row set: exactly `No results.` in every encoding

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::engine::{QueryOutcome, RowSet};
use crate::error::{GatewayError, Result};

/// Widest rendered cell, in characters, including the ellipsis
pub const MAX_CELL_WIDTH: usize = 200;

/// Marker appended to truncated cells
pub const ELLIPSIS: &str = "...";

/// Marker for SQL NULL in table and CSV output
pub const NULL_MARKER: &str = "NULL";

/// Sentinel rendered for an empty row set
pub const NO_RESULTS: &str = "No results.";

/// A single column value, normalized from whatever the backend produced
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    /// Binary payload; only its length is kept
    Blob(usize),
    Json(Value),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    #[must_use]
    pub fn blob(bytes: &[u8]) -> Self {
        Self::Blob(bytes.len())
    }
}

/// Output encoding for row sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Aligned plain-text table
    #[default]
    Table,
    /// Pretty-printed JSON array of objects
    Json,
    /// Comma-separated values with a header row
    Csv,
}

impl OutputFormat {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(GatewayError::invalid_input(format!(
                "Unknown output format '{other}' (expected table, json or csv)"
            ))),
        }
    }
}

/// Render a cell as bounded text
///
/// `NULL` for nulls, `[BLOB n bytes]` for binary, compact serialization for JSON. Anything longer
/// than [`MAX_CELL_WIDTH`] characters keeps its first 197 characters followed by `...`.
#[must_use]
pub fn sanitize_cell(cell: &Cell) -> String {
    let raw = match cell {
        Cell::Null => return NULL_MARKER.to_string(),
        Cell::Blob(len) => return format!("[BLOB {len} bytes]"),
        Cell::Bool(b) => b.to_string(),
        Cell::Int(i) => i.to_string(),
        Cell::UInt(u) => u.to_string(),
        Cell::Float(f) => format_float(*f),
        Cell::Text(s) => s.clone(),
        Cell::Json(v) => v.to_string(),
    };
    truncate_text(raw)
}

/// Plain notation for everyday magnitudes, exponent notation outside them
fn format_float(f: f64) -> String {
    let magnitude = f.abs();
    if !f.is_finite() || f == 0.0 || (1e-6..1e15).contains(&magnitude) {
        f.to_string()
    } else {
        format!("{f:e}")
    }
}

fn truncate_text(text: String) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text;
    }
    let keep = MAX_CELL_WIDTH - ELLIPSIS.len();
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Render a row set in the requested encoding
pub fn render_rows(rows: &RowSet, format: OutputFormat) -> Result<String> {
    if rows.rows.is_empty() {
        return Ok(NO_RESULTS.to_string());
    }
    match format {
        OutputFormat::Table => Ok(render_table(rows)),
        OutputFormat::Json => render_json(rows),
        OutputFormat::Csv => render_csv(rows),
    }
}

/// Render any execution outcome
///
/// Denials render as text, never as an error.
pub fn render_outcome(outcome: &QueryOutcome, format: OutputFormat) -> Result<String> {
    match outcome {
        QueryOutcome::Rows(rows) => render_rows(rows, format),
        QueryOutcome::Affected { rows_affected } => Ok(format!("Statement executed. {rows_affected} row(s) affected.")),
        QueryOutcome::Denied { reason } => Ok(format!("Query denied: {reason}")),
    }
}

/// Caption printed under a table
#[must_use]
pub fn caption(rows: &RowSet) -> String {
    let shown = rows.rows.len();
    match (rows.truncated, rows.total_rows) {
        (true, Some(total)) => format!("(showing {shown} of {total} rows)"),
        (true, None) => format!("(showing first {shown} rows; more rows available)"),
        (false, _) if shown == 1 => "(1 row)".to_string(),
        (false, _) => format!("({shown} rows)"),
    }
}

// ============================================================================
// Table
// ============================================================================

fn render_table(rows: &RowSet) -> String {
    // tabs and line breaks would break column alignment
    let flatten = |s: String| -> String {
        s.chars().map(|c| if c.is_control() { ' ' } else { c }).collect()
    };

    let header: Vec<String> = rows.columns.iter().map(|c| flatten(truncate_text(c.clone()))).collect();
    let body: Vec<Vec<String>> = rows
        .rows
        .iter()
        .map(|row| row.iter().map(|cell| flatten(sanitize_cell(cell))).collect())
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &body {
        for (i, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(len),
                None => widths.push(len),
            }
        }
    }

    let format_line = |cells: &[String]| -> String {
        let padded: Vec<String> = widths
            .iter()
            .enumerate()
            .map(|(i, &w)| {
                let cell = cells.get(i).map_or("", String::as_str);
                format!("{cell:<w$}")
            })
            .collect();
        padded.join(" | ").trim_end().to_string()
    };

    let mut lines = Vec::with_capacity(body.len() + 3);
    lines.push(format_line(&header));
    lines.push(widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
    for row in &body {
        lines.push(format_line(row));
    }
    lines.push(caption(rows));
    lines.join("\n")
}

// ============================================================================
// JSON
// ============================================================================

fn json_value(cell: &Cell) -> Value {
    match cell {
        Cell::Null => Value::Null,
        Cell::Bool(b) => Value::Bool(*b),
        Cell::Int(i) => Value::from(*i),
        Cell::UInt(u) => Value::from(*u),
        Cell::Float(f) => Number::from_f64(*f).map_or_else(|| Value::String(sanitize_cell(cell)), Value::Number),
        Cell::Text(_) | Cell::Blob(_) | Cell::Json(_) => Value::String(sanitize_cell(cell)),
    }
}

/// Object keys for each column; repeated names get `_2`, `_3`, ... so no value is overwritten
fn json_keys(columns: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(columns.len());
    for column in columns {
        let mut key = column.clone();
        let mut n = 1;
        while keys.contains(&key) {
            n += 1;
            key = format!("{column}_{n}");
        }
        keys.push(key);
    }
    keys
}

fn render_json(rows: &RowSet) -> Result<String> {
    let keys = json_keys(&rows.columns);
    let objects: Vec<Value> = rows
        .rows
        .iter()
        .map(|row| {
            let mut object = Map::with_capacity(rows.columns.len());
            for (column, cell) in keys.iter().zip(row) {
                object.insert(column.clone(), json_value(cell));
            }
            Value::Object(object)
        })
        .collect();

    serde_json::to_string_pretty(&objects)
        .map_err(|e| GatewayError::engine_error("json", format!("Failed to serialize rows: {e}")))
}

// ============================================================================
// CSV
// ============================================================================

fn render_csv(rows: &RowSet) -> Result<String> {
    let csv_err = |e: csv::Error| GatewayError::engine_error("csv", format!("Failed to write rows: {e}"));

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    writer.write_record(&rows.columns).map_err(csv_err)?;
    for row in &rows.rows {
        writer.write_record(row.iter().map(sanitize_cell)).map_err(csv_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| GatewayError::engine_error("csv", format!("Failed to flush rows: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| GatewayError::engine_error("csv", format!("Output is not valid UTF-8: {e}")))?;
    Ok(text.trim_end_matches('\n').to_string())
}
