//! Query Safety Classification
//!
//! Decides whether a SQL text may run on a connection whose effective mode is read-only.
//! This is accident prevention for trusted callers, not a defense against adversarial SQL.
//!
//! # Classification Strategy
//! 1. Mutations allowed: every input is allowed, nothing is scanned
//! 2. Multi-statement input (a `;` anywhere but the very end) is denied on the raw text
//! 3. String literals, quoted identifiers and comments are blanked out
//! 4. The remaining body is scanned for mutation keywords as whole words, case-insensitively,
//!    so keywords hidden inside CTEs or subqueries are still caught
//!
//! Nested block comments, backtick identifiers and dollar-quoted strings are not understood.

use tracing::debug;

/// Keywords whose presence in the unquoted body marks a statement as mutating
pub const MUTATION_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "REPLACE", "MERGE", "GRANT", "REVOKE",
    "ATTACH", "DETACH", "VACUUM", "REINDEX", "COPY",
];

/// Reason given for inputs that carry more than one statement
pub const MULTI_STATEMENT_REASON: &str = "multiple statements not allowed";

/// Result of classifying a query against the read-only policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The query may be executed
    Allowed,
    /// The query must not be executed; `reason` is shown to the caller
    Denied { reason: String },
}

impl Verdict {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Classify a query
///
/// # Arguments
/// * `sql` - Raw SQL text as received from the caller
/// * `mutations_allowed` - `true` when the effective policy for the connection is writable
pub fn classify(sql: &str, mutations_allowed: bool) -> Verdict {
    if mutations_allowed {
        return Verdict::Allowed;
    }

    if has_multiple_statements(sql) {
        debug!("classifier: multi-statement input denied");
        return Verdict::Denied { reason: MULTI_STATEMENT_REASON.to_string() };
    }

    match find_mutation_keyword(sql) {
        Some(keyword) => {
            debug!(keyword, "classifier: mutation keyword found");
            Verdict::Denied {
                reason: format!(
                    "{keyword} statements are not allowed on a read-only connection. \
                     To enable mutations set \"allow_mutations\": true in the configuration, \
                     or set \"read_only\": false on this connection"
                ),
            }
        }
        None => Verdict::Allowed,
    }
}

/// Remove at most one trailing `;` (and surrounding whitespace) from a statement
#[must_use]
pub fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    trimmed.strip_suffix(';').map_or(trimmed, str::trim_end)
}

/// Check the raw text for a statement separator that is not the final character
fn has_multiple_statements(sql: &str) -> bool {
    strip_trailing_semicolon(sql).contains(';')
}

/// Find the first mutation keyword in the unquoted, uncommented body
#[must_use]
pub fn find_mutation_keyword(sql: &str) -> Option<&'static str> {
    let body = strip_literals_and_comments(sql);
    let found = words(&body).find_map(|word| MUTATION_KEYWORDS.iter().find(|kw| kw.eq_ignore_ascii_case(word)).copied());
    found
}

/// First keyword of the statement, uppercased, skipping whitespace, comments and opening parens
#[must_use]
pub fn leading_keyword(sql: &str) -> Option<String> {
    let body = strip_literals_and_comments(sql);
    let start = body.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let word: String = start.chars().take_while(|c| is_word_char(*c)).collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

/// Blank out string literals, double-quoted identifiers and comments
///
/// Handles:
/// - Single-quoted literals: 'text', with backslash-escaped quotes ('it\'s')
/// - Double-quoted identifiers: "name"
/// - Line comments: -- comment
/// - Block comments: /* comment */ (not nested)
///
/// Every stripped region is replaced by a single space so neighbouring words stay apart.
#[must_use]
pub fn strip_literals_and_comments(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => {
                            chars.next();
                        }
                        '\'' => break,
                        _ => {}
                    }
                }
                result.push(' ');
            }
            '"' => {
                for ch in chars.by_ref() {
                    if ch == '"' {
                        break;
                    }
                }
                result.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        break;
                    }
                }
                // keeps line structure intact
                result.push('\n');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for ch in chars.by_ref() {
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
                result.push(' ');
            }
            _ => result.push(ch),
        }
    }

    result
}

const fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn words(body: &str) -> impl Iterator<Item = &str> {
    body.split(|c: char| !is_word_char(c)).filter(|w| !w.is_empty())
}
