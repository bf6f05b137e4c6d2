//! Line-based splitting of a SQL schema document into executable statements.
//!
//! This is a lexical splitter, not a SQL parser. A statement ends on the
//! first line whose content (after removing a trailing `--` comment) ends
//! with `;`.

use std::path::Path;

use serde::Serialize;

use crate::config::TransportFamily;
use crate::error::{BootstrapError, Result};

/// Which `--` sequences start a line comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommentStyle {
    /// Any `--` outside quotes (PostgreSQL, and the default when the engine
    /// is not known yet).
    #[default]
    Standard,
    /// `--` only when followed by whitespace or the end of the line, so
    /// `x--1` is arithmetic.
    MySql,
}

impl From<TransportFamily> for CommentStyle {
    fn from(family: TransportFamily) -> Self {
        match family {
            TransportFamily::Postgres => CommentStyle::Standard,
            TransportFamily::MySql => CommentStyle::MySql,
        }
    }
}

/// Ordered statements taken from a schema document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatementSequence {
    pub statements: Vec<String>,
    /// Trailing text that never reached a `;`. It is not executed.
    pub unterminated_tail: Option<String>,
}

impl StatementSequence {
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.statements.iter()
    }
}

impl<'a> IntoIterator for &'a StatementSequence {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.statements.iter()
    }
}

/// Read a schema document from disk.
pub fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| BootstrapError::SchemaLoad {
        path: path.display().to_string(),
        source,
    })
}

/// Split a document into statements, in document order.
pub fn parse(document: &str) -> StatementSequence {
    parse_with(document, CommentStyle::Standard)
}

/// Split a document using the comment rules of one engine.
pub fn parse_with(document: &str, style: CommentStyle) -> StatementSequence {
    let mut statements = Vec::new();
    let mut current = String::new();

    for raw in document.lines() {
        let line = strip_comment(raw, style).trim();
        if line.is_empty() {
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);

        if line.ends_with(';') {
            statements.push(std::mem::take(&mut current));
        }
    }

    let unterminated_tail = if current.is_empty() {
        None
    } else {
        tracing::warn!(
            tail = %preview(&current, 80),
            "Schema document ends with an unterminated statement; it will not be executed"
        );
        Some(current)
    };

    tracing::debug!(count = statements.len(), "Parsed schema statements");

    StatementSequence {
        statements,
        unterminated_tail,
    }
}

/// Remove a trailing `--` comment that is not inside a quoted string or
/// identifier.
///
/// Quote state does not carry across lines.
pub fn strip_line_comment(line: &str) -> &str {
    strip_comment(line, CommentStyle::Standard)
}

/// Like [`strip_line_comment`], under the given engine's rules.
pub fn strip_comment(line: &str, style: CommentStyle) -> &str {
    let mut quote: Option<char> = None;
    let mut prev_dash = false;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                prev_dash = false;
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    prev_dash = false;
                }
                '-' if prev_dash => {
                    let starts_comment = match style {
                        CommentStyle::Standard => true,
                        CommentStyle::MySql => chars.peek().map_or(true, |&(_, n)| n.is_whitespace()),
                    };
                    if starts_comment {
                        return &line[..i - 1];
                    }
                    prev_dash = false;
                }
                '-' => prev_dash = true,
                _ => prev_dash = false,
            },
        }
    }

    line
}

/// Shorten a statement for logs and reports, on a char boundary.
pub fn preview(statement: &str, max_chars: usize) -> String {
    let flat: String = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}
