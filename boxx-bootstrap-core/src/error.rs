use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        return msg;
    }
    // Connection-level failures carry the useful part in the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorCategory {
    Unreachable,
    AuthRejected,
    HandshakeFailed,
    Timeout,
    Unknown,
}

impl fmt::Display for ConnectionErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionErrorCategory::Unreachable => write!(f, "unreachable"),
            ConnectionErrorCategory::AuthRejected => write!(f, "auth_rejected"),
            ConnectionErrorCategory::HandshakeFailed => write!(f, "handshake_failed"),
            ConnectionErrorCategory::Timeout => write!(f, "timeout"),
            ConnectionErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// A failed connection attempt, already classified.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{category}: {message}")]
pub struct ConnectionError {
    pub category: ConnectionErrorCategory,
    pub message: String,
}

impl ConnectionError {
    pub fn new(category: ConnectionErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Outcome of a single failed statement, classified at the connection boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// The target object already exists. Not an error for bootstrap purposes.
    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Failed(String),
}

/// Coarse error family, used for report serialization and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    SchemaDocument,
    Connection,
    Database,
    Io,
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Incomplete database configuration: missing {}", .missing.join(", "))]
    ConfigIncomplete { missing: Vec<String> },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to load schema document '{path}': {source}")]
    SchemaLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed ({}): {}", .0.category, .0.message)]
    Connection(#[from] ConnectionError),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BootstrapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::ConfigIncomplete { .. } | BootstrapError::ConfigError(_) => {
                ErrorKind::Config
            }
            BootstrapError::SchemaLoad { .. } => ErrorKind::SchemaDocument,
            BootstrapError::Connection(_) => ErrorKind::Connection,
            BootstrapError::DatabaseError(_) => ErrorKind::Database,
            BootstrapError::IoError(_) => ErrorKind::Io,
        }
    }

    /// The connection category, if this is a connection failure.
    pub fn connection_category(&self) -> Option<ConnectionErrorCategory> {
        match self {
            BootstrapError::Connection(e) => Some(e.category),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for BootstrapError {
    fn from(e: tokio_postgres::Error) -> Self {
        BootstrapError::DatabaseError(format_db_error(&e))
    }
}

impl From<sqlx::Error> for BootstrapError {
    fn from(e: sqlx::Error) -> Self {
        BootstrapError::DatabaseError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
