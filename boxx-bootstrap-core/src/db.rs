//! Database connections for both transport families, TLS setup, the
//! security-mode fallback, and classification of driver errors.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection as SqlxConnection, Executor};

use crate::config::{ConnectionDescriptor, SecurityMode, TransportFamily};
use crate::error::{
    format_db_error, BootstrapError, ConnectionError, ConnectionErrorCategory, Result,
    StatementError,
};

/// Quote a SQL identifier for the given family.
///
/// Doubles any embedded quote character and wraps the name in it.
pub fn quote_ident(family: TransportFamily, name: &str) -> String {
    match family {
        TransportFamily::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        TransportFamily::MySql => format!("`{}`", name.replace('`', "``")),
    }
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BootstrapError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BootstrapError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
fn make_rustls_config() -> std::result::Result<rustls::ClientConfig, ConnectionError> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| {
        ConnectionError::new(
            ConnectionErrorCategory::Unknown,
            format!("Failed to initialise TLS: {}", e),
        )
    })?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

// ── Error classification ──

/// Classify a failed connection attempt.
///
/// Takes the flattened driver message, the first I/O error kind found in the
/// error chain, and the server's SQLSTATE if it sent one. A SQLSTATE means
/// the server answered after the handshake, so the keyword scan only runs
/// for transport-level failures.
pub fn classify_connect_failure(
    message: &str,
    io_kind: Option<io::ErrorKind>,
    sqlstate: Option<&str>,
) -> ConnectionErrorCategory {
    match sqlstate {
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        Some("28P01") | Some("28000") => return ConnectionErrorCategory::AuthRejected,
        Some(_) => return ConnectionErrorCategory::Unknown,
        None => {}
    }

    let lower = message.to_lowercase();
    if lower.contains("password authentication failed") || lower.contains("access denied") {
        return ConnectionErrorCategory::AuthRejected;
    }

    if io_kind == Some(io::ErrorKind::TimedOut)
        || lower.contains("timed out")
        || lower.contains("timeout")
    {
        return ConnectionErrorCategory::Timeout;
    }

    if ["tls", "ssl", "handshake", "certificate"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return ConnectionErrorCategory::HandshakeFailed;
    }

    if matches!(
        io_kind,
        Some(io::ErrorKind::ConnectionRefused)
            | Some(io::ErrorKind::NotFound)
            | Some(io::ErrorKind::AddrNotAvailable)
    ) || [
        "connection refused",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "unreachable",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        return ConnectionErrorCategory::Unreachable;
    }

    ConnectionErrorCategory::Unknown
}

fn is_already_exists(message: &str) -> bool {
    message.to_lowercase().contains("already exists")
}

/// Classify a failed statement. Only "already exists" is tolerated.
pub fn classify_statement_failure(message: String) -> StatementError {
    if is_already_exists(&message) {
        StatementError::AlreadyExists(message)
    } else {
        StatementError::Failed(message)
    }
}

/// Classify on the primary message only. The detail of a unique violation
/// reads "Key (id)=(1) already exists", which is a real failure.
fn postgres_statement_error(e: &tokio_postgres::Error) -> StatementError {
    let full = format_db_error(e);
    let primary_exists = match e.as_db_error() {
        Some(db_err) => is_already_exists(db_err.message()),
        None => is_already_exists(&full),
    };
    if primary_exists {
        StatementError::AlreadyExists(full)
    } else {
        StatementError::Failed(full)
    }
}

fn io_kind_in_chain(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

fn postgres_connect_error(e: &tokio_postgres::Error) -> ConnectionError {
    let message = format_db_error(e);
    let sqlstate = e.as_db_error().map(|db| db.code().code());
    let category = classify_connect_failure(&message, io_kind_in_chain(e), sqlstate);
    ConnectionError::new(category, message)
}

fn mysql_connect_error(e: &sqlx::Error) -> ConnectionError {
    let message = e.to_string();
    let category = match e {
        sqlx::Error::Tls(_) => ConnectionErrorCategory::HandshakeFailed,
        sqlx::Error::Database(db) => {
            classify_connect_failure(&message, None, db.code().as_deref())
        }
        other => classify_connect_failure(&message, io_kind_in_chain(other), None),
    };
    ConnectionError::new(category, message)
}

// ── Schema target ──

/// What the schema applier needs from a live database.
#[async_trait]
pub trait SchemaTarget: Send {
    /// Execute one statement. Failures are already classified.
    async fn execute(&mut self, sql: &str) -> std::result::Result<(), StatementError>;

    /// Base tables in the current schema (postgres) or database (mysql).
    async fn list_tables(&mut self) -> Result<BTreeSet<String>>;

    /// `SELECT COUNT(*)` for a table that is known to exist.
    async fn count_rows(&mut self, table: &str) -> Result<i64>;

    /// Release the underlying session. Later calls fail.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

enum Backend {
    Postgres(tokio_postgres::Client),
    MySql(MySqlConnection),
    Closed,
}

/// A live connection, exclusively owned by one bootstrap run.
///
/// Dropping it closes the session; [`SchemaTarget::close`] also says goodbye
/// to a mysql server.
pub struct Connection {
    backend: Backend,
    family: TransportFamily,
    security_mode: SecurityMode,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("family", &self.family)
            .field("security_mode", &self.security_mode)
            .field("closed", &matches!(self.backend, Backend::Closed))
            .finish()
    }
}

impl Connection {
    pub fn family(&self) -> TransportFamily {
        self.family
    }

    /// The security mode the successful attempt used.
    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }
}

fn closed_error() -> BootstrapError {
    BootstrapError::DatabaseError("Connection already closed".to_string())
}

#[async_trait]
impl SchemaTarget for Connection {
    async fn execute(&mut self, sql: &str) -> std::result::Result<(), StatementError> {
        match &mut self.backend {
            Backend::Postgres(client) => client
                .batch_execute(sql)
                .await
                .map_err(|e| postgres_statement_error(&e)),
            Backend::MySql(conn) => conn
                .execute(sql)
                .await
                .map(|_| ())
                .map_err(|e| classify_statement_failure(e.to_string())),
            Backend::Closed => Err(StatementError::Failed(closed_error().to_string())),
        }
    }

    async fn list_tables(&mut self) -> Result<BTreeSet<String>> {
        match &mut self.backend {
            Backend::Postgres(client) => {
                let rows = client
                    .query(
                        "SELECT table_name::text FROM information_schema.tables \
                         WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'",
                        &[],
                    )
                    .await?;
                Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
            }
            Backend::MySql(conn) => {
                let names: Vec<String> = sqlx::query_scalar(
                    "SELECT CAST(table_name AS CHAR) FROM information_schema.tables \
                     WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'",
                )
                .fetch_all(&mut *conn)
                .await?;
                Ok(names.into_iter().collect())
            }
            Backend::Closed => Err(closed_error()),
        }
    }

    async fn count_rows(&mut self, table: &str) -> Result<i64> {
        validate_identifier(table)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(self.family, table));
        match &mut self.backend {
            Backend::Postgres(client) => {
                let row = client.query_one(&sql, &[]).await?;
                Ok(row.get::<_, i64>(0))
            }
            Backend::MySql(conn) => {
                let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
                Ok(count)
            }
            Backend::Closed => Err(closed_error()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.backend, Backend::Closed) {
            Backend::MySql(conn) => conn.close().await?,
            // Dropping the client ends the spawned connection task
            Backend::Postgres(client) => drop(client),
            Backend::Closed => {}
        }
        tracing::debug!(family = %self.family, "Connection closed");
        Ok(())
    }
}

// ── Establishment ──

/// A successful establishment and how it got there.
#[derive(Debug)]
pub struct Established<T> {
    pub value: T,
    pub requested_mode: SecurityMode,
    pub mode: SecurityMode,
    /// The handshake failure that triggered the downgrade, if any.
    pub downgraded_after: Option<ConnectionError>,
}

/// Run `attempt` under `requested`, retrying once with TLS disabled if and
/// only if the first attempt failed its handshake.
///
/// Each attempt is bounded by `timeout`.
pub async fn establish<T, F, Fut>(
    requested: SecurityMode,
    timeout: Duration,
    mut attempt: F,
) -> std::result::Result<Established<T>, ConnectionError>
where
    F: FnMut(SecurityMode) -> Fut,
    Fut: Future<Output = std::result::Result<T, ConnectionError>>,
{
    match attempt_within(&mut attempt, requested, timeout).await {
        Ok(value) => Ok(Established {
            value,
            requested_mode: requested,
            mode: requested,
            downgraded_after: None,
        }),
        Err(e)
            if e.category == ConnectionErrorCategory::HandshakeFailed
                && requested != SecurityMode::Disabled =>
        {
            tracing::warn!(
                requested = %requested,
                error = %e.message,
                "TLS handshake failed, retrying without TLS"
            );
            let value = attempt_within(&mut attempt, SecurityMode::Disabled, timeout).await?;
            Ok(Established {
                value,
                requested_mode: requested,
                mode: SecurityMode::Disabled,
                downgraded_after: Some(e),
            })
        }
        Err(e) => Err(e),
    }
}

async fn attempt_within<T, F, Fut>(
    attempt: &mut F,
    mode: SecurityMode,
    timeout: Duration,
) -> std::result::Result<T, ConnectionError>
where
    F: FnMut(SecurityMode) -> Fut,
    Fut: Future<Output = std::result::Result<T, ConnectionError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, attempt(mode)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::new(
            ConnectionErrorCategory::Timeout,
            format!("No response within {}s", timeout.as_secs()),
        )),
    };
    match &result {
        Ok(_) => tracing::debug!(
            mode = %mode,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Connection attempt succeeded"
        ),
        Err(e) => tracing::debug!(
            mode = %mode,
            category = %e.category,
            error = %e.message,
            "Connection attempt failed"
        ),
    }
    result
}

/// Connect using the descriptor's security mode, with the single TLS
/// downgrade on handshake failure.
pub async fn connect(
    descriptor: &ConnectionDescriptor,
    timeout: Duration,
) -> Result<Established<Connection>> {
    descriptor.validate()?;

    tracing::info!(
        family = %descriptor.family,
        host = %descriptor.host,
        port = descriptor.port,
        database = %descriptor.database,
        security_mode = %descriptor.security_mode,
        "Connecting to database"
    );

    let established = establish(descriptor.security_mode, timeout, |mode| {
        let attempt = descriptor.with_security_mode(mode);
        async move { connect_once(&attempt).await }
    })
    .await?;

    tracing::info!(security_mode = %established.mode, "Connected");
    Ok(established)
}

/// A single attempt under exactly the descriptor's security mode.
pub async fn connect_once(
    descriptor: &ConnectionDescriptor,
) -> std::result::Result<Connection, ConnectionError> {
    // sqlx builds its own rustls config from the process default provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    match descriptor.family {
        TransportFamily::Postgres => connect_postgres(descriptor).await,
        TransportFamily::MySql => connect_mysql(descriptor).await,
    }
}

async fn connect_postgres(
    descriptor: &ConnectionDescriptor,
) -> std::result::Result<Connection, ConnectionError> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&descriptor.host)
        .port(descriptor.port)
        .user(&descriptor.user)
        .dbname(&descriptor.database)
        .application_name("boxx-bootstrap")
        .ssl_mode(match descriptor.security_mode {
            SecurityMode::Required => tokio_postgres::config::SslMode::Require,
            SecurityMode::Optional => tokio_postgres::config::SslMode::Prefer,
            SecurityMode::Disabled => tokio_postgres::config::SslMode::Disable,
        });
    if let Some(ref secret) = descriptor.secret {
        config.password(secret);
    }

    let client = match descriptor.security_mode {
        SecurityMode::Disabled => {
            let (client, connection) = config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| postgres_connect_error(&e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Database connection error");
                }
            });
            client
        }
        SecurityMode::Required | SecurityMode::Optional => {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config()?);
            let (client, connection) = config
                .connect(tls)
                .await
                .map_err(|e| postgres_connect_error(&e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Database connection error");
                }
            });
            client
        }
    };

    Ok(Connection {
        backend: Backend::Postgres(client),
        family: TransportFamily::Postgres,
        security_mode: descriptor.security_mode,
    })
}

async fn connect_mysql(
    descriptor: &ConnectionDescriptor,
) -> std::result::Result<Connection, ConnectionError> {
    let ssl_mode = match descriptor.security_mode {
        SecurityMode::Required => MySqlSslMode::Required,
        SecurityMode::Optional => MySqlSslMode::Preferred,
        SecurityMode::Disabled => MySqlSslMode::Disabled,
    };

    let mut options = MySqlConnectOptions::new()
        .host(&descriptor.host)
        .port(descriptor.port)
        .username(&descriptor.user)
        .database(&descriptor.database)
        .charset("utf8mb4")
        .ssl_mode(ssl_mode)
        .disable_statement_logging();
    if let Some(ref secret) = descriptor.secret {
        options = options.password(secret);
    }

    let conn = MySqlConnection::connect_with(&options)
        .await
        .map_err(|e| mysql_connect_error(&e))?;

    Ok(Connection {
        backend: Backend::MySql(conn),
        family: TransportFamily::MySql,
        security_mode: descriptor.security_mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_per_family() {
        assert_eq!(quote_ident(TransportFamily::Postgres, "settings"), "\"settings\"");
        assert_eq!(quote_ident(TransportFamily::Postgres, "a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident(TransportFamily::MySql, "settings"), "`settings`");
        assert_eq!(quote_ident(TransportFamily::MySql, "a`b"), "`a``b`");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("settings").is_ok());
        assert!(validate_identifier("user_tokens2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("a.b").is_err());
    }

    #[test]
    fn test_classify_auth_by_sqlstate() {
        assert_eq!(
            classify_connect_failure("db error", None, Some("28P01")),
            ConnectionErrorCategory::AuthRejected
        );
        assert_eq!(
            classify_connect_failure("Access denied for user 'x'@'y'", None, Some("28000")),
            ConnectionErrorCategory::AuthRejected
        );
        assert_eq!(
            classify_connect_failure("password authentication failed for user \"postgres\"", None, None),
            ConnectionErrorCategory::AuthRejected
        );
    }

    #[test]
    fn test_classify_handshake() {
        assert_eq!(
            classify_connect_failure("error performing TLS handshake: invalid peer certificate", None, None),
            ConnectionErrorCategory::HandshakeFailed
        );
        assert_eq!(
            classify_connect_failure("server does not support SSL, but SSL was required", None, None),
            ConnectionErrorCategory::HandshakeFailed
        );
    }

    #[test]
    fn test_classify_unreachable() {
        assert_eq!(
            classify_connect_failure("error connecting to server", Some(io::ErrorKind::ConnectionRefused), None),
            ConnectionErrorCategory::Unreachable
        );
        assert_eq!(
            classify_connect_failure("failed to lookup address information: Name or service not known", None, None),
            ConnectionErrorCategory::Unreachable
        );
    }

    #[test]
    fn test_classify_timeout_and_unknown() {
        assert_eq!(
            classify_connect_failure("x", Some(io::ErrorKind::TimedOut), None),
            ConnectionErrorCategory::Timeout
        );
        assert_eq!(
            classify_connect_failure("connection timed out", None, None),
            ConnectionErrorCategory::Timeout
        );
        assert_eq!(
            classify_connect_failure("database \"nope\" does not exist", None, Some("3D000")),
            ConnectionErrorCategory::Unknown
        );
    }

    #[test]
    fn test_classify_server_error_ignores_names_in_message() {
        assert_eq!(
            classify_connect_failure("database \"tls_inventory\" does not exist", None, Some("3D000")),
            ConnectionErrorCategory::Unknown
        );
        assert_eq!(
            classify_connect_failure("role \"ssl_timeout\" is not permitted to log in", None, Some("28000")),
            ConnectionErrorCategory::AuthRejected
        );
        assert_eq!(
            classify_connect_failure("Unknown database 'handshake_certificates'", None, Some("42000")),
            ConnectionErrorCategory::Unknown
        );
    }

    #[tokio::test]
    async fn test_server_error_mentioning_tls_is_not_retried() {
        let mut attempts = 0;
        let result = establish(SecurityMode::Required, Duration::from_secs(5), |_mode| {
            attempts += 1;
            let message = "database \"tls_inventory\" does not exist";
            let category = classify_connect_failure(message, None, Some("3D000"));
            async move { Err::<(), _>(ConnectionError::new(category, message)) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.category, ConnectionErrorCategory::Unknown);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_classify_statement_failure() {
        assert_eq!(
            classify_statement_failure("relation \"a\" already exists".to_string()),
            StatementError::AlreadyExists("relation \"a\" already exists".to_string())
        );
        assert_eq!(
            classify_statement_failure("Table 'settings' ALREADY EXISTS".to_string()),
            StatementError::AlreadyExists("Table 'settings' ALREADY EXISTS".to_string())
        );
        assert_eq!(
            classify_statement_failure("syntax error at or near \"CREAT\"".to_string()),
            StatementError::Failed("syntax error at or near \"CREAT\"".to_string())
        );
    }

    #[test]
    fn test_io_kind_found_in_chain() {
        #[derive(Debug)]
        struct Wrapper(io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(io_kind_in_chain(&err), Some(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_rustls_config_builds() {
        assert!(make_rustls_config().is_ok());
    }
}
