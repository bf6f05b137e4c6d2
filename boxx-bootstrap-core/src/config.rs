use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::EnvSource;
use crate::error::{BootstrapError, Result};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "boxx-bootstrap.toml";

/// Upper bound for the per-attempt connect timeout.
const MAX_CONNECT_TIMEOUT_SECS: u32 = 120;

/// TLS negotiation mode for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SecurityMode {
    /// TLS must be negotiated, otherwise the attempt fails.
    #[serde(rename = "required")]
    Required,
    /// TLS is used when the server offers it.
    #[serde(rename = "optional")]
    Optional,
    /// Plaintext only.
    #[serde(rename = "none")]
    Disabled,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::Required => write!(f, "required"),
            SecurityMode::Optional => write!(f, "optional"),
            SecurityMode::Disabled => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for SecurityMode {
    type Err = BootstrapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "require" | "required" => Ok(SecurityMode::Required),
            "prefer" | "preferred" | "optional" => Ok(SecurityMode::Optional),
            "disable" | "disabled" | "none" | "off" => Ok(SecurityMode::Disabled),
            _ => Err(BootstrapError::ConfigError(format!(
                "Invalid SSL mode '{}'. Use 'require', 'prefer', or 'disable'.",
                s
            ))),
        }
    }
}

/// Which database engine (and wire protocol) a descriptor targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportFamily {
    MySql,
    Postgres,
}

impl TransportFamily {
    pub fn default_port(self) -> u16 {
        match self {
            TransportFamily::MySql => 3306,
            TransportFamily::Postgres => 5432,
        }
    }

    /// Supabase-hosted Postgres only accepts TLS, MySQL installs usually
    /// negotiate it opportunistically.
    pub fn default_security_mode(self) -> SecurityMode {
        match self {
            TransportFamily::MySql => SecurityMode::Optional,
            TransportFamily::Postgres => SecurityMode::Required,
        }
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFamily::MySql => write!(f, "mysql"),
            TransportFamily::Postgres => write!(f, "postgres"),
        }
    }
}

impl std::str::FromStr for TransportFamily {
    type Err = BootstrapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(TransportFamily::MySql),
            "pgsql" | "postgres" | "postgresql" | "supabase" => Ok(TransportFamily::Postgres),
            _ => Err(BootstrapError::ConfigError(format!(
                "Unsupported connection type '{}'. Use 'mysql' or 'pgsql'.",
                s
            ))),
        }
    }
}

/// Canonical connection parameters produced by [`crate::env::resolve`].
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub secret: Option<String>,
    pub family: TransportFamily,
    pub security_mode: SecurityMode,
}

impl ConnectionDescriptor {
    /// Check the invariants that must hold before any connection attempt.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host".to_string());
        }
        if self.database.trim().is_empty() {
            missing.push("database".to_string());
        }
        if self.user.trim().is_empty() {
            missing.push("user".to_string());
        }
        if !missing.is_empty() {
            return Err(BootstrapError::ConfigIncomplete { missing });
        }
        if self.port == 0 {
            return Err(BootstrapError::ConfigError(
                "Database port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Same target and credentials with a different security mode.
    pub fn with_security_mode(&self, mode: SecurityMode) -> Self {
        Self {
            security_mode: mode,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("family", &self.family)
            .field("security_mode", &self.security_mode)
            .finish()
    }
}

/// Top-level run settings for a bootstrap invocation.
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    pub schema: SchemaSettings,
    pub connection: ConnectionSettings,
    pub verify: VerifySettings,
}

/// Where the SQL document lives.
#[derive(Debug, Clone)]
pub struct SchemaSettings {
    pub path: PathBuf,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lib/SQL-Storage-Boxx-0.sql"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout_secs: u32,
    pub env_file: PathBuf,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            env_file: PathBuf::from(".env"),
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }
}

/// Post-apply checks reported alongside the table inventory.
#[derive(Debug, Clone)]
pub struct VerifySettings {
    /// Tables whose row count is reported when present.
    pub count_rows: Vec<String>,
    /// Tables listed as missing when absent from the inventory.
    pub expected_tables: Vec<String>,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            count_rows: vec!["settings".to_string()],
            expected_tables: Vec::new(),
        }
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
struct TomlConfig {
    schema: Option<TomlSchemaSettings>,
    connection: Option<TomlConnectionSettings>,
    verify: Option<TomlVerifySettings>,
}

#[derive(Deserialize, Default)]
struct TomlSchemaSettings {
    path: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlConnectionSettings {
    connect_timeout: Option<u32>,
    env_file: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlVerifySettings {
    count_rows: Option<Vec<String>>,
    expected_tables: Option<Vec<String>>,
}

/// CLI overrides that take highest priority.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub schema: Option<PathBuf>,
    pub connect_timeout: Option<u32>,
    pub env_file: Option<PathBuf>,
}

impl BootstrapConfig {
    /// Load run settings with the following priority (highest wins):
    /// 1. CLI arguments
    /// 2. `BOXX_*` keys in the given environment snapshot
    /// 3. TOML config file
    /// 4. Built-in defaults
    pub fn load(config_path: Option<&str>, env: &EnvSource, overrides: &CliOverrides) -> Result<Self> {
        let mut config = BootstrapConfig::default();

        let toml_path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                BootstrapError::ConfigError(format!(
                    "Failed to parse config file '{}': {}",
                    toml_path, e
                ))
            })?;
            config.apply_toml(toml_config);
        } else if config_path.is_some() {
            return Err(BootstrapError::ConfigError(format!(
                "Config file '{}' not found",
                toml_path
            )));
        }

        config.apply_env(env)?;
        config.apply_cli(overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_toml(&mut self, toml: TomlConfig) {
        if let Some(s) = toml.schema {
            if let Some(v) = s.path {
                self.schema.path = PathBuf::from(v);
            }
        }

        if let Some(c) = toml.connection {
            if let Some(v) = c.connect_timeout {
                self.connection.connect_timeout_secs = v;
            }
            if let Some(v) = c.env_file {
                self.connection.env_file = PathBuf::from(v);
            }
        }

        if let Some(v) = toml.verify {
            if let Some(tables) = v.count_rows {
                self.verify.count_rows = tables;
            }
            if let Some(tables) = v.expected_tables {
                self.verify.expected_tables = tables;
            }
        }
    }

    fn apply_env(&mut self, env: &EnvSource) -> Result<()> {
        if let Some(v) = env.get("BOXX_SCHEMA_FILE") {
            self.schema.path = PathBuf::from(v);
        }
        if let Some(v) = env.get("BOXX_CONNECT_TIMEOUT") {
            self.connection.connect_timeout_secs = v.trim().parse::<u32>().map_err(|_| {
                BootstrapError::ConfigError(format!(
                    "BOXX_CONNECT_TIMEOUT must be a number of seconds, got '{}'",
                    v
                ))
            })?;
        }
        if let Some(v) = env.get("BOXX_ENV_FILE") {
            self.connection.env_file = PathBuf::from(v);
        }
        if let Some(v) = env.get("BOXX_COUNT_ROWS") {
            self.verify.count_rows = split_list(v);
        }
        if let Some(v) = env.get("BOXX_EXPECTED_TABLES") {
            self.verify.expected_tables = split_list(v);
        }
        Ok(())
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(ref v) = overrides.schema {
            self.schema.path = v.clone();
        }
        if let Some(v) = overrides.connect_timeout {
            self.connection.connect_timeout_secs = v;
        }
        if let Some(ref v) = overrides.env_file {
            self.connection.env_file = v.clone();
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.connection.connect_timeout_secs == 0 {
            return Err(BootstrapError::ConfigError(
                "connect_timeout must be greater than 0 seconds".to_string(),
            ));
        }
        if self.connection.connect_timeout_secs > MAX_CONNECT_TIMEOUT_SECS {
            self.connection.connect_timeout_secs = MAX_CONNECT_TIMEOUT_SECS;
            tracing::warn!(
                max_secs = MAX_CONNECT_TIMEOUT_SECS,
                "connect_timeout capped"
            );
        }
        for table in self
            .verify
            .count_rows
            .iter()
            .chain(self.verify.expected_tables.iter())
        {
            crate::db::validate_identifier(table)?;
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
