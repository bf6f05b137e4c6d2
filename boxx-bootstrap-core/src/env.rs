//! Environment snapshots and connection-parameter resolution.
//!
//! Every source is an immutable, named key/value map captured once per run.
//! Resolution never reads the process environment directly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::config::{ConnectionDescriptor, SecurityMode, TransportFamily};
use crate::error::{BootstrapError, Result};

/// A logical connection setting and the environment keys that may supply it.
///
/// Aliases are checked in order within a single source.
#[derive(Debug, Clone, Copy)]
pub struct LogicalKey {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub secret: bool,
}

pub const HOST: LogicalKey = LogicalKey {
    name: "host",
    aliases: &["DB_HOST", "POSTGRES_HOST"],
    secret: false,
};

pub const PORT: LogicalKey = LogicalKey {
    name: "port",
    aliases: &["DB_PORT", "POSTGRES_PORT"],
    secret: false,
};

pub const DATABASE: LogicalKey = LogicalKey {
    name: "database",
    aliases: &["DB_NAME", "POSTGRES_DB"],
    secret: false,
};

pub const USER: LogicalKey = LogicalKey {
    name: "user",
    aliases: &["DB_USER", "POSTGRES_USER"],
    secret: false,
};

pub const SECRET: LogicalKey = LogicalKey {
    name: "secret",
    aliases: &["DB_PASSWORD", "POSTGRES_PASSWORD"],
    secret: true,
};

pub const CONNECTION_TYPE: LogicalKey = LogicalKey {
    name: "connection",
    aliases: &["DB_CONNECTION"],
    secret: false,
};

pub const SSL_MODE: LogicalKey = LogicalKey {
    name: "ssl_mode",
    aliases: &["DB_SSLMODE", "POSTGRES_SSLMODE"],
    secret: false,
};

/// Every key the resolver understands, in reporting order.
pub const ALL_KEYS: [LogicalKey; 7] = [HOST, PORT, DATABASE, USER, SECRET, CONNECTION_TYPE, SSL_MODE];

/// A named snapshot of environment variables.
#[derive(Clone)]
pub struct EnvSource {
    name: String,
    vars: BTreeMap<String, String>,
}

impl EnvSource {
    pub fn new(name: impl Into<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            vars,
        }
    }

    pub fn from_pairs<I, K, V>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            name,
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Snapshot the current process environment. Non-UTF-8 entries are skipped.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self::new("process", vars)
    }

    /// Read a dotenv file without touching the process environment.
    ///
    /// Falls back to `.env.example` next to `path` when the file is missing.
    /// Returns `Ok(None)` when neither exists.
    pub fn load_dotenv(path: &Path) -> Result<Option<Self>> {
        let path = if path.is_file() {
            path.to_path_buf()
        } else {
            let example = path.with_file_name(".env.example");
            if example.is_file() {
                tracing::warn!(
                    path = %path.display(),
                    fallback = %example.display(),
                    "Env file not found, using example file"
                );
                example
            } else {
                tracing::warn!(path = %path.display(), "No env file found");
                return Ok(None);
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&path) {
                let mode = meta.permissions().mode();
                if mode & 0o077 != 0 {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode),
                        "Env file has overly permissive permissions. Consider chmod 600."
                    );
                }
            }
        }

        let iter = dotenvy::from_path_iter(&path).map_err(|e| {
            BootstrapError::ConfigError(format!(
                "Failed to read env file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut vars = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                BootstrapError::ConfigError(format!(
                    "Failed to parse env file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            vars.insert(key, value);
        }

        tracing::debug!(path = %path.display(), keys = vars.len(), "Loaded env file");
        Ok(Some(Self::new(format!("file:{}", path.display()), vars)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a key. Empty and whitespace-only values count as undefined.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSource")
            .field("name", &self.name)
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Where a logical key's value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found<'a> {
    pub value: &'a str,
    pub alias: &'static str,
    pub source: &'a str,
}

/// Find the first source defining any alias of `key`.
pub fn lookup<'a>(sources: &'a [EnvSource], key: &LogicalKey) -> Option<Found<'a>> {
    sources.iter().find_map(|source| {
        key.aliases.iter().find_map(|&alias| {
            source.get(alias).map(|value| Found {
                value,
                alias,
                source: source.name(),
            })
        })
    })
}

/// Build a source of explicit overrides to place ahead of `lower`.
///
/// Values are written under the alias group of the host found in `lower`
/// (`DB_*` or `POSTGRES_*`), so overriding one setting never changes the
/// inferred transport family, port or security mode.
pub fn override_source<'k>(
    name: impl Into<String>,
    overrides: impl IntoIterator<Item = (&'k LogicalKey, String)>,
    lower: &[EnvSource],
) -> EnvSource {
    let group = lookup(lower, &HOST)
        .and_then(|found| HOST.aliases.iter().position(|&alias| alias == found.alias))
        .unwrap_or(0);
    let pairs = overrides.into_iter().filter_map(|(key, value)| {
        let alias = key.aliases.get(group).or_else(|| key.aliases.first())?;
        Some((*alias, value))
    });
    EnvSource::from_pairs(name, pairs)
}

/// Merge the ordered sources into one connection descriptor.
///
/// The earliest source that defines a logical key wins. Host, database and
/// user are mandatory; a missing password is only logged, since the server
/// will reject the login anyway.
pub fn resolve(sources: &[EnvSource]) -> Result<ConnectionDescriptor> {
    let host = lookup(sources, &HOST);
    let database = lookup(sources, &DATABASE);
    let user = lookup(sources, &USER);

    let missing: Vec<String> = [(&HOST, &host), (&DATABASE, &database), (&USER, &user)]
        .iter()
        .filter(|(_, found)| found.is_none())
        .map(|(key, _)| key.name.to_string())
        .collect();

    let (Some(host), Some(database), Some(user)) = (host, database, user) else {
        return Err(BootstrapError::ConfigIncomplete { missing });
    };

    let family = match lookup(sources, &CONNECTION_TYPE) {
        Some(found) => found.value.parse::<TransportFamily>()?,
        None if host.alias == "POSTGRES_HOST" => TransportFamily::Postgres,
        None => TransportFamily::MySql,
    };

    let port = match lookup(sources, &PORT) {
        Some(found) => parse_port(&found)?,
        None => family.default_port(),
    };

    let security_mode = match lookup(sources, &SSL_MODE) {
        Some(found) => found.value.parse::<SecurityMode>()?,
        None => family.default_security_mode(),
    };

    let secret = lookup(sources, &SECRET).map(|found| found.value.to_string());
    if secret.is_none() {
        tracing::warn!("No database password configured; authentication will likely fail");
    }

    tracing::debug!(
        host_from = %host.source,
        host_alias = %host.alias,
        family = %family,
        port = port,
        security_mode = %security_mode,
        "Resolved connection parameters"
    );

    let descriptor = ConnectionDescriptor {
        host: host.value.trim().to_string(),
        port,
        database: database.value.trim().to_string(),
        user: user.value.trim().to_string(),
        secret,
        family,
        security_mode,
    };
    descriptor.validate()?;
    Ok(descriptor)
}

fn parse_port(found: &Found<'_>) -> Result<u16> {
    match found.value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(BootstrapError::ConfigError(format!(
            "{} must be a port number between 1 and 65535, got '{}' (from {})",
            found.alias, found.value, found.source
        ))),
    }
}
