//! Connectivity diagnostics: which settings are present, and how far a
//! connection gets (name resolution, TCP, each security mode).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ConnectionDescriptor, SecurityMode, TransportFamily};
use crate::db::{self, SchemaTarget};
use crate::env::{self, EnvSource};
use crate::error::{BootstrapError, ConnectionError, ConnectionErrorCategory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvCheck {
    pub key: &'static str,
    pub set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Omitted for secrets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsProbe {
    pub host: String,
    pub resolved: bool,
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpProbe {
    pub address: String,
    pub reachable: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectAttempt {
    pub security_mode: SecurityMode,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ConnectionErrorCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Report returned by the diagnose command.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub timestamp: DateTime<Utc>,
    pub environment: Vec<EnvCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<TransportFamily>,
    /// Why network probes did not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpProbe>,
    pub attempts: Vec<ConnectAttempt>,
    pub healthy: bool,
}

/// Report every recognised key: whether it is set, by which alias, from
/// which source.
pub fn environment_check(sources: &[EnvSource]) -> Vec<EnvCheck> {
    env::ALL_KEYS
        .iter()
        .map(|key| match env::lookup(sources, key) {
            Some(found) => EnvCheck {
                key: key.name,
                set: true,
                alias: Some(found.alias),
                source: Some(found.source.to_string()),
                value: (!key.secret).then(|| found.value.to_string()),
            },
            None => EnvCheck {
                key: key.name,
                set: false,
                alias: None,
                source: None,
                value: None,
            },
        })
        .collect()
}

/// Execute the diagnose command.
pub async fn execute(sources: &[EnvSource], timeout: Duration) -> DiagnosticReport {
    let mut report = DiagnosticReport {
        timestamp: Utc::now(),
        environment: environment_check(sources),
        family: None,
        skipped: None,
        config_error: None,
        dns: None,
        tcp: None,
        attempts: Vec::new(),
        healthy: false,
    };

    let descriptor = match env::resolve(sources) {
        Ok(d) => d,
        Err(e) => {
            let reason = match &e {
                BootstrapError::ConfigIncomplete { .. } => "missing_environment_variables",
                _ => "invalid_configuration",
            };
            report.skipped = Some(reason.to_string());
            report.config_error = Some(e.to_string());
            tracing::warn!(error = %e, "Skipping network checks");
            return report;
        }
    };
    report.family = Some(descriptor.family);

    report.dns = Some(resolve_host(&descriptor, timeout).await);
    report.tcp = Some(probe_tcp(&descriptor, timeout).await);

    let mut modes = vec![descriptor.security_mode];
    if descriptor.security_mode != SecurityMode::Disabled {
        modes.push(SecurityMode::Disabled);
    }
    for mode in modes {
        report
            .attempts
            .push(attempt(&descriptor.with_security_mode(mode), timeout).await);
    }

    report.healthy = report.attempts.iter().any(|a| a.success);
    tracing::info!(healthy = report.healthy, "Diagnostics finished");
    report
}

async fn resolve_host(descriptor: &ConnectionDescriptor, timeout: Duration) -> DnsProbe {
    let lookup = tokio::net::lookup_host((descriptor.host.as_str(), descriptor.port));
    let (addresses, error) = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => (addrs.map(|a| a.ip().to_string()).collect::<Vec<_>>(), None),
        Ok(Err(e)) => (Vec::new(), Some(e.to_string())),
        Err(_) => (Vec::new(), Some("Name resolution timed out".to_string())),
    };
    tracing::debug!(host = %descriptor.host, addresses = addresses.len(), "DNS lookup");
    DnsProbe {
        host: descriptor.host.clone(),
        resolved: !addresses.is_empty(),
        addresses,
        error,
    }
}

async fn probe_tcp(descriptor: &ConnectionDescriptor, timeout: Duration) -> TcpProbe {
    let start = Instant::now();
    let connect = tokio::net::TcpStream::connect((descriptor.host.as_str(), descriptor.port));
    let error = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("No response within {}s", timeout.as_secs())),
    };
    TcpProbe {
        address: format!("{}:{}", descriptor.host, descriptor.port),
        reachable: error.is_none(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        error,
    }
}

async fn attempt(descriptor: &ConnectionDescriptor, timeout: Duration) -> ConnectAttempt {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, db::connect_once(descriptor)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::new(
            ConnectionErrorCategory::Timeout,
            format!("No response within {}s", timeout.as_secs()),
        )),
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(mut conn) => {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Failed to close diagnostic connection");
            }
            ConnectAttempt {
                security_mode: descriptor.security_mode,
                success: true,
                elapsed_ms,
                category: None,
                message: None,
            }
        }
        Err(e) => ConnectAttempt {
            security_mode: descriptor.security_mode,
            success: false,
            elapsed_ms,
            category: Some(e.category),
            message: Some(e.message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_check_hides_secret_value() {
        let sources = [
            EnvSource::from_pairs("cli", [("DB_HOST", "cli-host")]),
            EnvSource::from_pairs(
                "process",
                [("POSTGRES_USER", "postgres"), ("POSTGRES_PASSWORD", "hunter2")],
            ),
        ];
        let checks = environment_check(&sources);
        assert_eq!(checks.len(), env::ALL_KEYS.len());

        let host = checks.iter().find(|c| c.key == "host").unwrap();
        assert!(host.set);
        assert_eq!(host.source.as_deref(), Some("cli"));
        assert_eq!(host.value.as_deref(), Some("cli-host"));

        let secret = checks.iter().find(|c| c.key == "secret").unwrap();
        assert!(secret.set);
        assert_eq!(secret.alias, Some("POSTGRES_PASSWORD"));
        assert_eq!(secret.value, None);

        let database = checks.iter().find(|c| c.key == "database").unwrap();
        assert!(!database.set);

        let json = serde_json::to_string(&checks).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_environment_skips_probes() {
        let report = execute(&[], Duration::from_secs(1)).await;
        assert_eq!(report.skipped.as_deref(), Some("missing_environment_variables"));
        assert!(report.dns.is_none());
        assert!(report.tcp.is_none());
        assert!(report.attempts.is_empty());
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_invalid_configuration_skips_probes() {
        let sources = [EnvSource::from_pairs(
            "process",
            [
                ("DB_HOST", "localhost"),
                ("DB_NAME", "storageboxx"),
                ("DB_USER", "root"),
                ("DB_PORT", "99999"),
            ],
        )];
        let report = execute(&sources, Duration::from_secs(1)).await;
        assert_eq!(report.skipped.as_deref(), Some("invalid_configuration"));
        assert!(report.config_error.is_some());
    }
}
