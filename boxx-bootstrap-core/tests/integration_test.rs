//! Integration tests for boxx-bootstrap-core against live servers.
//!
//! Each family is skipped unless its variables are set, e.g.:
//!   TEST_PG_HOST=localhost TEST_PG_USER=postgres TEST_PG_PASSWORD=postgres TEST_PG_DB=boxx_test
//!   TEST_MYSQL_HOST=127.0.0.1 TEST_MYSQL_USER=root TEST_MYSQL_PASSWORD=root TEST_MYSQL_DB=boxx_test
//! Optional: TEST_PG_PORT, TEST_MYSQL_PORT.
//!
//! Run with: cargo test --test integration_test

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use boxx_bootstrap_core::config::{BootstrapConfig, SecurityMode};
use boxx_bootstrap_core::db::{self, SchemaTarget};
use boxx_bootstrap_core::error::ConnectionErrorCategory;
use boxx_bootstrap_core::{env, Bootstrap, EnvSource, RunStatus, Verdict};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Map `TEST_<PREFIX>_*` onto the keys the resolver understands.
fn live_sources(prefix: &str, connection: &str) -> Option<Vec<EnvSource>> {
    let var = |name: &str| std::env::var(format!("TEST_{}_{}", prefix, name)).ok();
    let host = var("HOST")?;

    let mut pairs = vec![
        ("DB_CONNECTION".to_string(), connection.to_string()),
        ("DB_HOST".to_string(), host),
    ];
    for (suffix, key) in [
        ("PORT", "DB_PORT"),
        ("DB", "DB_NAME"),
        ("USER", "DB_USER"),
        ("PASSWORD", "DB_PASSWORD"),
    ] {
        if let Some(value) = var(suffix) {
            pairs.push((key.to_string(), value));
        }
    }
    Some(vec![EnvSource::from_pairs("test", pairs)])
}

fn unique_table(prefix: &str) -> String {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("boxx_test_{}_{}_{}", prefix, std::process::id(), id)
}

fn schema_config(dir: &tempfile::TempDir, table: &str) -> BootstrapConfig {
    let path = dir.path().join("schema.sql");
    std::fs::write(
        &path,
        format!(
            "-- test schema\nCREATE TABLE {t} (\n  id INT PRIMARY KEY,\n  name VARCHAR(64)\n);\nINSERT INTO {t} VALUES (1, 'first'); -- seed\n",
            t = table
        ),
    )
    .unwrap();

    let mut config = BootstrapConfig::default();
    config.schema.path = path;
    config.verify.count_rows = vec![table.to_string()];
    config.verify.expected_tables = vec![table.to_string()];
    config
}

async fn drop_table(sources: &[EnvSource], table: &str) {
    let descriptor = env::resolve(sources).unwrap();
    let mut conn = db::connect(&descriptor, Duration::from_secs(10))
        .await
        .unwrap()
        .value;
    conn.execute(&format!("DROP TABLE {}", table)).await.unwrap();
    conn.close().await.unwrap();
}

async fn check_idempotent_apply(sources: Vec<EnvSource>, prefix: &str) {
    let dir = tempfile::tempdir().unwrap();
    let table = unique_table(prefix);
    let bootstrap = Bootstrap::new(schema_config(&dir, &table), sources.clone());

    let first = bootstrap.run().await;
    assert_eq!(first.status, RunStatus::Success, "{:?}", first.error);
    assert_eq!(first.summary.applied, 2);
    assert!(first.tables.contains(&table));
    assert_eq!(first.row_counts.get(&table), Some(&1));
    assert!(first.missing_tables.is_empty());
    assert!(first.connection.as_ref().unwrap().security_mode.is_some());

    // The CREATE is skipped; the INSERT hits the primary key and fails.
    let second = bootstrap.run().await;
    assert_eq!(second.steps[0].verdict, Verdict::SkippedExists);
    assert_eq!(second.steps[1].verdict, Verdict::Failed);
    assert_eq!(second.status, RunStatus::CompletedWithErrors);
    assert_eq!(second.row_counts.get(&table), Some(&1));

    drop_table(&sources, &table).await;
}

async fn check_wrong_password(sources: Vec<EnvSource>) {
    let mut sources = sources;
    sources.insert(
        0,
        EnvSource::from_pairs(
            "override",
            [("DB_PASSWORD", "definitely-not-the-password"), ("DB_SSLMODE", "disable")],
        ),
    );
    let descriptor = env::resolve(&sources).unwrap();
    let err = db::connect(&descriptor, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert_eq!(
        err.connection_category(),
        Some(ConnectionErrorCategory::AuthRejected),
        "{}",
        err
    );
}

async fn check_refused_port(sources: Vec<EnvSource>) {
    let mut sources = sources;
    sources.insert(
        0,
        EnvSource::from_pairs(
            "override",
            [("DB_HOST", "127.0.0.1"), ("DB_PORT", "1"), ("DB_SSLMODE", "disable")],
        ),
    );
    let descriptor = env::resolve(&sources).unwrap();
    assert_eq!(descriptor.security_mode, SecurityMode::Disabled);
    let err = db::connect(&descriptor, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(
        err.connection_category(),
        Some(ConnectionErrorCategory::Unreachable),
        "{}",
        err
    );
}

// ── PostgreSQL ──

#[tokio::test]
async fn test_postgres_apply_is_idempotent() {
    let Some(sources) = live_sources("PG", "pgsql") else { return };
    check_idempotent_apply(sources, "pg").await;
}

#[tokio::test]
async fn test_postgres_wrong_password_is_auth_rejected() {
    let Some(sources) = live_sources("PG", "pgsql") else { return };
    check_wrong_password(sources).await;
}

#[tokio::test]
async fn test_postgres_refused_port_is_unreachable() {
    let Some(sources) = live_sources("PG", "pgsql") else { return };
    check_refused_port(sources).await;
}

#[tokio::test]
async fn test_postgres_diagnose_is_healthy() {
    let Some(sources) = live_sources("PG", "pgsql") else { return };
    let bootstrap = Bootstrap::new(BootstrapConfig::default(), sources);
    let report = bootstrap.diagnose().await;
    assert!(report.healthy, "{:?}", report.attempts);
    assert!(report.dns.unwrap().resolved);
    assert!(report.tcp.unwrap().reachable);
}

// ── MySQL ──

#[tokio::test]
async fn test_mysql_apply_is_idempotent() {
    let Some(sources) = live_sources("MYSQL", "mysql") else { return };
    check_idempotent_apply(sources, "my").await;
}

#[tokio::test]
async fn test_mysql_wrong_password_is_auth_rejected() {
    let Some(sources) = live_sources("MYSQL", "mysql") else { return };
    check_wrong_password(sources).await;
}

#[tokio::test]
async fn test_mysql_refused_port_is_unreachable() {
    let Some(sources) = live_sources("MYSQL", "mysql") else { return };
    check_refused_port(sources).await;
}
