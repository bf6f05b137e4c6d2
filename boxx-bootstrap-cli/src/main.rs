mod output;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use boxx_bootstrap_core::config::{BootstrapConfig, CliOverrides};
use boxx_bootstrap_core::env;
use boxx_bootstrap_core::error::{BootstrapError, ErrorKind};
use boxx_bootstrap_core::report::{Phase, ReportBuilder};
use boxx_bootstrap_core::{Bootstrap, BootstrapReport, EnvSource, RunStatus};

#[derive(Parser)]
#[command(
    name = "boxx-bootstrap",
    about = "Bootstrap the Storage Boxx database schema",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Env file to read connection settings from (default: .env)
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// SQL schema document (overrides config)
    #[arg(long, value_name = "PATH")]
    schema: Option<PathBuf>,

    /// Database host (overrides DB_HOST / POSTGRES_HOST)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Database port (overrides DB_PORT / POSTGRES_PORT)
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Database name (overrides DB_NAME / POSTGRES_DB)
    #[arg(long, value_name = "NAME")]
    database: Option<String>,

    /// Database user (overrides DB_USER / POSTGRES_USER)
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Connection type: mysql, pgsql
    #[arg(long, value_name = "TYPE")]
    connection: Option<String>,

    /// SSL/TLS mode: require, prefer, disable
    #[arg(long, value_name = "MODE")]
    ssl_mode: Option<String>,

    /// Per-attempt connection timeout in seconds (default: 10)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the schema document to the database
    Apply,

    /// Split the schema document into statements without connecting
    Parse,

    /// Check settings, name resolution, and connectivity
    Diagnose,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so --json output stays parseable
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            print_error(&e);
            process::exit(exit_code(e.kind()));
        }
    }
}

/// Map error kinds to differentiated exit codes.
fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Config => 2,
        ErrorKind::SchemaDocument => 3,
        ErrorKind::Connection => 4,
        ErrorKind::Database | ErrorKind::Io => 1,
    }
}

fn report_exit_code(report: &BootstrapReport) -> i32 {
    match report.status {
        RunStatus::Success => 0,
        RunStatus::CompletedWithErrors => 5,
        RunStatus::Error => report.error.as_ref().map(|e| exit_code(e.kind)).unwrap_or(1),
    }
}

/// Connection keys given as flags, placed ahead of `lower`.
fn cli_source(cli: &Cli, lower: &[EnvSource]) -> EnvSource {
    let flags = [
        (&env::HOST, &cli.host),
        (&env::PORT, &cli.port),
        (&env::DATABASE, &cli.database),
        (&env::USER, &cli.user),
        (&env::CONNECTION_TYPE, &cli.connection),
        (&env::SSL_MODE, &cli.ssl_mode),
    ];
    env::override_source(
        "cli",
        flags
            .into_iter()
            .filter_map(|(key, value)| value.clone().map(|v| (key, v))),
        lower,
    )
}

/// Load settings and snapshot the environment sources in priority order.
fn prepare(cli: &Cli) -> Result<Bootstrap, BootstrapError> {
    let process_env = EnvSource::from_process();
    let overrides = CliOverrides {
        schema: cli.schema.clone(),
        connect_timeout: cli.connect_timeout,
        env_file: cli.env_file.clone(),
    };
    let config = BootstrapConfig::load(cli.config.as_deref(), &process_env, &overrides)?;

    let mut lower = vec![process_env];
    if let Some(dotenv) = EnvSource::load_dotenv(&config.connection.env_file)? {
        lower.push(dotenv);
    }
    let mut sources = vec![cli_source(cli, &lower)];
    sources.extend(lower);

    Ok(Bootstrap::new(config, sources))
}

/// A report for a run that failed before any phase could start.
fn config_failure_report(err: &BootstrapError) -> BootstrapReport {
    let mut report = ReportBuilder::start();
    report.abort(Phase::Config, Duration::ZERO, err);
    report.finish()
}

fn emit_bootstrap_report(report: &BootstrapReport, json_output: bool) -> i32 {
    if json_output {
        print_json(report);
    } else {
        output::print_bootstrap_report(report);
    }
    report_exit_code(report)
}

async fn run(cli: Cli) -> Result<i32, BootstrapError> {
    let json_output = cli.json;

    let bootstrap = match prepare(&cli) {
        Ok(bootstrap) => bootstrap,
        // apply always answers with a report
        Err(e) if matches!(cli.command, Commands::Apply) => {
            return Ok(emit_bootstrap_report(&config_failure_report(&e), json_output));
        }
        Err(e) => return Err(e),
    };
    tracing::debug!(
        sources = %bootstrap.sources().iter().map(|s| s.name()).collect::<Vec<_>>().join(", "),
        "Environment sources in priority order"
    );

    match cli.command {
        Commands::Apply => {
            let report = bootstrap.run().await;
            Ok(emit_bootstrap_report(&report, json_output))
        }
        Commands::Parse => {
            let (statements, summary) = bootstrap.parse_schema()?;
            if json_output {
                print_json(&serde_json::json!({
                    "schema": summary,
                    "statements": statements.statements,
                    "unterminated_tail": statements.unterminated_tail,
                }));
            } else {
                output::print_parse_result(&statements, &summary);
            }
            Ok(0)
        }
        Commands::Diagnose => {
            let report = bootstrap.diagnose().await;
            if json_output {
                print_json(&report);
            } else {
                output::print_diagnostic_report(&report);
            }
            Ok(if report.healthy { 0 } else { 4 })
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} Failed to serialize output: {}", "ERROR:".red().bold(), e),
    }
}

fn print_error(error: &BootstrapError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        BootstrapError::ConfigIncomplete { .. } => {
            eprintln!(
                "{}",
                "Hint: Set DB_HOST, DB_NAME and DB_USER (or the POSTGRES_* equivalents) in the environment or .env file."
                    .dimmed()
            );
        }
        BootstrapError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check boxx-bootstrap.toml and the BOXX_* environment variables.".dimmed()
            );
        }
        BootstrapError::SchemaLoad { .. } => {
            eprintln!(
                "{}",
                "Hint: Pass --schema or set BOXX_SCHEMA_FILE to the SQL document.".dimmed()
            );
        }
        BootstrapError::Connection(_) => {
            eprintln!(
                "{}",
                "Hint: Run 'boxx-bootstrap diagnose' to check name resolution and connectivity."
                    .dimmed()
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxx_bootstrap_core::report::PhaseStatus;

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::try_parse_from([
            "boxx-bootstrap",
            "--host",
            "db.example.com",
            "--ssl-mode",
            "disable",
            "--json",
            "apply",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Apply));

        let source = cli_source(&cli, &[]);
        assert_eq!(source.get("DB_HOST"), Some("db.example.com"));
        assert_eq!(source.get("DB_SSLMODE"), Some("disable"));
        assert_eq!(source.get("DB_USER"), None);
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn test_host_flag_follows_postgres_environment() {
        let cli = Cli::try_parse_from([
            "boxx-bootstrap",
            "--host",
            "db.other.supabase.co",
            "apply",
        ])
        .unwrap();
        let process = EnvSource::from_pairs(
            "process",
            [
                ("POSTGRES_HOST", "db.abc.supabase.co"),
                ("POSTGRES_DB", "postgres"),
                ("POSTGRES_USER", "postgres"),
            ],
        );
        let source = cli_source(&cli, std::slice::from_ref(&process));
        assert_eq!(source.get("POSTGRES_HOST"), Some("db.other.supabase.co"));

        let descriptor = env::resolve(&[source, process]).unwrap();
        assert_eq!(descriptor.host, "db.other.supabase.co");
        assert_eq!(descriptor.family, boxx_bootstrap_core::TransportFamily::Postgres);
        assert_eq!(descriptor.port, 5432);
    }

    #[test]
    fn test_invalid_config_still_produces_report() {
        let cli = Cli::try_parse_from([
            "boxx-bootstrap",
            "--config",
            "/nonexistent/boxx-bootstrap.toml",
            "--json",
            "apply",
        ])
        .unwrap();
        let err = match prepare(&cli) {
            Err(e) => e,
            Ok(_) => panic!("Expected a configuration error"),
        };

        let report = config_failure_report(&err);
        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::Config);
        assert_eq!(report.phases[0].phase, Phase::Config);
        assert_eq!(report.phases[0].status, PhaseStatus::Failed);
        assert!(report.phases[1..].iter().all(|p| p.status == PhaseStatus::Skipped));
        assert!(report.steps.is_empty());
        assert_eq!(report_exit_code(&report), 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "error");
    }

    #[test]
    fn test_cli_has_no_password_flag() {
        assert!(Cli::try_parse_from(["boxx-bootstrap", "--password", "x", "apply"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(ErrorKind::Config), 2);
        assert_eq!(exit_code(ErrorKind::SchemaDocument), 3);
        assert_eq!(exit_code(ErrorKind::Connection), 4);
        assert_eq!(exit_code(ErrorKind::Database), 1);
    }
}
