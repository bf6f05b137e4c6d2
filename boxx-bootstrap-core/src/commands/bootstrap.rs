//! One full bootstrap run: resolve, load, connect, apply, verify.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::checksum::{calculate_checksum, format_checksum};
use crate::config::{BootstrapConfig, ConnectionDescriptor, VerifySettings};
use crate::db::{self, Established, SchemaTarget};
use crate::env::{self, EnvSource};
use crate::error::Result;
use crate::report::{
    BootstrapReport, ConnectionSummary, Phase, ReportBuilder, SchemaSummary,
};
use crate::statements::{self, CommentStyle, StatementSequence};

/// Run a bootstrap against a real database.
pub async fn execute(config: &BootstrapConfig, sources: &[EnvSource]) -> BootstrapReport {
    run_with(config, sources, |descriptor, timeout| async move {
        db::connect(&descriptor, timeout).await
    })
    .await
}

/// Run a bootstrap, obtaining the target through `connector`.
///
/// `connector` is called at most once, and only after the configuration
/// resolved and the schema document parsed.
pub async fn run_with<T, F, Fut>(
    config: &BootstrapConfig,
    sources: &[EnvSource],
    connector: F,
) -> BootstrapReport
where
    T: SchemaTarget,
    F: FnOnce(ConnectionDescriptor, Duration) -> Fut,
    Fut: Future<Output = Result<Established<T>>>,
{
    let mut report = ReportBuilder::start();

    let started = Instant::now();
    let descriptor = match env::resolve(sources) {
        Ok(d) => {
            report.phase_ok(Phase::Config, started.elapsed());
            d
        }
        Err(e) => {
            report.abort(Phase::Config, started.elapsed(), &e);
            return report.finish();
        }
    };
    report.connection(ConnectionSummary::from_descriptor(&descriptor));

    let started = Instant::now();
    let statements = match load_schema(&config.schema.path, descriptor.family.into()) {
        Ok((statements, summary)) => {
            if let Some(ref tail) = statements.unterminated_tail {
                report.warn(format!(
                    "Unterminated statement at end of schema document was not executed: {}",
                    statements::preview(tail, 80)
                ));
            }
            report.schema(summary);
            report.phase_ok(Phase::LoadSchema, started.elapsed());
            statements
        }
        Err(e) => {
            report.abort(Phase::LoadSchema, started.elapsed(), &e);
            return report.finish();
        }
    };

    let started = Instant::now();
    let established = match connector(descriptor, config.connection.connect_timeout()).await {
        Ok(established) => {
            report.phase_ok(Phase::Connect, started.elapsed());
            established
        }
        Err(e) => {
            report.abort(Phase::Connect, started.elapsed(), &e);
            return report.finish();
        }
    };
    report.established(established.mode);
    if let Some(ref e) = established.downgraded_after {
        report.warn(format!(
            "TLS handshake failed under security mode '{}', connected without TLS: {}",
            established.requested_mode, e.message
        ));
    }

    let mut target = established.value;
    apply_and_verify(&mut target, &statements, &config.verify, &mut report).await;

    if let Err(e) = target.close().await {
        tracing::warn!(error = %e, "Failed to close connection");
        report.warn(format!("Failed to close connection: {}", e));
    }

    let report = report.finish();
    tracing::info!(
        status = %report.status,
        applied = report.summary.applied,
        skipped_exists = report.summary.skipped_exists,
        failed = report.summary.failed,
        tables = report.tables.len(),
        "Bootstrap finished"
    );
    report
}

/// Apply the statements and record outcomes plus verification data.
pub async fn apply_and_verify<T>(
    target: &mut T,
    statements: &StatementSequence,
    settings: &VerifySettings,
    report: &mut ReportBuilder,
) where
    T: SchemaTarget + ?Sized,
{
    tracing::info!(statements = statements.len(), "Applying schema");
    let started = Instant::now();
    let steps = super::apply::execute(target, statements).await;
    report.steps(steps);
    report.phase_ok(Phase::Apply, started.elapsed());

    let started = Instant::now();
    let verification = super::apply::verify(target, settings).await;
    for (table, count) in verification.row_counts {
        report.row_count(table, count);
    }
    report.tables(verification.tables);
    report.missing_tables(verification.missing_tables);
    for warning in verification.warnings {
        report.warn(warning);
    }
    report.phase_ok(Phase::Verify, started.elapsed());
}

/// Read and parse the schema document.
pub fn load_schema(path: &Path, style: CommentStyle) -> Result<(StatementSequence, SchemaSummary)> {
    let document = statements::read_document(path)?;
    let sequence = statements::parse_with(&document, style);
    let summary = SchemaSummary {
        path: path.display().to_string(),
        checksum: format_checksum(calculate_checksum(&document)),
        statements: sequence.len(),
    };
    tracing::info!(
        path = %summary.path,
        statements = summary.statements,
        checksum = %summary.checksum,
        "Loaded schema document"
    );
    Ok((sequence, summary))
}
