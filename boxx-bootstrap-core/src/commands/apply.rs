use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::config::VerifySettings;
use crate::db::SchemaTarget;
use crate::error::StatementError;
use crate::report::{StepOutcome, Verdict};
use crate::statements::{preview, StatementSequence};

/// Statement preview length in reports.
const PREVIEW_CHARS: usize = 80;

/// Execute every statement in order, one attempt each.
///
/// A failed statement does not stop the run. There is no wrapping
/// transaction, so statements that succeeded stay applied.
pub async fn execute<T>(target: &mut T, statements: &StatementSequence) -> Vec<StepOutcome>
where
    T: SchemaTarget + ?Sized,
{
    let mut outcomes = Vec::with_capacity(statements.len());

    for (index, sql) in statements.iter().enumerate() {
        let start = Instant::now();
        let result = target.execute(sql).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;
        let statement = preview(sql, PREVIEW_CHARS);

        let (verdict, detail) = match result {
            Ok(()) => {
                tracing::debug!(index, statement = %statement, "Statement applied");
                (Verdict::Applied, None)
            }
            Err(StatementError::AlreadyExists(msg)) => {
                tracing::info!(index, statement = %statement, "Object already exists, skipping");
                (Verdict::SkippedExists, Some(msg))
            }
            Err(StatementError::Failed(msg)) => {
                tracing::warn!(index, statement = %statement, error = %msg, "Statement failed");
                (Verdict::Failed, Some(msg))
            }
        };

        outcomes.push(StepOutcome {
            index,
            verdict,
            detail,
            statement,
            execution_time_ms,
        });
    }

    outcomes
}

/// Table inventory and verification data gathered after the apply phase.
#[derive(Debug, Default)]
pub struct Verification {
    pub tables: BTreeSet<String>,
    pub row_counts: BTreeMap<String, i64>,
    pub missing_tables: Vec<String>,
    pub warnings: Vec<String>,
}

/// Query the live table inventory and the configured verification checks.
///
/// Nothing here fails the run; query errors become warnings.
pub async fn verify<T>(target: &mut T, settings: &VerifySettings) -> Verification
where
    T: SchemaTarget + ?Sized,
{
    let mut verification = Verification::default();

    match target.list_tables().await {
        Ok(tables) => verification.tables = tables,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list tables");
            verification
                .warnings
                .push(format!("Table inventory unavailable: {}", e));
            return verification;
        }
    }

    for table in &settings.count_rows {
        if !verification.tables.contains(table) {
            continue;
        }
        match target.count_rows(table).await {
            Ok(count) => {
                verification.row_counts.insert(table.clone(), count);
            }
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Failed to count rows");
                verification
                    .warnings
                    .push(format!("Row count for '{}' unavailable: {}", table, e));
            }
        }
    }

    verification.missing_tables = settings
        .expected_tables
        .iter()
        .filter(|t| !verification.tables.contains(*t))
        .cloned()
        .collect();

    if !verification.missing_tables.is_empty() {
        tracing::warn!(
            missing = %verification.missing_tables.join(", "),
            "Expected tables are missing"
        );
    }

    verification
}
