//! The bootstrap report and the builder that assembles it during a run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ConnectionDescriptor, SecurityMode, TransportFamily};
use crate::error::{BootstrapError, ConnectionErrorCategory, ErrorKind};

/// Per-statement verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Applied,
    SkippedExists,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Applied => write!(f, "applied"),
            Verdict::SkippedExists => write!(f, "skipped_exists"),
            Verdict::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub statement: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Config,
    LoadSchema,
    Connect,
    Apply,
    Verify,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Config,
        Phase::LoadSchema,
        Phase::Connect,
        Phase::Apply,
        Phase::Verify,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Config => write!(f, "config"),
            Phase::LoadSchema => write!(f, "load_schema"),
            Phase::Connect => write!(f, "connect"),
            Phase::Apply => write!(f, "apply"),
            Phase::Verify => write!(f, "verify"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    CompletedWithErrors,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RunStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub total: usize,
    pub applied: usize,
    pub skipped_exists: usize,
    pub failed: usize,
}

impl StepSummary {
    pub fn from_steps(steps: &[StepOutcome]) -> Self {
        let count = |v: Verdict| steps.iter().filter(|s| s.verdict == v).count();
        Self {
            total: steps.len(),
            applied: count(Verdict::Applied),
            skipped_exists: count(Verdict::SkippedExists),
            failed: count(Verdict::Failed),
        }
    }
}

/// Where the run connected. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub family: TransportFamily,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub requested_security_mode: SecurityMode,
    /// Set once a connection attempt succeeded.
    pub security_mode: Option<SecurityMode>,
}

impl ConnectionSummary {
    pub fn from_descriptor(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            family: descriptor.family,
            host: descriptor.host.clone(),
            port: descriptor.port,
            database: descriptor.database.clone(),
            user: descriptor.user.clone(),
            requested_security_mode: descriptor.security_mode,
            security_mode: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaSummary {
    pub path: String,
    pub checksum: String,
    pub statements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ConnectionErrorCategory>,
    pub message: String,
}

impl From<&BootstrapError> for ReportError {
    fn from(e: &BootstrapError) -> Self {
        Self {
            kind: e.kind(),
            category: e.connection_category(),
            message: e.to_string(),
        }
    }
}

/// Aggregate result of one bootstrap run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub timestamp: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub phases: Vec<PhaseRecord>,
    pub steps: Vec<StepOutcome>,
    pub summary: StepSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSummary>,
    pub tables: BTreeSet<String>,
    pub row_counts: BTreeMap<String, i64>,
    pub missing_tables: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl BootstrapReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Steps that did not apply cleanly, in order.
    pub fn problem_steps(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.verdict != Verdict::Applied)
    }
}

/// Overall status from the fatal error (if any) and the step verdicts.
pub fn assemble_status(fatal: bool, steps: &[StepOutcome]) -> RunStatus {
    if fatal {
        RunStatus::Error
    } else if steps.iter().any(|s| s.verdict == Verdict::Failed) {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::Success
    }
}

/// Collects results while a run progresses. Consumed by [`ReportBuilder::finish`].
#[derive(Debug)]
pub struct ReportBuilder {
    timestamp: DateTime<Utc>,
    phases: Vec<PhaseRecord>,
    steps: Vec<StepOutcome>,
    connection: Option<ConnectionSummary>,
    schema: Option<SchemaSummary>,
    tables: BTreeSet<String>,
    row_counts: BTreeMap<String, i64>,
    missing_tables: Vec<String>,
    warnings: Vec<String>,
    error: Option<ReportError>,
}

impl ReportBuilder {
    pub fn start() -> Self {
        Self {
            timestamp: Utc::now(),
            phases: Vec::new(),
            steps: Vec::new(),
            connection: None,
            schema: None,
            tables: BTreeSet::new(),
            row_counts: BTreeMap::new(),
            missing_tables: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn phase_ok(&mut self, phase: Phase, elapsed: Duration) {
        self.phases.push(PhaseRecord {
            phase,
            status: PhaseStatus::Ok,
            duration_ms: elapsed.as_millis() as u64,
            detail: None,
        });
    }

    /// Record a fatal failure. The phases after it are marked skipped on finish.
    pub fn abort(&mut self, phase: Phase, elapsed: Duration, err: &BootstrapError) {
        tracing::error!(phase = %phase, error = %err, "Bootstrap aborted");
        self.phases.push(PhaseRecord {
            phase,
            status: PhaseStatus::Failed,
            duration_ms: elapsed.as_millis() as u64,
            detail: Some(err.to_string()),
        });
        self.error = Some(ReportError::from(err));
    }

    pub fn connection(&mut self, summary: ConnectionSummary) {
        self.connection = Some(summary);
    }

    pub fn established(&mut self, mode: SecurityMode) {
        if let Some(ref mut c) = self.connection {
            c.security_mode = Some(mode);
        }
    }

    pub fn schema(&mut self, summary: SchemaSummary) {
        self.schema = Some(summary);
    }

    pub fn steps(&mut self, steps: Vec<StepOutcome>) {
        self.steps = steps;
    }

    pub fn tables(&mut self, tables: BTreeSet<String>) {
        self.tables = tables;
    }

    pub fn row_count(&mut self, table: impl Into<String>, count: i64) {
        self.row_counts.insert(table.into(), count);
    }

    pub fn missing_tables(&mut self, tables: Vec<String>) {
        self.missing_tables = tables;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(mut self) -> BootstrapReport {
        for phase in Phase::ALL {
            if !self.phases.iter().any(|p| p.phase == phase) {
                self.phases.push(PhaseRecord {
                    phase,
                    status: PhaseStatus::Skipped,
                    duration_ms: 0,
                    detail: None,
                });
            }
        }
        self.phases.sort_by_key(|p| Phase::ALL.iter().position(|&q| q == p.phase));

        let status = assemble_status(self.error.is_some(), &self.steps);
        let summary = StepSummary::from_steps(&self.steps);

        BootstrapReport {
            timestamp: self.timestamp,
            finished_at: Utc::now(),
            status,
            phases: self.phases,
            steps: self.steps,
            summary,
            connection: self.connection,
            schema: self.schema,
            tables: self.tables,
            row_counts: self.row_counts,
            missing_tables: self.missing_tables,
            warnings: self.warnings,
            error: self.error,
        }
    }
}
