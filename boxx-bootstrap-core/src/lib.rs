pub mod checksum;
pub mod commands;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod report;
pub mod statements;

use config::{BootstrapConfig, ConnectionDescriptor};
use error::Result;
use statements::CommentStyle;

pub use commands::diagnose::DiagnosticReport;
pub use config::{CliOverrides, SecurityMode, TransportFamily};
pub use env::EnvSource;
pub use report::{BootstrapReport, RunStatus, SchemaSummary, StepOutcome, Verdict};
pub use statements::StatementSequence;

/// Main entry point for the bootstrap library.
///
/// Holds the run settings and the ordered environment sources (earliest
/// wins). Nothing connects until [`Bootstrap::run`] or
/// [`Bootstrap::diagnose`] is called.
pub struct Bootstrap {
    pub config: BootstrapConfig,
    sources: Vec<EnvSource>,
}

impl Bootstrap {
    pub fn new(config: BootstrapConfig, sources: Vec<EnvSource>) -> Self {
        Self { config, sources }
    }

    pub fn sources(&self) -> &[EnvSource] {
        &self.sources
    }

    /// Resolve the connection descriptor without connecting.
    pub fn resolve(&self) -> Result<ConnectionDescriptor> {
        env::resolve(&self.sources)
    }

    /// Load and split the schema document without connecting.
    ///
    /// Uses the resolved engine's comment rules when the settings resolve.
    pub fn parse_schema(&self) -> Result<(StatementSequence, SchemaSummary)> {
        let style = self
            .resolve()
            .map(|descriptor| CommentStyle::from(descriptor.family))
            .unwrap_or_default();
        commands::bootstrap::load_schema(&self.config.schema.path, style)
    }

    /// Apply the schema document and return the full report.
    pub async fn run(&self) -> BootstrapReport {
        commands::bootstrap::execute(&self.config, &self.sources).await
    }

    /// Probe the environment and the database server.
    pub async fn diagnose(&self) -> DiagnosticReport {
        commands::diagnose::execute(&self.sources, self.config.connection.connect_timeout()).await
    }
}
