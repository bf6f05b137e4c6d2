use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use boxx_bootstrap_core::commands::diagnose::DiagnosticReport;
use boxx_bootstrap_core::report::PhaseStatus;
use boxx_bootstrap_core::{
    BootstrapReport, RunStatus, SchemaSummary, StatementSequence, Verdict,
};

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.into_iter().map(Cell::new).collect::<Vec<_>>());
    table
}

fn format_verdict(verdict: Verdict) -> String {
    match verdict {
        Verdict::Applied => "Applied".green().to_string(),
        Verdict::SkippedExists => "Exists".cyan().to_string(),
        Verdict::Failed => "Failed".red().bold().to_string(),
    }
}

/// Print a bootstrap report summary.
pub fn print_bootstrap_report(report: &BootstrapReport) {
    if let Some(ref c) = report.connection {
        let mode = match c.security_mode {
            Some(established) if established != c.requested_security_mode => {
                format!("{} (requested {})", established, c.requested_security_mode)
                    .yellow()
                    .to_string()
            }
            Some(established) => established.to_string(),
            None => format!("{} (not connected)", c.requested_security_mode),
        };
        println!(
            "{} {} {}:{}/{} as {}, TLS {}",
            "Database:".bold(),
            c.family,
            c.host,
            c.port,
            c.database,
            c.user,
            mode
        );
    }

    if let Some(ref s) = report.schema {
        println!(
            "{} {} ({} statement(s), checksum {})",
            "Schema:".bold(),
            s.path,
            s.statements,
            s.checksum
        );
    }

    let problems: Vec<_> = report.problem_steps().collect();
    if !problems.is_empty() {
        let mut table = new_table(vec!["#", "Result", "Statement", "Detail"]);
        for step in problems {
            table.add_row(vec![
                Cell::new(step.index + 1),
                Cell::new(format_verdict(step.verdict)),
                Cell::new(&step.statement),
                Cell::new(step.detail.as_deref().unwrap_or("")),
            ]);
        }
        println!("{table}");
    }

    if !report.steps.is_empty() {
        println!(
            "Statements: {} applied, {} already present, {} failed ({} total)",
            report.summary.applied.to_string().green(),
            report.summary.skipped_exists.to_string().cyan(),
            if report.summary.failed > 0 {
                report.summary.failed.to_string().red().bold()
            } else {
                report.summary.failed.to_string().normal()
            },
            report.summary.total
        );
    }

    if !report.tables.is_empty() {
        println!(
            "{} {}",
            format!("Tables ({}):", report.tables.len()).bold(),
            report.tables.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    for (table, count) in &report.row_counts {
        println!("  {} {}: {} row(s)", "→".green(), table, count);
    }
    for table in &report.missing_tables {
        println!("{} Expected table '{}' is missing", "WARNING:".yellow().bold(), table);
    }
    for warning in &report.warnings {
        println!("{} {}", "WARNING:".yellow().bold(), warning);
    }

    for phase in &report.phases {
        if phase.status == PhaseStatus::Failed {
            println!(
                "{} {} phase failed",
                "ERROR:".red().bold(),
                phase.phase
            );
        }
    }
    if let Some(ref e) = report.error {
        println!("{} {}", "ERROR:".red().bold(), e.message);
    }

    let elapsed = (report.finished_at - report.timestamp).num_milliseconds();
    match report.status {
        RunStatus::Success => println!(
            "{}",
            format!("Bootstrap completed successfully ({}ms)", elapsed).green().bold()
        ),
        RunStatus::CompletedWithErrors => println!(
            "{}",
            format!(
                "Bootstrap completed with {} failed statement(s) ({}ms)",
                report.summary.failed, elapsed
            )
            .yellow()
            .bold()
        ),
        RunStatus::Error => println!("{}", "Bootstrap failed.".red().bold()),
    }
}

/// Print the statements found in the schema document.
pub fn print_parse_result(statements: &StatementSequence, summary: &SchemaSummary) {
    println!(
        "{}",
        format!(
            "{}: {} statement(s), checksum {}",
            summary.path, summary.statements, summary.checksum
        )
        .bold()
    );

    if !statements.is_empty() {
        let mut table = new_table(vec!["#", "Statement"]);
        for (i, sql) in statements.iter().enumerate() {
            table.add_row(vec![
                Cell::new(i + 1),
                Cell::new(boxx_bootstrap_core::statements::preview(sql, 100)),
            ]);
        }
        println!("{table}");
    }

    if let Some(ref tail) = statements.unterminated_tail {
        println!(
            "{} Unterminated statement at end of document will not be executed: {}",
            "WARNING:".yellow().bold(),
            boxx_bootstrap_core::statements::preview(tail, 80)
        );
    }
}

/// Print diagnostics as tables.
pub fn print_diagnostic_report(report: &DiagnosticReport) {
    let mut env_table = new_table(vec!["Setting", "Status", "Variable", "Source", "Value"]);
    for check in &report.environment {
        let status = if check.set {
            "set".green().to_string()
        } else {
            "not set".yellow().to_string()
        };
        env_table.add_row(vec![
            Cell::new(check.key),
            Cell::new(status),
            Cell::new(check.alias.unwrap_or("")),
            Cell::new(check.source.as_deref().unwrap_or("")),
            Cell::new(check.value.as_deref().unwrap_or(if check.set { "****" } else { "" })),
        ]);
    }
    println!("{env_table}");

    if let Some(ref reason) = report.skipped {
        println!("{} Network checks skipped: {}", "WARNING:".yellow().bold(), reason);
        if let Some(ref e) = report.config_error {
            println!("  {}", e.dimmed());
        }
    }

    if let Some(ref dns) = report.dns {
        if dns.resolved {
            println!(
                "{} {} {} {}",
                "✓".green(),
                "DNS".bold(),
                dns.host,
                format!("→ {}", dns.addresses.join(", ")).dimmed()
            );
        } else {
            println!(
                "{} {} {}: {}",
                "✗".red(),
                "DNS".bold(),
                dns.host,
                dns.error.as_deref().unwrap_or("no addresses")
            );
        }
    }

    if let Some(ref tcp) = report.tcp {
        if tcp.reachable {
            println!("{} {} {} ({}ms)", "✓".green(), "TCP".bold(), tcp.address, tcp.elapsed_ms);
        } else {
            println!(
                "{} {} {}: {}",
                "✗".red(),
                "TCP".bold(),
                tcp.address,
                tcp.error.as_deref().unwrap_or("unreachable")
            );
        }
    }

    for attempt in &report.attempts {
        if attempt.success {
            println!(
                "{} {} TLS {} ({}ms)",
                "✓".green(),
                "Connect".bold(),
                attempt.security_mode,
                attempt.elapsed_ms
            );
        } else {
            println!(
                "{} {} TLS {}: {} {}",
                "✗".red(),
                "Connect".bold(),
                attempt.security_mode,
                attempt
                    .category
                    .map(|c| c.to_string())
                    .unwrap_or_default()
                    .red(),
                attempt.message.as_deref().unwrap_or("").dimmed()
            );
        }
    }

    if report.healthy {
        println!("{}", "Database is reachable.".green().bold());
    } else {
        println!("{}", "Database is not reachable.".red().bold());
    }
}
