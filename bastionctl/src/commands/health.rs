use anyhow::Result;
use bastion_core::verify::CheckResult;
use bastion_core::{HealthReport, VerificationRunner};
use clap::Args;
use tabled::{settings::style::Style, Table, Tabled};

use super::{paint_ok, paint_warn, Session};

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "CHECK")]
    check: &'static str,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "SEVERITY")]
    severity: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

impl From<&CheckResult> for CheckRow {
    fn from(result: &CheckResult) -> Self {
        let status = if result.passed() { "PASS" } else { "FAIL" };
        Self {
            check: result.name(),
            status: paint_ok(status, result.passed()),
            severity: format!("{:?}", result.fatality).to_lowercase(),
            detail: result.detail.clone(),
        }
    }
}

pub fn run(session: &Session, args: HealthArgs) -> Result<bool> {
    let report = VerificationRunner::new(&session.host, &session.config, session.facts.variant).run();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.isolation_available)
}

pub fn print_report(report: &HealthReport) {
    let rows: Vec<CheckRow> = report.checks.iter().map(CheckRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());

    println!(
        "Endpoint: {} ({})",
        report.endpoint.name,
        report.endpoint.address.as_deref().unwrap_or("no address")
    );
    println!("{}", table);
    println!(
        "Isolation available: {}",
        paint_ok(if report.isolation_available { "yes" } else { "no" }, report.isolation_available)
    );

    for warning in &report.warnings {
        println!("{} {}", paint_warn("warning:"), warning);
    }
    let failing: Vec<_> = report.checks.iter().filter(|c| !c.passed()).collect();
    if !failing.is_empty() {
        println!("\nRecommended action: {}", report.recommended_action);
        for check in failing {
            if let Some(remediation) = &check.remediation {
                println!("  {}: {}", check.name(), remediation);
            }
        }
    }
}
