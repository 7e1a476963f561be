pub mod health;
pub mod migrate;
pub mod resolve;
pub mod setup;

use anyhow::{Context, Result};
use bastion_core::migrate::{LegacyResource, MigrationAction};
use bastion_core::{BastionConfig, Confirmer, HostFacts, MigrationReport, NonInteractive, SystemHost};
use owo_colors::OwoColorize;
use std::env;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;

/// Everything a command needs, resolved once per invocation.
pub struct Session {
    pub host: SystemHost,
    pub config: BastionConfig,
    pub facts: HostFacts,
}

impl Session {
    pub fn load(config_path: Option<&Path>, timeout: Option<Duration>) -> Result<Self> {
        let mut config = BastionConfig::load(config_path).context("Failed to load configuration")?;
        if let Some(timeout) = timeout {
            config.probe.timeout_secs = timeout.as_secs().max(1);
        }
        let host = SystemHost::new();
        let facts = HostFacts::detect(&host).context("Failed to detect platform")?;
        tracing::debug!(variant = %facts.variant, context = ?facts.context, "session ready");
        Ok(Self { host, config, facts })
    }
}

/// Prompts on the terminal before a stateful resource is removed.
struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, resource: &LegacyResource) -> bool {
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "Remove {}? Anything stored in it is lost. [y/N] ",
            resource
        );
        let _ = stderr.flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

struct AssumeYes;

impl Confirmer for AssumeYes {
    fn confirm(&self, _resource: &LegacyResource) -> bool {
        true
    }
}

/// `--yes` answers every prompt; otherwise prompt only on a terminal.
pub fn confirmer(yes: bool) -> Box<dyn Confirmer> {
    if yes {
        Box::new(AssumeYes)
    } else if atty::is(atty::Stream::Stdin) {
        Box::new(TerminalConfirmer)
    } else {
        Box::new(NonInteractive)
    }
}

pub fn should_use_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    atty::is(atty::Stream::Stdout)
}

pub fn paint_ok(text: &str, ok: bool) -> String {
    match (should_use_color(), ok) {
        (false, _) => text.to_string(),
        (true, true) => text.green().to_string(),
        (true, false) => text.red().to_string(),
    }
}

pub fn paint_warn(text: &str) -> String {
    if should_use_color() {
        text.yellow().to_string()
    } else {
        text.to_string()
    }
}

pub fn print_migration(report: &MigrationReport) {
    if report.is_empty() {
        println!("No legacy resources found.");
    }
    for entry in &report.entries {
        match &entry.action {
            MigrationAction::Removed => println!("{} {}", paint_ok("removed ", true), entry.resource),
            MigrationAction::Retained { reason } => {
                println!("{} {} ({})", paint_warn("retained"), entry.resource, reason)
            }
            MigrationAction::Planned { commands } => {
                println!("{} {}", paint_warn("would remove"), entry.resource);
                for command in commands {
                    println!("    {}", command);
                }
            }
            MigrationAction::Failed { error } => {
                println!("{} {}: {}", paint_ok("failed  ", false), entry.resource, error)
            }
        }
    }
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
    if !report.instructions.is_empty() {
        println!("\nTo finish the migration by hand:");
        for instruction in &report.instructions {
            println!("  - {}", instruction);
        }
    }
}
