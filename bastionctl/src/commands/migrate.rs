use anyhow::Result;
use bastion_core::{LegacyMigrator, MigrationOptions, VerificationRunner};
use clap::Args;

use super::{confirmer, print_migration, Session};

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Remove stateful legacy resources without asking, once verification passed
    #[arg(long)]
    pub force: bool,

    /// Answer yes to every removal prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// List what would be removed and change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Treat the primary endpoint as verified instead of checking it now
    #[arg(long)]
    pub verified: bool,

    /// Output the migration report as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(session: &Session, args: MigrateArgs) -> Result<bool> {
    let verified = if args.verified || args.dry_run {
        args.verified
    } else {
        let report =
            VerificationRunner::new(&session.host, &session.config, session.facts.variant).run();
        if !report.passed() {
            eprintln!(
                "warning: {} did not pass every check ({}); stateful legacy resources are kept",
                session.config.endpoint.primary, report.recommended_action
            );
        }
        report.passed()
    };

    let confirmer = confirmer(args.yes);
    let migrator = LegacyMigrator::new(
        &session.host,
        &session.config,
        session.facts.variant,
        confirmer.as_ref(),
    );
    let report = migrator.migrate(MigrationOptions {
        verified,
        force: args.force,
        dry_run: args.dry_run,
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_migration(&report);
    }
    Ok(!report.has_failures())
}
