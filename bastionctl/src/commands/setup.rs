use anyhow::Result;
use bastion_core::{
    EndpointResolver, LegacyMigrator, MigrationOptions, PipelineOutcome, PipelineRun,
    ProvisioningPipeline, StepOutcome,
};
use clap::Args;

use super::{confirmer, paint_ok, paint_warn, print_migration, Session};

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Print the commands every step would run and change nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Remove stateful legacy resources without asking, once verification passed
    #[arg(long)]
    pub force: bool,

    /// Answer yes to every removal prompt
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Output the pipeline run as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(session: &Session, args: SetupArgs) -> Result<bool> {
    let pipeline = ProvisioningPipeline::new(&session.host, &session.config, session.facts);
    let run = pipeline.run(args.dry_run);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    if run.is_fatal() {
        return Ok(false);
    }

    let confirmer = confirmer(args.yes);
    let migrator = LegacyMigrator::new(
        &session.host,
        &session.config,
        session.facts.variant,
        confirmer.as_ref(),
    );
    let report = migrator.migrate(MigrationOptions {
        verified: run.verified(),
        force: args.force,
        dry_run: args.dry_run,
    });
    if !args.json {
        println!();
        print_migration(&report);
    }

    if args.dry_run {
        return Ok(true);
    }

    let resolution = EndpointResolver::new(&session.host, &session.config, session.facts).resolve(None);
    match resolution.endpoint() {
        Some(name) => {
            if !args.json {
                println!("\nActive endpoint: {}", name);
            }
            Ok(!report.has_failures())
        }
        None => {
            eprintln!("Provisioning finished but no endpoint resolves; run `bastionctl health`.");
            Ok(false)
        }
    }
}

fn print_run(run: &PipelineRun) {
    let mode = if run.dry_run { " (dry run)" } else { "" };
    println!("Provisioning for {}{}", run.variant, mode);

    for record in &run.records {
        let label = match &record.outcome {
            StepOutcome::Skipped => "ok      ".to_string(),
            StepOutcome::Previewed(_) => paint_warn("plan    "),
            StepOutcome::Applied(_) => paint_ok("applied ", true),
            StepOutcome::Warning(_) => paint_warn("warning "),
            StepOutcome::Fatal(_) => paint_ok("FAILED  ", false),
        };
        println!("{} {:<24} {}", label, record.name, record.description);

        match &record.outcome {
            StepOutcome::Previewed(commands) => {
                for command in commands {
                    println!("           {}", command);
                }
            }
            StepOutcome::Applied(warnings) => {
                for warning in warnings {
                    println!("           warning: {}", warning);
                }
            }
            StepOutcome::Warning(cause) | StepOutcome::Fatal(cause) => {
                println!("           {}", cause);
                if let Some(remediation) = &record.remediation {
                    println!("           fix: {}", remediation);
                }
            }
            StepOutcome::Skipped => {}
        }
    }

    match &run.outcome {
        PipelineOutcome::Success => println!("\n{}", paint_ok("Setup complete.", true)),
        PipelineOutcome::Degraded { warnings } => {
            println!("\n{} ({} warnings)", paint_warn("Setup complete with warnings"), warnings.len())
        }
        PipelineOutcome::Fatal {
            step,
            cause,
            remediation,
        } => {
            eprintln!("\nSetup failed at {}: {}", step, cause);
            if !remediation.is_empty() {
                eprintln!("Remediation: {}", remediation);
            }
        }
    }
    if let Some(report) = &run.verification {
        if !report.passed() {
            println!("Recommended action: {}", report.recommended_action);
        }
    }
}
