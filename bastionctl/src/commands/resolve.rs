use anyhow::Result;
use bastion_core::{EndpointResolver, Resolution};
use clap::Args;

use super::Session;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Endpoint to try before the primary (default: BASTION_CONTEXT)
    #[arg(long, value_name = "NAME")]
    pub context: Option<String>,

    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(session: &Session, args: ResolveArgs) -> Result<bool> {
    let resolver = EndpointResolver::new(&session.host, &session.config, session.facts);
    let resolution = resolver.resolve_with_env(args.context.as_deref());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
        return Ok(resolution.is_found());
    }

    for warning in resolution.warnings() {
        eprintln!("warning: {}", warning);
    }

    match &resolution {
        Resolution::Endpoint { name, source, .. } => {
            tracing::debug!(%source, "resolved");
            println!("{}", name);
            Ok(true)
        }
        Resolution::NotFound { attempts, .. } => {
            eprintln!("No isolated endpoint is available:");
            for attempt in attempts {
                eprintln!("  - {}", attempt);
            }
            eprintln!("Run `bastionctl setup` to provision one.");
            Ok(false)
        }
    }
}
