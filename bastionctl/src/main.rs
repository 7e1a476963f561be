mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use commands::{health, migrate, resolve, setup, Session};

#[derive(Parser)]
#[command(name = "bastionctl", version, about = "Provision and resolve the Bastion isolated container engine")]
struct Cli {
    /// Config file (default: BASTION_CONFIG, then <config dir>/bastion/config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bound on each engine query, e.g. "10s" or "1500ms"
    #[arg(long, global = true, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the endpoint workloads should use
    Resolve(resolve::ResolveArgs),
    /// Verify that the primary endpoint isolates workloads
    Health(health::HealthArgs),
    /// Provision or repair the isolated engine, then retire the legacy layout
    Setup(setup::SetupArgs),
    /// Retire resources of the legacy layout
    Migrate(migrate::MigrateArgs),
    /// Print version and exit
    Version,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let ok = match cli.cmd {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            true
        }
        cmd => {
            let session = Session::load(cli.config.as_deref(), cli.timeout)?;
            match cmd {
                Commands::Resolve(args) => resolve::run(&session, args)?,
                Commands::Health(args) => health::run(&session, args)?,
                Commands::Setup(args) => setup::run(&session, args)?,
                Commands::Migrate(args) => migrate::run(&session, args)?,
                Commands::Version => true,
            }
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
