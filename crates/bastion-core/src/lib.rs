//! Provisioning, verification and endpoint resolution for the Bastion
//! isolated container engine.
//!
//! The resolver picks which engine context currently provides hardened
//! isolation. When none does, the provisioning pipeline installs or repairs
//! one for the detected platform, the verification runner proves it works,
//! and the legacy migrator retires the previous layout.

pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod host;
pub mod idmap;
pub mod lima;
pub mod migrate;
pub mod pipeline;
pub mod platform;
pub mod poll;
pub mod probe;
pub mod resolver;
pub mod step;
pub mod steps;
pub mod verify;

pub use config::BastionConfig;
pub use engine::{EngineCli, EngineEndpoint};
pub use error::BastionError;
pub use host::{CommandOutput, CommandSpec, Host, SystemHost};
pub use migrate::{Confirmer, LegacyMigrator, MigrationOptions, MigrationReport, NonInteractive};
pub use pipeline::{PipelineOutcome, PipelineRun, ProvisioningPipeline};
pub use platform::{ExecutionContext, HostFacts, PlatformVariant};
pub use poll::{poll_until, PollOutcome};
pub use probe::{AvailabilityProbe, ErrorKind, ProbeOptions, ProbeResult};
pub use resolver::{EndpointResolver, Resolution, ResolutionSource};
pub use step::{Criticality, ProvisioningStep, StepContext, StepExecutor, StepOutcome, StepRecord};
pub use verify::{HealthReport, RecommendedAction, VerificationRunner};
