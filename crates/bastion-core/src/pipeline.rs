//! Runs a platform's step table in order and summarizes the outcome.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::BastionConfig;
use crate::host::Host;
use crate::platform::{HostFacts, PlatformVariant};
use crate::step::{ProvisioningStep, StepContext, StepExecutor, StepOutcome, StepRecord};
use crate::steps;
use crate::verify::HealthReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PipelineOutcome {
    Success,
    Degraded {
        warnings: Vec<String>,
    },
    Fatal {
        step: String,
        cause: String,
        remediation: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineRun {
    pub variant: PlatformVariant,
    pub dry_run: bool,
    pub records: Vec<StepRecord>,
    pub outcome: PipelineOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<HealthReport>,
}

impl PipelineRun {
    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Fatal { .. })
    }

    /// Verification ran and every check passed, the smoke workload included.
    /// Stateful legacy resources are only ever removed behind this.
    pub fn verified(&self) -> bool {
        !self.dry_run
            && !self.is_fatal()
            && self
                .verification
                .as_ref()
                .map(HealthReport::passed)
                .unwrap_or(false)
    }

    pub fn record(&self, name: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}

pub struct ProvisioningPipeline<'a> {
    ctx: StepContext<'a>,
    steps: Vec<Box<dyn ProvisioningStep>>,
}

impl<'a> ProvisioningPipeline<'a> {
    pub fn new(host: &'a dyn Host, config: &'a BastionConfig, facts: HostFacts) -> Self {
        Self::with_steps(host, config, facts, steps::for_variant(facts.variant))
    }

    pub fn with_steps(
        host: &'a dyn Host,
        config: &'a BastionConfig,
        facts: HostFacts,
        steps: Vec<Box<dyn ProvisioningStep>>,
    ) -> Self {
        Self {
            ctx: StepContext::new(host, config, facts),
            steps,
        }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order. Outside dry-run the first fatal record stops
    /// the run; in dry-run every step is previewed.
    #[instrument(skip(self), fields(variant = %self.ctx.facts.variant))]
    pub fn run(&self, dry_run: bool) -> PipelineRun {
        let executor = StepExecutor::new(&self.ctx, dry_run);
        let mut records = Vec::with_capacity(self.steps.len());
        let mut warnings = Vec::new();
        let mut fatal = None;

        for step in &self.steps {
            let record = executor.run(step.as_ref());
            match &record.outcome {
                StepOutcome::Applied(step_warnings) => {
                    warnings.extend(step_warnings.iter().map(|w| format!("{}: {}", record.name, w)));
                }
                StepOutcome::Warning(cause) => warnings.push(format!("{}: {}", record.name, cause)),
                StepOutcome::Fatal(cause) => {
                    fatal = Some(PipelineOutcome::Fatal {
                        step: record.name.clone(),
                        cause: cause.clone(),
                        remediation: record.remediation.clone().unwrap_or_default(),
                    });
                }
                StepOutcome::Skipped | StepOutcome::Previewed(_) => {}
            }
            records.push(record);
            if fatal.is_some() {
                break;
            }
        }

        let outcome = match fatal {
            Some(outcome) => {
                warn!(?outcome, "provisioning aborted");
                outcome
            }
            None if warnings.is_empty() => PipelineOutcome::Success,
            None => PipelineOutcome::Degraded { warnings },
        };
        info!(steps = records.len(), dry_run, "provisioning finished");

        PipelineRun {
            variant: self.ctx.facts.variant,
            dry_run,
            records,
            outcome,
            verification: self.ctx.take_verification(),
        }
    }
}
