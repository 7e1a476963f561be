//! Declarative provisioning steps and the executor that runs them idempotently.
//!
//! A step is described by a precondition, a preview of the exact commands it
//! would run, an action and a postcondition. [`StepExecutor::run`] evaluates
//! them in that order, so a step whose end state already holds does nothing.

use anyhow::Result;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::config::BastionConfig;
use crate::engine::EngineCli;
use crate::host::{CommandOutput, CommandSpec, Host};
use crate::platform::HostFacts;
use crate::probe::{AvailabilityProbe, ProbeOptions};
use crate::verify::HealthReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    /// A failure aborts the pipeline.
    Fatal,
    /// A failure is reported as a warning and the pipeline continues.
    NonCritical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum StepOutcome {
    Skipped,
    Previewed(Vec<String>),
    Applied(Vec<String>),
    Fatal(String),
    Warning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub description: String,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl StepRecord {
    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, StepOutcome::Fatal(_))
    }
}

/// Everything a step may consult or act on.
pub struct StepContext<'a> {
    pub host: &'a dyn Host,
    pub engine: EngineCli<'a>,
    pub config: &'a BastionConfig,
    pub facts: HostFacts,
    verification: RefCell<Option<HealthReport>>,
    /// Services whose config or unit was rewritten during this run.
    restarts: RefCell<BTreeSet<String>>,
}

impl<'a> StepContext<'a> {
    pub fn new(host: &'a dyn Host, config: &'a BastionConfig, facts: HostFacts) -> Self {
        Self {
            host,
            engine: EngineCli::new(host, config.probe.timeout(), config.probe.workload_timeout()),
            config,
            facts,
            verification: RefCell::new(None),
            restarts: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            runtime: self.config.runtime.name.clone(),
            require_runtime: true,
        }
    }

    pub fn probe(&self) -> AvailabilityProbe<'a> {
        AvailabilityProbe::new(self.host, self.engine, self.probe_options())
    }

    /// Run a command that must succeed.
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.host.execute(spec)?;
        if !output.success() {
            anyhow::bail!("`{}` failed: {}", spec.display(), output.diagnostic());
        }
        Ok(output)
    }

    /// Run a read-only query and report whether it exited zero.
    pub fn succeeds(&self, spec: &CommandSpec) -> Result<bool> {
        Ok(self.host.execute(spec)?.success())
    }

    /// Mark `service` as running stale configuration.
    pub fn request_restart(&self, service: &str) {
        debug!(service, "restart requested");
        self.restarts.borrow_mut().insert(service.to_string());
    }

    pub fn restart_pending(&self, service: &str) -> bool {
        self.restarts.borrow().contains(service)
    }

    pub fn clear_restart(&self, service: &str) {
        self.restarts.borrow_mut().remove(service);
    }

    pub fn record_verification(&self, report: HealthReport) {
        *self.verification.borrow_mut() = Some(report);
    }

    pub fn take_verification(&self) -> Option<HealthReport> {
        self.verification.borrow_mut().take()
    }

    pub fn peek_verification<T>(&self, f: impl FnOnce(Option<&HealthReport>) -> Option<T>) -> Option<T> {
        f(self.verification.borrow().as_ref())
    }
}

pub trait ProvisioningStep {
    /// Stable identifier used in reports and remediation text.
    fn name(&self) -> &'static str;

    fn description(&self) -> String;

    fn criticality(&self) -> Criticality {
        Criticality::Fatal
    }

    /// A reason this step can never succeed here, checked before anything else.
    fn refusal(&self, _ctx: &StepContext<'_>) -> Option<String> {
        None
    }

    /// Whether the step's end state already holds.
    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool>;

    /// The exact commands `apply` would run.
    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String>;

    /// Bring the end state about. Returns non-fatal warnings.
    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>>;

    fn postcondition(&self, ctx: &StepContext<'_>) -> Result<bool> {
        self.is_satisfied(ctx)
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String;
}

pub struct StepExecutor<'c, 'a> {
    ctx: &'c StepContext<'a>,
    dry_run: bool,
}

impl<'c, 'a> StepExecutor<'c, 'a> {
    pub fn new(ctx: &'c StepContext<'a>, dry_run: bool) -> Self {
        Self { ctx, dry_run }
    }

    pub fn run(&self, step: &dyn ProvisioningStep) -> StepRecord {
        let name = step.name();

        if let Some(reason) = step.refusal(self.ctx) {
            return self.failure(step, reason);
        }

        match step.is_satisfied(self.ctx) {
            Ok(true) => {
                debug!(step = name, "already satisfied");
                return self.record(step, StepOutcome::Skipped, None);
            }
            Ok(false) => {}
            Err(err) if self.dry_run => {
                debug!(step = name, error = %format!("{:#}", err), "precondition unknown in dry-run");
            }
            Err(err) => {
                return self.failure(step, format!("precondition check failed: {:#}", err));
            }
        }

        if self.dry_run {
            return self.record(step, StepOutcome::Previewed(step.preview(self.ctx)), None);
        }

        info!(step = name, "applying");
        let warnings = match step.apply(self.ctx) {
            Ok(warnings) => warnings,
            Err(err) => return self.failure(step, format!("{:#}", err)),
        };

        match step.postcondition(self.ctx) {
            Ok(true) => self.record(step, StepOutcome::Applied(warnings), None),
            Ok(false) => self.failure(step, "end state not reached after apply".to_string()),
            Err(err) => self.failure(step, format!("postcondition check failed: {:#}", err)),
        }
    }

    fn failure(&self, step: &dyn ProvisioningStep, cause: String) -> StepRecord {
        let remediation = Some(step.remediation(self.ctx));
        match step.criticality() {
            Criticality::Fatal => {
                warn!(step = step.name(), %cause, "step failed");
                self.record(step, StepOutcome::Fatal(cause), remediation)
            }
            Criticality::NonCritical => {
                warn!(step = step.name(), %cause, "non-critical step failed, continuing");
                self.record(step, StepOutcome::Warning(cause), remediation)
            }
        }
    }

    fn record(
        &self,
        step: &dyn ProvisioningStep,
        outcome: StepOutcome,
        remediation: Option<String>,
    ) -> StepRecord {
        StepRecord {
            name: step.name().to_string(),
            description: step.description(),
            outcome,
            remediation,
        }
    }
}
