//! Post-provision verification and the health report built from it.
//!
//! Checks run in a fixed order and independently of one another: a failing
//! check does not stop later ones, so the report always lists every check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::config::BastionConfig;
use crate::engine::{ContextLookup, EngineCli, EngineEndpoint};
use crate::host::{CommandOutput, Host};
use crate::idmap::{parse_id_map, IdMapping};
use crate::platform::PlatformVariant;
use crate::probe::{classify, AvailabilityProbe, ErrorKind, ProbeOptions, ProbeResult};

pub const SMOKE_MARKER: &str = "bastion-smoke-ok";

const IMAGE_MISSING_PHRASES: [&str; 4] = [
    "unable to find image",
    "no such image",
    "manifest unknown",
    "pull access denied",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationCheck {
    EndpointExists,
    EngineReachable,
    RuntimeRegistered,
    IsolationDepth,
    SmokeWorkload,
}

impl VerificationCheck {
    pub const ORDER: [VerificationCheck; 5] = [
        VerificationCheck::EndpointExists,
        VerificationCheck::EngineReachable,
        VerificationCheck::RuntimeRegistered,
        VerificationCheck::IsolationDepth,
        VerificationCheck::SmokeWorkload,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VerificationCheck::EndpointExists => "endpoint-exists",
            VerificationCheck::EngineReachable => "engine-reachable",
            VerificationCheck::RuntimeRegistered => "runtime-registered",
            VerificationCheck::IsolationDepth => "isolation-depth",
            VerificationCheck::SmokeWorkload => "smoke-workload",
        }
    }

    pub fn fatality(&self) -> Fatality {
        match self {
            VerificationCheck::SmokeWorkload => Fatality::Warning,
            _ => Fatality::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fatality {
    Fatal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    #[default]
    None,
    RunSetup,
    StartService,
    RepairEndpoint,
    InstallRuntime,
    FixPermissions,
    InvestigateIsolation,
}

impl RecommendedAction {
    fn for_error(kind: Option<ErrorKind>) -> Self {
        match kind {
            Some(ErrorKind::PermissionDenied) => RecommendedAction::FixPermissions,
            Some(
                ErrorKind::SocketNotFound
                | ErrorKind::ConnectionRefused
                | ErrorKind::DaemonUnavailable
                | ErrorKind::Timeout,
            ) => RecommendedAction::StartService,
            Some(ErrorKind::ContextNotFound) => RecommendedAction::RepairEndpoint,
            Some(ErrorKind::RuntimeNotFound) => RecommendedAction::InstallRuntime,
            Some(ErrorKind::Unknown) | None => RecommendedAction::RunSetup,
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecommendedAction::None => "nothing to do",
            RecommendedAction::RunSetup => "run `bastionctl setup`",
            RecommendedAction::StartService => "start the engine (service or VM), then re-check",
            RecommendedAction::RepairEndpoint => "re-run `bastionctl setup` to repair the endpoint",
            RecommendedAction::InstallRuntime => "install and register the hardened runtime",
            RecommendedAction::FixPermissions => {
                "grant your user access to the engine socket (group membership or socket mode)"
            }
            RecommendedAction::InvestigateIsolation => {
                "workloads are not isolated; inspect the runtime and engine configuration"
            }
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: VerificationCheck,
    pub fatality: Fatality,
    pub status: CheckStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(skip)]
    action: RecommendedAction,
}

impl CheckResult {
    fn pass(check: VerificationCheck, detail: impl Into<String>) -> Self {
        Self {
            check,
            fatality: check.fatality(),
            status: CheckStatus::Pass,
            detail: detail.into(),
            remediation: None,
            action: RecommendedAction::None,
        }
    }

    fn fail(
        check: VerificationCheck,
        detail: impl Into<String>,
        action: RecommendedAction,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            check,
            fatality: check.fatality(),
            status: CheckStatus::Fail,
            detail: detail.into(),
            remediation: Some(remediation.into()),
            action,
        }
    }

    pub fn name(&self) -> &'static str {
        self.check.name()
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub endpoint: EngineEndpoint,
    pub variant: PlatformVariant,
    pub checks: Vec<CheckResult>,
    /// Every fatal check passed.
    pub isolation_available: bool,
    pub recommended_action: RecommendedAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Overall PASS: every check passed, warnings included.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn check(&self, check: VerificationCheck) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == check)
    }

    pub fn failures(&self, fatality: Fatality) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(move |c| !c.passed() && c.fatality == fatality)
    }
}

pub struct VerificationRunner<'a> {
    engine: EngineCli<'a>,
    probe: AvailabilityProbe<'a>,
    config: &'a BastionConfig,
    variant: PlatformVariant,
}

impl<'a> VerificationRunner<'a> {
    pub fn new(host: &'a dyn Host, config: &'a BastionConfig, variant: PlatformVariant) -> Self {
        let engine = EngineCli::new(host, config.probe.timeout(), config.probe.workload_timeout());
        Self::with_engine(host, engine, config, variant)
    }

    pub fn with_engine(
        host: &'a dyn Host,
        engine: EngineCli<'a>,
        config: &'a BastionConfig,
        variant: PlatformVariant,
    ) -> Self {
        let options = ProbeOptions {
            runtime: config.runtime.name.clone(),
            require_runtime: true,
        };
        Self {
            engine,
            probe: AvailabilityProbe::new(host, engine, options),
            config,
            variant,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.config.endpoint.primary))]
    pub fn run(&self) -> HealthReport {
        let name = self.config.endpoint.primary.as_str();
        let mut endpoint = EngineEndpoint::unknown(name);
        let mut warnings = Vec::new();
        let mut checks = Vec::with_capacity(VerificationCheck::ORDER.len());

        for check in VerificationCheck::ORDER {
            let result = match check {
                VerificationCheck::EndpointExists => self.endpoint_exists(name, &mut endpoint),
                VerificationCheck::EngineReachable => {
                    let probe = self.probe.without_capability_check().check(name);
                    warnings.extend(probe.warnings().iter().cloned());
                    self.engine_reachable(&probe)
                }
                VerificationCheck::RuntimeRegistered => {
                    let probe = self.probe.check(name);
                    self.runtime_registered(&probe)
                }
                VerificationCheck::IsolationDepth => self.isolation_depth(name),
                VerificationCheck::SmokeWorkload => self.smoke_workload(name),
            };
            debug!(check = check.name(), status = ?result.status, detail = %result.detail);
            checks.push(result);
        }

        let passed = |check: VerificationCheck| {
            checks
                .iter()
                .any(|c: &CheckResult| c.check == check && c.passed())
        };
        endpoint.reachable = passed(VerificationCheck::EngineReachable);
        endpoint.capable = passed(VerificationCheck::RuntimeRegistered);

        let isolation_available = checks
            .iter()
            .filter(|c| c.fatality == Fatality::Fatal)
            .all(CheckResult::passed);
        let recommended_action = checks
            .iter()
            .find(|c| !c.passed())
            .map(|c| c.action)
            .unwrap_or(RecommendedAction::None);

        if isolation_available {
            info!(endpoint = name, "isolation verified");
        } else {
            warn!(endpoint = name, action = ?recommended_action, "isolation unavailable");
        }

        HealthReport {
            endpoint,
            variant: self.variant,
            checks,
            isolation_available,
            recommended_action,
            warnings,
            checked_at: Utc::now(),
        }
    }

    fn endpoint_exists(&self, name: &str, endpoint: &mut EngineEndpoint) -> CheckResult {
        let check = VerificationCheck::EndpointExists;
        let expected = self.config.expected_address(self.variant);
        match self.engine.inspect_context(name) {
            Ok(ContextLookup::Found { address }) => {
                endpoint.exists = true;
                endpoint.address = Some(address.clone());
                if address == expected {
                    CheckResult::pass(check, format!("{} -> {}", name, address))
                } else {
                    CheckResult::fail(
                        check,
                        format!("{} is bound to {}, expected {}", name, address, expected),
                        RecommendedAction::RepairEndpoint,
                        self.engine.update_context_spec(name, &expected).display(),
                    )
                }
            }
            Ok(ContextLookup::Missing { diagnostic }) => CheckResult::fail(
                check,
                format!("{} does not exist: {}", name, diagnostic),
                RecommendedAction::RunSetup,
                "run `bastionctl setup`",
            ),
            Ok(ContextLookup::Unavailable { kind, diagnostic }) => {
                let action = RecommendedAction::for_error(Some(kind));
                CheckResult::fail(
                    check,
                    format!("could not inspect {}: {} ({})", name, kind, diagnostic),
                    action,
                    action.to_string(),
                )
            }
            Err(err) => CheckResult::fail(
                check,
                format!("{:#}", err),
                RecommendedAction::RunSetup,
                "check that the docker CLI is installed",
            ),
        }
    }

    fn engine_reachable(&self, probe: &ProbeResult) -> CheckResult {
        let check = VerificationCheck::EngineReachable;
        if probe.is_available() {
            return CheckResult::pass(
                check,
                format!("reachable at {}", probe.address().unwrap_or("unknown address")),
            );
        }
        let action = RecommendedAction::for_error(probe.error_kind());
        CheckResult::fail(check, probe.to_string(), action, action.to_string())
    }

    fn runtime_registered(&self, probe: &ProbeResult) -> CheckResult {
        let check = VerificationCheck::RuntimeRegistered;
        if probe.is_available() {
            return CheckResult::pass(
                check,
                format!("{} registered", self.config.runtime.name),
            );
        }
        let action = RecommendedAction::for_error(probe.error_kind());
        CheckResult::fail(check, probe.to_string(), action, action.to_string())
    }

    fn isolation_depth(&self, name: &str) -> CheckResult {
        let check = VerificationCheck::IsolationDepth;
        let output = match self.run_workload(name, &["cat", "/proc/self/uid_map"]) {
            Ok(output) => output,
            Err(failure) => return CheckResult::fail(check, failure.0, failure.1, failure.1.to_string()),
        };

        match parse_id_map(&output.stdout) {
            IdMapping::Remapped(ranges) => {
                let outside = ranges
                    .iter()
                    .find(|r| r.inside == 0)
                    .map(|r| r.outside.to_string())
                    .unwrap_or_else(|| "none".to_string());
                CheckResult::pass(check, format!("container uid 0 maps to host uid {}", outside))
            }
            IdMapping::Unremapped => CheckResult::fail(
                check,
                "container uid 0 is host uid 0; the workload is not user-namespace isolated",
                RecommendedAction::InvestigateIsolation,
                format!(
                    "confirm the {} service is running and the engine uses runtime {}",
                    self.config.runtime.service, self.config.runtime.name
                ),
            ),
            IdMapping::Unparseable(line) => CheckResult::fail(
                check,
                format!("unparseable uid_map output {:?}", line),
                RecommendedAction::InvestigateIsolation,
                "run the workload by hand and inspect /proc/self/uid_map",
            ),
        }
    }

    fn smoke_workload(&self, name: &str) -> CheckResult {
        let check = VerificationCheck::SmokeWorkload;
        match self.run_workload(name, &["echo", SMOKE_MARKER]) {
            Ok(output) if output.stdout.contains(SMOKE_MARKER) => {
                CheckResult::pass(check, "workload ran under the hardened runtime")
            }
            Ok(output) => CheckResult::fail(
                check,
                format!("marker missing from workload output: {:?}", output.stdout.trim()),
                RecommendedAction::InvestigateIsolation,
                "run the workload by hand and compare its output",
            ),
            Err((detail, action)) => CheckResult::fail(check, detail, action, action.to_string()),
        }
    }

    /// Run a workload under the hardened runtime. An image-not-found failure is
    /// retried once after a pull; this is a heuristic on the engine's wording.
    fn run_workload(
        &self,
        name: &str,
        command: &[&str],
    ) -> Result<CommandOutput, (String, RecommendedAction)> {
        let image = &self.config.probe.image;
        let spec = self
            .engine
            .run_workload_spec(name, &self.config.runtime.name, image, command);
        let execute = || {
            self.engine
                .execute(&spec)
                .map_err(|err| (format!("{:#}", err), RecommendedAction::RunSetup))
        };

        let mut output = execute()?;
        if !output.success() && image_missing(&output.diagnostic()) {
            debug!(image = %image, "probe image missing, pulling and retrying once");
            if let Err(err) = self.engine.apply(&self.engine.pull_spec(name, image)) {
                warn!(error = %format!("{:#}", err), "probe image pull failed");
            }
            output = execute()?;
        }

        if output.timed_out() {
            return Err((
                format!("`{}` timed out", spec.display()),
                RecommendedAction::StartService,
            ));
        }
        if !output.success() {
            let diagnostic = output.diagnostic();
            // "pull access denied" would otherwise read as a socket permission problem.
            let action = if image_missing(&diagnostic) {
                RecommendedAction::RunSetup
            } else {
                match classify(&diagnostic) {
                    ErrorKind::Unknown => RecommendedAction::InvestigateIsolation,
                    kind => RecommendedAction::for_error(Some(kind)),
                }
            };
            return Err((diagnostic, action));
        }
        Ok(output)
    }
}

fn image_missing(diagnostic: &str) -> bool {
    let text = diagnostic.to_lowercase();
    IMAGE_MISSING_PHRASES.iter().any(|p| text.contains(p))
}
