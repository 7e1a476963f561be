use anyhow::Result;

use crate::step::{ProvisioningStep, StepContext};
use crate::verify::{Fatality, VerificationRunner};

/// Final step: runs every verification check against the primary endpoint.
///
/// Never reported as already satisfied, so a re-run always re-verifies.
pub struct Verify;

impl ProvisioningStep for Verify {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn description(&self) -> String {
        "workloads on the primary endpoint are isolated".to_string()
    }

    fn is_satisfied(&self, _ctx: &StepContext<'_>) -> Result<bool> {
        Ok(false)
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let name = &ctx.config.endpoint.primary;
        let runtime = &ctx.config.runtime.name;
        let image = &ctx.config.probe.image;
        vec![
            ctx.engine.info_spec(name).display(),
            ctx.engine
                .run_workload_spec(name, runtime, image, &["cat", "/proc/self/uid_map"])
                .display(),
            ctx.engine
                .run_workload_spec(name, runtime, image, &["echo", crate::verify::SMOKE_MARKER])
                .display(),
        ]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let report =
            VerificationRunner::with_engine(ctx.host, ctx.engine, ctx.config, ctx.facts.variant).run();

        let fatal: Vec<String> = report
            .failures(Fatality::Fatal)
            .map(|c| format!("{}: {}", c.name(), c.detail))
            .collect();
        let warnings: Vec<String> = report
            .failures(Fatality::Warning)
            .map(|c| format!("{}: {}", c.name(), c.detail))
            .chain(report.warnings.iter().cloned())
            .collect();
        let action = report.recommended_action;
        ctx.record_verification(report);

        if !fatal.is_empty() {
            anyhow::bail!("verification failed ({}); {}", fatal.join("; "), action);
        }
        Ok(warnings)
    }

    fn postcondition(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(ctx
            .peek_verification(|report| report.map(|r| r.isolation_available))
            .unwrap_or(false))
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        ctx.peek_verification(|report| report.map(|r| r.recommended_action.to_string()))
            .unwrap_or_else(|| "run `bastionctl health` for details".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BastionConfig;
    use crate::fakes::{FakeEngine, FakeHost};
    use crate::platform::{ExecutionContext, HostFacts, PlatformVariant};
    use crate::step::{StepExecutor, StepOutcome};

    const SOCKET: &str = "/var/run/bastion-docker.sock";
    const ADDRESS: &str = "unix:///var/run/bastion-docker.sock";

    fn linux() -> HostFacts {
        HostFacts::new(PlatformVariant::Linux, ExecutionContext::Host)
    }

    #[test]
    fn given_isolated_engine_when_verified_then_applied_and_report_recorded() {
        let host = FakeHost::new();
        host.add_context("bastion", ADDRESS);
        host.add_socket(SOCKET);
        host.add_engine(ADDRESS, FakeEngine::isolated().with_image("alpine:3.20"));
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, false).run(&Verify);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        let report = ctx.take_verification().unwrap();
        assert!(report.isolation_available);
    }

    #[test]
    fn given_unremapped_engine_when_verified_then_fatal_with_isolation_remediation() {
        let host = FakeHost::new();
        host.add_context("bastion", ADDRESS);
        host.add_socket(SOCKET);
        host.add_engine(
            ADDRESS,
            FakeEngine::isolated()
                .with_image("alpine:3.20")
                .with_uid_map("0 0 4294967295\n"),
        );
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, false).run(&Verify);

        assert!(record.is_fatal());
        assert!(record.remediation.unwrap().contains("not isolated"));
    }

    #[test]
    fn given_dry_run_when_verify_previewed_then_nothing_runs() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, true).run(&Verify);

        match record.outcome {
            StepOutcome::Previewed(commands) => assert_eq!(commands.len(), 3),
            other => panic!("expected preview, got {:?}", other),
        }
        assert_eq!(host.count_commands("docker --context bastion run"), 0);
    }
}
