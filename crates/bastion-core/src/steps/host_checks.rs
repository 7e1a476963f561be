//! Read-only gates that stop the pipeline before anything is installed.

use anyhow::{Context, Result};
use std::path::Path;

use crate::host::CommandSpec;
use crate::platform::PlatformVariant;
use crate::step::{ProvisioningStep, StepContext};

const INIT_COMM: &str = "/proc/1/comm";
const WSL_CONF: &str = "/etc/wsl.conf";

/// Parse the `major.minor` prefix of a kernel release such as `5.15.0-105-generic`.
pub fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some((major, minor.parse().ok()?))
}

fn required_tools(variant: PlatformVariant) -> &'static [&'static str] {
    match variant {
        PlatformVariant::Linux | PlatformVariant::Wsl2 => {
            &["docker", "dockerd", "systemctl", "ip", "curl", "apt-get"]
        }
        PlatformVariant::VmHosted => &["docker", "limactl"],
        PlatformVariant::Containerized => &[],
    }
}

pub struct CheckDependencies;

impl CheckDependencies {
    fn missing(&self, ctx: &StepContext<'_>) -> Vec<&'static str> {
        required_tools(ctx.facts.variant)
            .iter()
            .copied()
            .filter(|tool| !ctx.host.binary_in_path(tool))
            .collect()
    }
}

impl ProvisioningStep for CheckDependencies {
    fn name(&self) -> &'static str {
        "check-dependencies"
    }

    fn description(&self) -> String {
        "required tools are installed".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(self.missing(ctx).is_empty())
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![format!("# missing tools: {}", self.missing(ctx).join(", "))]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        anyhow::bail!("missing required tools: {}", self.missing(ctx).join(", "))
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "install {} and re-run setup",
            required_tools(ctx.facts.variant).join(", ")
        )
    }
}

pub struct CheckKernel;

impl CheckKernel {
    fn release(&self, ctx: &StepContext<'_>) -> Result<String> {
        let spec = CommandSpec::new("uname", ["-r"]).with_timeout(ctx.config.probe.timeout());
        Ok(ctx.run(&spec)?.stdout.trim().to_string())
    }

    fn minimum(&self, ctx: &StepContext<'_>) -> Result<(u32, u32)> {
        parse_kernel_version(&ctx.config.runtime.min_kernel).with_context(|| {
            format!(
                "minimum kernel '{}' is not a version",
                ctx.config.runtime.min_kernel
            )
        })
    }
}

impl ProvisioningStep for CheckKernel {
    fn name(&self) -> &'static str {
        "check-kernel"
    }

    fn description(&self) -> String {
        "kernel supports the hardened runtime".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let release = self.release(ctx)?;
        let version = parse_kernel_version(&release)
            .with_context(|| format!("unrecognized kernel release '{}'", release))?;
        Ok(version >= self.minimum(ctx)?)
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let release = self
            .release(ctx)
            .unwrap_or_else(|_| "unknown".to_string());
        vec![format!(
            "# kernel {} is older than {}",
            release, ctx.config.runtime.min_kernel
        )]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        anyhow::bail!(
            "kernel {} is older than the required {}",
            self.release(ctx)?,
            ctx.config.runtime.min_kernel
        )
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "upgrade the kernel to {} or newer",
            ctx.config.runtime.min_kernel
        )
    }
}

/// WSL2 distributions only run services when systemd is PID 1.
pub struct CheckSystemd;

impl ProvisioningStep for CheckSystemd {
    fn name(&self) -> &'static str {
        "check-systemd"
    }

    fn description(&self) -> String {
        "systemd is the init process".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let comm = ctx.host.read_file(Path::new(INIT_COMM))?;
        Ok(comm.map(|c| c.trim() == "systemd").unwrap_or(false))
    }

    fn preview(&self, _ctx: &StepContext<'_>) -> Vec<String> {
        vec!["# systemd is not PID 1".to_string()]
    }

    fn apply(&self, _ctx: &StepContext<'_>) -> Result<Vec<String>> {
        anyhow::bail!("systemd is not running as PID 1")
    }

    fn remediation(&self, _ctx: &StepContext<'_>) -> String {
        format!(
            "add \"[boot]\\nsystemd=true\" to {}, then run `wsl --shutdown` from Windows and reopen the distribution",
            WSL_CONF
        )
    }
}

pub struct ContainerizedGate;

impl ProvisioningStep for ContainerizedGate {
    fn name(&self) -> &'static str {
        "containerized-gate"
    }

    fn description(&self) -> String {
        "provisioning is possible from this environment".to_string()
    }

    fn refusal(&self, _ctx: &StepContext<'_>) -> Option<String> {
        Some(
            "running inside a container; the outer engine already provides isolation and a nested engine cannot be provisioned here"
                .to_string(),
        )
    }

    fn is_satisfied(&self, _ctx: &StepContext<'_>) -> Result<bool> {
        Ok(false)
    }

    fn preview(&self, _ctx: &StepContext<'_>) -> Vec<String> {
        Vec::new()
    }

    fn apply(&self, _ctx: &StepContext<'_>) -> Result<Vec<String>> {
        anyhow::bail!("cannot provision from inside a container")
    }

    fn remediation(&self, _ctx: &StepContext<'_>) -> String {
        "run setup on the host, outside any container".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BastionConfig;
    use crate::fakes::FakeHost;
    use crate::platform::{ExecutionContext, HostFacts};
    use crate::step::{StepExecutor, StepOutcome};

    fn ctx<'a>(host: &'a FakeHost, config: &'a BastionConfig, variant: PlatformVariant) -> StepContext<'a> {
        StepContext::new(host, config, HostFacts::new(variant, ExecutionContext::Host))
    }

    #[test]
    fn parse_kernel_version_handles_distribution_suffixes() {
        assert_eq!(parse_kernel_version("5.15.0-105-generic"), Some((5, 15)));
        assert_eq!(
            parse_kernel_version("5.15.153.1-microsoft-standard-WSL2"),
            Some((5, 15))
        );
        assert_eq!(parse_kernel_version("6.8"), Some((6, 8)));
        assert_eq!(parse_kernel_version("6.10-rc1"), Some((6, 10)));
        assert_eq!(parse_kernel_version("linux"), None);
        assert_eq!(parse_kernel_version("6"), None);
    }

    #[test]
    fn given_old_kernel_when_checked_then_fatal_with_upgrade_remediation() {
        let host = FakeHost::new();
        host.set_kernel_release("5.4.0-150-generic");
        let config = BastionConfig::default();
        let ctx = ctx(&host, &config, PlatformVariant::Linux);

        let record = StepExecutor::new(&ctx, false).run(&CheckKernel);

        assert!(record.is_fatal());
        assert!(record.remediation.unwrap().contains("5.12"));
    }

    #[test]
    fn given_kernel_5_12_when_checked_then_skipped() {
        let host = FakeHost::new();
        host.set_kernel_release("5.12.0");
        let config = BastionConfig::default();
        let ctx = ctx(&host, &config, PlatformVariant::Linux);

        assert_eq!(StepExecutor::new(&ctx, false).run(&CheckKernel).outcome, StepOutcome::Skipped);
    }

    #[test]
    fn given_missing_limactl_when_vm_hosted_then_names_it() {
        let host = FakeHost::new();
        host.add_binary("docker");
        let config = BastionConfig::default();
        let ctx = ctx(&host, &config, PlatformVariant::VmHosted);

        match StepExecutor::new(&ctx, false).run(&CheckDependencies).outcome {
            StepOutcome::Fatal(cause) => assert_eq!(cause, "missing required tools: limactl"),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn given_init_is_not_systemd_when_wsl2_then_points_at_wsl_conf() {
        let host = FakeHost::new();
        host.add_file(INIT_COMM, "init\n");
        let config = BastionConfig::default();
        let ctx = ctx(&host, &config, PlatformVariant::Wsl2);

        let record = StepExecutor::new(&ctx, false).run(&CheckSystemd);

        assert!(record.is_fatal());
        assert!(record.remediation.unwrap().contains("/etc/wsl.conf"));
    }

    #[test]
    fn given_containerized_gate_when_dry_run_then_still_fatal() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = ctx(&host, &config, PlatformVariant::Containerized);

        let record = StepExecutor::new(&ctx, true).run(&ContainerizedGate);

        assert!(record.is_fatal());
        assert!(host.commands().is_empty());
    }
}
