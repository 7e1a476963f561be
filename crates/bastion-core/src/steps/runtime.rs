use anyhow::{Context, Result};
use std::time::Duration;

use crate::host::CommandSpec;
use crate::step::{ProvisioningStep, StepContext};
use crate::steps::{enable_service_spec, service_running, systemctl};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Package architecture for a `uname -m` machine name.
pub fn package_arch(machine: &str) -> Option<&'static str> {
    match machine.trim() {
        "x86_64" | "amd64" => Some("amd64"),
        "aarch64" | "arm64" => Some("arm64"),
        _ => None,
    }
}

pub struct InstallRuntime;

impl InstallRuntime {
    fn download_path(ctx: &StepContext<'_>) -> String {
        format!(
            "/tmp/{}-{}.deb",
            ctx.config.runtime.service, ctx.config.runtime.version
        )
    }

    fn machine(ctx: &StepContext<'_>) -> Result<String> {
        let spec = CommandSpec::new("uname", ["-m"]).with_timeout(ctx.config.probe.timeout());
        Ok(ctx.run(&spec)?.stdout.trim().to_string())
    }

    fn commands(ctx: &StepContext<'_>, arch: &str) -> [CommandSpec; 2] {
        let url = ctx.config.runtime.package_url_for(arch);
        let target = Self::download_path(ctx);
        [
            CommandSpec::new("curl", ["-fsSL", "-o", target.as_str(), url.as_str()])
                .with_timeout(INSTALL_TIMEOUT),
            CommandSpec::new("apt-get", ["install", "-y", target.as_str()])
                .privileged()
                .with_timeout(INSTALL_TIMEOUT),
        ]
    }
}

impl ProvisioningStep for InstallRuntime {
    fn name(&self) -> &'static str {
        "install-runtime"
    }

    fn description(&self) -> String {
        "hardened runtime package is installed".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(ctx.host.binary_in_path(&ctx.config.runtime.binary))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let arch = Self::machine(ctx)
            .ok()
            .and_then(|m| package_arch(&m))
            .unwrap_or("<arch>");
        Self::commands(ctx, arch)
            .iter()
            .map(CommandSpec::display)
            .collect()
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let machine = Self::machine(ctx)?;
        let arch = package_arch(&machine)
            .with_context(|| format!("no runtime package for architecture '{}'", machine))?;
        for spec in Self::commands(ctx, arch) {
            ctx.run(&spec)?;
        }
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "install {} {} manually from {}",
            ctx.config.runtime.binary,
            ctx.config.runtime.version,
            ctx.config.runtime.package_url_for("<arch>")
        )
    }
}

pub struct StartRuntimeService;

impl ProvisioningStep for StartRuntimeService {
    fn name(&self) -> &'static str {
        "start-runtime-service"
    }

    fn description(&self) -> String {
        "hardened runtime service is running".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        service_running(ctx, &ctx.config.runtime.service)
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![enable_service_spec(ctx, &ctx.config.runtime.service).display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.run(&enable_service_spec(ctx, &ctx.config.runtime.service))?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "check service status: {}",
            systemctl(ctx, ["status", ctx.config.runtime.service.as_str()]).display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BastionConfig;
    use crate::fakes::FakeHost;
    use crate::host::Host;
    use crate::platform::{ExecutionContext, HostFacts, PlatformVariant};
    use crate::step::{StepExecutor, StepOutcome};

    fn linux() -> HostFacts {
        HostFacts::new(PlatformVariant::Linux, ExecutionContext::Host)
    }

    #[test]
    fn package_arch_maps_machine_names() {
        assert_eq!(package_arch("x86_64"), Some("amd64"));
        assert_eq!(package_arch("aarch64\n"), Some("arm64"));
        assert_eq!(package_arch("riscv64"), None);
    }

    #[test]
    fn given_arm_host_when_previewed_then_arm_package_url() {
        let host = FakeHost::new();
        host.set_arch("aarch64");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, true).run(&InstallRuntime);

        match record.outcome {
            StepOutcome::Previewed(commands) => {
                assert_eq!(commands.len(), 2);
                assert!(commands[0].contains("linux_arm64.deb"));
                assert_eq!(commands[1], "sudo apt-get install -y /tmp/sysbox-0.6.4.deb");
            }
            other => panic!("expected preview, got {:?}", other),
        }
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn given_runtime_missing_when_applied_then_installed() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, false).run(&InstallRuntime);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert!(host.binary_in_path("sysbox-runc"));
    }

    #[test]
    fn given_unsupported_arch_when_applied_then_fatal() {
        let host = FakeHost::new();
        host.set_arch("s390x");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, false).run(&InstallRuntime);

        assert!(record.is_fatal());
        assert_eq!(host.count_commands("curl"), 0);
    }

    #[test]
    fn given_stopped_service_when_applied_then_enabled_now() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, linux());

        let record = StepExecutor::new(&ctx, false).run(&StartRuntimeService);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert!(host.service_running("sysbox"));
        assert_eq!(host.count_commands("sudo systemctl enable --now sysbox"), 1);
    }
}
