//! Concrete provisioning steps and the per-platform step tables.

pub mod dataplane;
pub mod endpoint;
pub mod host_checks;
pub mod runtime;
pub mod verify;
pub mod vm;

use anyhow::Result;

use crate::host::CommandSpec;
use crate::platform::PlatformVariant;
use crate::step::{ProvisioningStep, StepContext};

/// The ordered steps that provision `variant`. Names are stable identifiers.
pub fn for_variant(variant: PlatformVariant) -> Vec<Box<dyn ProvisioningStep>> {
    match variant {
        PlatformVariant::Linux | PlatformVariant::Wsl2 => {
            let mut steps: Vec<Box<dyn ProvisioningStep>> = vec![
                Box::new(host_checks::CheckDependencies),
                Box::new(host_checks::CheckKernel),
            ];
            if variant == PlatformVariant::Wsl2 {
                steps.push(Box::new(host_checks::CheckSystemd));
            }
            let engine_steps: Vec<Box<dyn ProvisioningStep>> = vec![
                Box::new(runtime::InstallRuntime),
                Box::new(runtime::StartRuntimeService),
                Box::new(dataplane::CreateDataDir),
                Box::new(dataplane::CreateBridge),
                Box::new(dataplane::WriteEngineConfig),
                Box::new(dataplane::InstallServiceUnit),
                Box::new(dataplane::StartEngineService),
                Box::new(dataplane::WaitForSocket),
                Box::new(endpoint::CreateEndpoint),
                Box::new(endpoint::PullProbeImage),
                Box::new(verify::Verify),
            ];
            steps.extend(engine_steps);
            steps
        }
        PlatformVariant::VmHosted => vec![
            Box::new(host_checks::CheckDependencies),
            Box::new(vm::RenderVmTemplate),
            Box::new(vm::CreateVm),
            Box::new(vm::StartVm),
            Box::new(dataplane::WaitForSocket),
            Box::new(endpoint::CreateEndpoint),
            Box::new(endpoint::PullProbeImage),
            Box::new(verify::Verify),
        ],
        PlatformVariant::Containerized => vec![Box::new(host_checks::ContainerizedGate)],
    }
}

pub(crate) fn systemctl<'s>(ctx: &StepContext<'_>, args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
    CommandSpec::new("systemctl", args).with_timeout(ctx.config.probe.timeout())
}

/// A service counts as started only when it is both active and enabled.
pub(crate) fn service_running(ctx: &StepContext<'_>, service: &str) -> Result<bool> {
    Ok(ctx.succeeds(&systemctl(ctx, ["is-active", service]))?
        && ctx.succeeds(&systemctl(ctx, ["is-enabled", service]))?)
}

pub(crate) fn restart_service_spec(ctx: &StepContext<'_>, service: &str) -> CommandSpec {
    systemctl(ctx, ["restart", service]).privileged()
}

pub(crate) fn enable_service_spec(ctx: &StepContext<'_>, service: &str) -> CommandSpec {
    systemctl(ctx, ["enable", "--now", service]).privileged()
}
