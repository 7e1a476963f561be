//! VM lifecycle for the VM-hosted platform. The isolated engine runs inside a
//! Lima VM whose docker socket is forwarded to the host.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::BastionConfig;
use crate::host::CommandSpec;
use crate::lima;
use crate::step::{ProvisioningStep, StepContext};

const TEMPLATE_HEADER: &str = "# Managed by bastionctl. Local edits are overwritten on setup.\n";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaTemplate {
    vm_type: &'static str,
    cpus: u32,
    memory: String,
    disk: String,
    images: Vec<LimaImage>,
    containerd: LimaContainerd,
    provision: Vec<LimaProvision>,
    port_forwards: Vec<LimaPortForward>,
}

#[derive(Debug, Serialize)]
struct LimaImage {
    location: &'static str,
    arch: &'static str,
}

#[derive(Debug, Serialize)]
struct LimaContainerd {
    system: bool,
    user: bool,
}

#[derive(Debug, Serialize)]
struct LimaProvision {
    mode: &'static str,
    script: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimaPortForward {
    guest_socket: &'static str,
    host_socket: String,
}

fn provision_script(config: &BastionConfig) -> String {
    let runtime = &config.runtime;
    format!(
        "#!/bin/bash\n\
         set -eux -o pipefail\n\
         if ! command -v docker >/dev/null 2>&1; then\n\
         \x20 curl -fsSL https://get.docker.com | sh\n\
         fi\n\
         if ! command -v {binary} >/dev/null 2>&1; then\n\
         \x20 arch=$(dpkg --print-architecture)\n\
         \x20 url=$(echo '{url}' | sed \"s/{{arch}}/$arch/\")\n\
         \x20 curl -fsSL -o /tmp/runtime.deb \"$url\"\n\
         \x20 apt-get install -y /tmp/runtime.deb\n\
         fi\n\
         mkdir -p /etc/docker\n\
         cat >/etc/docker/daemon.json <<'EOF'\n\
         {{\"default-runtime\": \"{name}\", \"runtimes\": {{\"{name}\": {{\"path\": \"{path}\"}}}}}}\n\
         EOF\n\
         systemctl enable --now {service}\n\
         systemctl restart docker\n\
         chmod 0666 /var/run/docker.sock\n",
        binary = runtime.binary,
        url = runtime.package_url.replace("{version}", &runtime.version),
        name = runtime.name,
        path = runtime.binary_path,
        service = runtime.service,
    )
}

/// Lima template for the engine VM.
pub fn render_vm_template(config: &BastionConfig) -> Result<String> {
    let vm = &config.vm;
    let template = LimaTemplate {
        vm_type: "vz",
        cpus: vm.cpus,
        memory: format!("{}GiB", vm.memory_gib),
        disk: format!("{}GiB", vm.disk_gib),
        images: vec![
            LimaImage {
                location: "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-arm64.img",
                arch: "aarch64",
            },
            LimaImage {
                location: "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-amd64.img",
                arch: "x86_64",
            },
        ],
        containerd: LimaContainerd {
            system: false,
            user: false,
        },
        provision: vec![LimaProvision {
            mode: "system",
            script: provision_script(config),
        }],
        port_forwards: vec![LimaPortForward {
            guest_socket: "/var/run/docker.sock",
            host_socket: config.vm.socket_path().display().to_string(),
        }],
    };
    let body = serde_yaml::to_string(&template).context("Failed to render VM template")?;
    Ok(format!("{}{}", TEMPLATE_HEADER, body))
}

pub struct RenderVmTemplate;

impl ProvisioningStep for RenderVmTemplate {
    fn name(&self) -> &'static str {
        "render-vm-template"
    }

    fn description(&self) -> String {
        "VM template is current".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let rendered = render_vm_template(ctx.config)?;
        Ok(ctx.host.read_file(&ctx.config.vm.template_path)?.as_deref() == Some(rendered.as_str()))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![format!("# write {}", ctx.config.vm.template_path.display())]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let rendered = render_vm_template(ctx.config)?;
        let path = &ctx.config.vm.template_path;
        if let Some(parent) = path.parent() {
            ctx.host.create_dir_all(parent)?;
        }
        ctx.host.write_file(path, &rendered)?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "check that {} is writable",
            ctx.config.vm.template_path.display()
        )
    }
}

pub struct CreateVm;

impl CreateVm {
    fn spec(ctx: &StepContext<'_>) -> CommandSpec {
        let vm = &ctx.config.vm;
        lima::create_spec(&vm.name, &vm.template_path, vm.lifecycle_timeout())
    }
}

impl ProvisioningStep for CreateVm {
    fn name(&self) -> &'static str {
        "create-vm"
    }

    fn description(&self) -> String {
        "engine VM exists".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(lima::find(ctx.host, ctx.config.probe.timeout(), &ctx.config.vm.name)?.is_some())
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![Self::spec(ctx).display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.run(&Self::spec(ctx))?;
        Ok(Vec::new())
    }

    fn remediation(&self, _ctx: &StepContext<'_>) -> String {
        "check VM status: limactl list".to_string()
    }
}

pub struct StartVm;

impl ProvisioningStep for StartVm {
    fn name(&self) -> &'static str {
        "start-vm"
    }

    fn description(&self) -> String {
        "engine VM is running".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(lima::find(ctx.host, ctx.config.probe.timeout(), &ctx.config.vm.name)?
            .map(|vm| vm.is_running())
            .unwrap_or(false))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![lima::start_spec(&ctx.config.vm.name, ctx.config.vm.lifecycle_timeout()).display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.run(&lima::start_spec(&ctx.config.vm.name, ctx.config.vm.lifecycle_timeout()))?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "check VM status: limactl list; logs are under {}",
            ctx.config.vm.lima_home.join(&ctx.config.vm.name).display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;
    use crate::platform::{ExecutionContext, HostFacts, PlatformVariant};
    use crate::step::{StepExecutor, StepOutcome};
    use std::path::PathBuf;

    fn config() -> BastionConfig {
        let mut config = BastionConfig::default();
        config.vm.lima_home = PathBuf::from("/Users/op/.lima");
        config.vm.template_path = PathBuf::from("/Users/op/.bastion/lima-bastion.yaml");
        config
    }

    fn vm_hosted() -> HostFacts {
        HostFacts::new(PlatformVariant::VmHosted, ExecutionContext::Host)
    }

    #[test]
    fn template_forwards_the_engine_socket() {
        let rendered = render_vm_template(&config()).unwrap();
        assert!(rendered.starts_with(TEMPLATE_HEADER));
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["cpus"].as_u64(), Some(4));
        assert_eq!(
            value["portForwards"][0]["hostSocket"].as_str(),
            Some("/Users/op/.lima/bastion/sock/docker.sock")
        );
        assert!(value["provision"][0]["script"]
            .as_str()
            .unwrap()
            .contains("systemctl enable --now sysbox"));
    }

    #[test]
    fn given_fresh_host_when_vm_steps_applied_then_vm_running() {
        let host = FakeHost::new();
        let config = config();
        let ctx = StepContext::new(&host, &config, vm_hosted());
        let executor = StepExecutor::new(&ctx, false);

        let steps: [&dyn ProvisioningStep; 3] = [&RenderVmTemplate, &CreateVm, &StartVm];
        for step in steps {
            let record = executor.run(step);
            assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()), "{}", record.name);
        }

        assert_eq!(host.vm_status("bastion").as_deref(), Some("Running"));
        assert!(host.file("/Users/op/.bastion/lima-bastion.yaml").is_some());
    }

    #[test]
    fn given_stopped_vm_when_start_run_then_only_start_issued() {
        let host = FakeHost::new();
        host.add_vm("bastion", "Stopped");
        let config = config();
        let ctx = StepContext::new(&host, &config, vm_hosted());
        let executor = StepExecutor::new(&ctx, false);

        assert_eq!(executor.run(&CreateVm).outcome, StepOutcome::Skipped);
        assert_eq!(executor.run(&StartVm).outcome, StepOutcome::Applied(Vec::new()));
        assert_eq!(host.count_commands("limactl create"), 0);
    }
}
