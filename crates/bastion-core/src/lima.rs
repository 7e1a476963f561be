//! Thin wrapper over `limactl` for the VM-hosted platform.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::host::{CommandSpec, Host};

pub const VM_CLI: &str = "limactl";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
}

impl VmInstance {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

/// `limactl list --json` prints one JSON object per line.
pub fn parse_list(output: &str) -> Result<Vec<VmInstance>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<VmInstance>(line)
                .with_context(|| format!("Failed to parse limactl list entry: {}", line))
        })
        .collect()
}

pub fn list_spec(timeout: Duration) -> CommandSpec {
    CommandSpec::new(VM_CLI, ["list", "--json"]).with_timeout(timeout)
}

pub fn create_spec(name: &str, template: &Path, timeout: Duration) -> CommandSpec {
    let template = template.to_string_lossy();
    CommandSpec::new(
        VM_CLI,
        ["create", "--name", name, "--tty=false", template.as_ref()],
    )
    .with_timeout(timeout)
}

pub fn start_spec(name: &str, timeout: Duration) -> CommandSpec {
    CommandSpec::new(VM_CLI, ["start", name]).with_timeout(timeout)
}

pub fn delete_spec(name: &str, timeout: Duration) -> CommandSpec {
    CommandSpec::new(VM_CLI, ["delete", "--force", name]).with_timeout(timeout)
}

pub fn list(host: &dyn Host, timeout: Duration) -> Result<Vec<VmInstance>> {
    let spec = list_spec(timeout);
    let output = host.execute(&spec)?;
    if !output.success() {
        anyhow::bail!("`{}` failed: {}", spec.display(), output.diagnostic());
    }
    parse_list(&output.stdout)
}

pub fn find(host: &dyn Host, timeout: Duration, name: &str) -> Result<Option<VmInstance>> {
    Ok(list(host, timeout)?.into_iter().find(|vm| vm.name == name))
}
