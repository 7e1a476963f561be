use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::BastionError;
use crate::host::Host;
use crate::idmap::parse_id_map;

pub const PLATFORM_ENV: &str = "BASTION_PLATFORM";

const CONTAINER_MARKERS: [&str; 2] = ["/.dockerenv", "/run/.containerenv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformVariant {
    Linux,
    Wsl2,
    /// The engine runs inside a local VM (macOS).
    VmHosted,
    Containerized,
}

impl fmt::Display for PlatformVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlatformVariant::Linux => "linux",
            PlatformVariant::Wsl2 => "wsl2",
            PlatformVariant::VmHosted => "vm-hosted",
            PlatformVariant::Containerized => "containerized",
        };
        f.write_str(name)
    }
}

impl FromStr for PlatformVariant {
    type Err = BastionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(PlatformVariant::Linux),
            "wsl2" | "wsl" => Ok(PlatformVariant::Wsl2),
            "vm-hosted" | "vm" | "macos" => Ok(PlatformVariant::VmHosted),
            "containerized" | "container" => Ok(PlatformVariant::Containerized),
            other => Err(BastionError::UnknownPlatform {
                value: other.to_string(),
            }),
        }
    }
}

/// Where the current process itself is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionContext {
    Host,
    GenericContainer,
    /// Inside a workload of the isolated engine; nesting the same isolation is unsupported.
    IsolatedWorkload,
}

impl ExecutionContext {
    pub fn is_containerized(&self) -> bool {
        !matches!(self, ExecutionContext::Host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFacts {
    pub variant: PlatformVariant,
    pub context: ExecutionContext,
}

impl HostFacts {
    pub fn new(variant: PlatformVariant, context: ExecutionContext) -> Self {
        Self { variant, context }
    }

    /// Detect once per invocation. `BASTION_PLATFORM` overrides the variant.
    pub fn detect(host: &dyn Host) -> Result<Self, BastionError> {
        let context = detect_execution_context(host);
        let variant = match std::env::var(PLATFORM_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => detect_variant(host, context),
        };
        debug!(%variant, ?context, "detected host facts");
        Ok(Self { variant, context })
    }
}

pub fn detect_execution_context(host: &dyn Host) -> ExecutionContext {
    let containerized = CONTAINER_MARKERS
        .iter()
        .any(|marker| host.path_exists(Path::new(marker)));
    if !containerized {
        return ExecutionContext::Host;
    }

    let remapped = host
        .read_file(Path::new("/proc/self/uid_map"))
        .ok()
        .flatten()
        .map(|map| parse_id_map(&map).is_remapped())
        .unwrap_or(false);

    if remapped {
        ExecutionContext::IsolatedWorkload
    } else {
        ExecutionContext::GenericContainer
    }
}

fn detect_variant(host: &dyn Host, context: ExecutionContext) -> PlatformVariant {
    if context.is_containerized() {
        return PlatformVariant::Containerized;
    }
    if cfg!(target_os = "macos") {
        return PlatformVariant::VmHosted;
    }
    let proc_version = host
        .read_file(Path::new("/proc/version"))
        .ok()
        .flatten()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if proc_version.contains("microsoft") || proc_version.contains("wsl") {
        PlatformVariant::Wsl2
    } else {
        PlatformVariant::Linux
    }
}
