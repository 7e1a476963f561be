use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::BastionError;
use crate::platform::PlatformVariant;

pub const CONFIG_ENV: &str = "BASTION_CONFIG";
pub const CONTEXT_OVERRIDE_ENV: &str = "BASTION_CONTEXT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BastionConfig {
    pub endpoint: EndpointConfig,
    pub runtime: RuntimeConfig,
    pub engine: EngineConfig,
    pub vm: VmConfig,
    pub probe: ProbeConfig,
    pub legacy: LegacyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointConfig {
    pub primary: String,
    pub legacy: String,
    pub default_local: String,
    pub description: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            primary: "bastion".to_string(),
            legacy: "bastion-legacy".to_string(),
            default_local: "default".to_string(),
            description: "Bastion isolated engine".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Name the engine registers the hardened runtime under.
    pub name: String,
    pub binary: String,
    pub binary_path: String,
    pub service: String,
    pub version: String,
    /// `{version}` and `{arch}` are substituted.
    pub package_url: String,
    pub min_kernel: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "sysbox-runc".to_string(),
            binary: "sysbox-runc".to_string(),
            binary_path: "/usr/bin/sysbox-runc".to_string(),
            service: "sysbox".to_string(),
            version: "0.6.4".to_string(),
            package_url:
                "https://downloads.nestybox.com/sysbox/releases/v{version}/sysbox-ce_{version}-0.linux_{arch}.deb"
                    .to_string(),
            min_kernel: "5.12".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn package_url_for(&self, arch: &str) -> String {
        self.package_url
            .replace("{version}", &self.version)
            .replace("{arch}", arch)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub service: String,
    pub socket: PathBuf,
    pub data_root: PathBuf,
    pub exec_root: PathBuf,
    pub pidfile: PathBuf,
    pub config_path: PathBuf,
    pub unit_path: PathBuf,
    pub dockerd_path: String,
    pub bridge: String,
    /// Gateway address in CIDR form. Must not overlap the default engine's 172.17.0.0/16.
    pub bridge_cidr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service: "bastion-docker".to_string(),
            socket: PathBuf::from("/var/run/bastion-docker.sock"),
            data_root: PathBuf::from("/var/lib/bastion/docker"),
            exec_root: PathBuf::from("/var/run/bastion-docker"),
            pidfile: PathBuf::from("/var/run/bastion-docker.pid"),
            config_path: PathBuf::from("/etc/bastion/daemon.json"),
            unit_path: PathBuf::from("/etc/systemd/system/bastion-docker.service"),
            dockerd_path: "/usr/bin/dockerd".to_string(),
            bridge: "bastion0".to_string(),
            bridge_cidr: "172.29.0.1/16".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmConfig {
    pub name: String,
    pub legacy_name: String,
    pub cpus: u32,
    pub memory_gib: u32,
    pub disk_gib: u32,
    /// Lima home; the forwarded socket lives at `<limaHome>/<name>/sock/docker.sock`.
    pub lima_home: PathBuf,
    pub template_path: PathBuf,
    /// Bound on `limactl create`, `start` and `delete`, which download images and boot the guest.
    pub lifecycle_timeout_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "bastion".to_string(),
            legacy_name: "bastion-legacy".to_string(),
            cpus: 4,
            memory_gib: 4,
            disk_gib: 60,
            lima_home: PathBuf::from("~/.lima"),
            template_path: PathBuf::from("~/.bastion/lima-bastion.yaml"),
            lifecycle_timeout_secs: 900,
        }
    }
}

impl VmConfig {
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle_timeout_secs)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.lima_home
            .join(&self.name)
            .join("sock")
            .join("docker.sock")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    pub workload_timeout_secs: u64,
    pub image: String,
    pub socket_poll_interval_ms: u64,
    pub socket_poll_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            workload_timeout_secs: 120,
            image: "alpine:3.20".to_string(),
            socket_poll_interval_ms: 500,
            socket_poll_attempts: 60,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn workload_timeout(&self) -> Duration {
        Duration::from_secs(self.workload_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.socket_poll_interval_ms)
    }
}

/// Artifacts left behind by the earlier single-daemon layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyConfig {
    pub socket_paths: Vec<PathBuf>,
    pub config_fragments: Vec<PathBuf>,
    pub vm_socket_paths: Vec<PathBuf>,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            socket_paths: vec![PathBuf::from("/var/run/bastion.sock")],
            config_fragments: vec![PathBuf::from("/etc/bastion/engine.json")],
            vm_socket_paths: vec![PathBuf::from("~/.bastion/docker.sock")],
        }
    }
}

impl BastionConfig {
    /// Load from an explicit path, `BASTION_CONFIG`, or the per-user config file.
    ///
    /// Only the implicit per-user location may be absent; an explicitly named file must exist.
    #[instrument]
    pub fn load(explicit: Option<&Path>) -> Result<Self, BastionError> {
        let (path, required) = match explicit {
            Some(path) => (Some(path.to_path_buf()), true),
            None => match std::env::var(CONFIG_ENV) {
                Ok(value) if !value.is_empty() => (Some(PathBuf::from(value)), true),
                _ => (default_config_path(), false),
            },
        };

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if required => return Err(BastionError::ConfigFileNotFound { path }),
            _ => {
                debug!("No config file present, using built-in defaults");
                Self::default()
            }
        };

        config.expand_home()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, BastionError> {
        let contents = std::fs::read_to_string(path).map_err(|e| BastionError::ConfigRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&contents).map_err(|e| match e {
            BastionError::ConfigParse { message, .. } => BastionError::ConfigParse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, BastionError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| BastionError::ConfigParse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), BastionError> {
        let invalid = |message: String| -> Result<(), BastionError> {
            Err(BastionError::InvalidConfig { message })
        };

        for (field, value) in [
            ("endpoint.primary", &self.endpoint.primary),
            ("endpoint.legacy", &self.endpoint.legacy),
            ("endpoint.defaultLocal", &self.endpoint.default_local),
            ("runtime.name", &self.runtime.name),
            ("engine.service", &self.engine.service),
            ("engine.bridge", &self.engine.bridge),
            ("vm.name", &self.vm.name),
            ("probe.image", &self.probe.image),
        ] {
            if value.trim().is_empty() {
                return invalid(format!("{} cannot be empty", field));
            }
        }

        if self.endpoint.primary == self.endpoint.legacy {
            return invalid(format!(
                "endpoint.primary and endpoint.legacy must differ (both '{}')",
                self.endpoint.primary
            ));
        }

        if self.vm.name == self.vm.legacy_name {
            return invalid(format!(
                "vm.name and vm.legacyName must differ (both '{}')",
                self.vm.name
            ));
        }

        if !is_valid_cidr(&self.engine.bridge_cidr) {
            return invalid(format!(
                "engine.bridgeCidr '{}' is not an IPv4 CIDR",
                self.engine.bridge_cidr
            ));
        }

        if self.probe.timeout_secs == 0 || self.probe.workload_timeout_secs == 0 {
            return invalid("probe timeouts must be greater than zero".to_string());
        }

        if self.vm.lifecycle_timeout_secs == 0 {
            return invalid("vm.lifecycleTimeoutSecs must be greater than zero".to_string());
        }

        if self.probe.socket_poll_attempts == 0 {
            return invalid("probe.socketPollAttempts must be greater than zero".to_string());
        }

        if crate::steps::host_checks::parse_kernel_version(&self.runtime.min_kernel).is_none() {
            return invalid(format!(
                "runtime.minKernel '{}' is not a kernel version",
                self.runtime.min_kernel
            ));
        }

        Ok(())
    }

    /// Address the primary endpoint is expected to be bound to on this platform.
    pub fn expected_address(&self, variant: PlatformVariant) -> String {
        match variant {
            PlatformVariant::VmHosted => format!("unix://{}", self.vm.socket_path().display()),
            _ => format!("unix://{}", self.engine.socket.display()),
        }
    }

    /// Socket the provisioning pipeline waits for on this platform.
    pub fn expected_socket(&self, variant: PlatformVariant) -> PathBuf {
        match variant {
            PlatformVariant::VmHosted => self.vm.socket_path(),
            _ => self.engine.socket.clone(),
        }
    }

    fn expand_home(&mut self) -> Result<(), BastionError> {
        let needs_home = std::iter::once(&self.vm.lima_home)
            .chain(std::iter::once(&self.vm.template_path))
            .chain(self.legacy.vm_socket_paths.iter())
            .any(|p| p.starts_with("~"));
        if !needs_home {
            return Ok(());
        }
        let home = dirs::home_dir().ok_or(BastionError::HomeDirUnavailable)?;
        self.vm.lima_home = expand_tilde(&self.vm.lima_home, &home);
        self.vm.template_path = expand_tilde(&self.vm.template_path, &home);
        self.legacy.vm_socket_paths = self
            .legacy
            .vm_socket_paths
            .iter()
            .map(|p| expand_tilde(p, &home))
            .collect();
        Ok(())
    }

    pub fn context_override_from_env() -> Option<String> {
        std::env::var(CONTEXT_OVERRIDE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bastion").join("config.yaml"))
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn is_valid_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let prefix_ok = prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false);
    prefix_ok && addr.parse::<std::net::Ipv4Addr>().is_ok()
}
