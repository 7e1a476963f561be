//! Retirement of resources left over from the earlier single-daemon layout.
//!
//! Stateless leftovers (stale sockets, config fragments) are removed as soon
//! as they are found. Stateful ones may hold operator data: the legacy
//! endpoint with any socket it still serves, and the legacy VM. They are only
//! removed after the replacement has been verified and the operator agreed,
//! either with `--force` or at a prompt.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::BastionConfig;
use crate::engine::EngineCli;
use crate::host::Host;
use crate::lima;
use crate::platform::PlatformVariant;
use crate::probe::{AvailabilityProbe, ProbeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    Stateless,
    Stateful,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "kebab-case")]
pub enum LegacyResourceKind {
    SocketFile(PathBuf),
    ConfigFragment(PathBuf),
    Endpoint(String),
    VirtualMachine(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyResource {
    #[serde(flatten)]
    pub kind: LegacyResourceKind,
    pub class: ResourceClass,
}

/// What the inventory learned about the legacy endpoint.
enum LegacyEndpointState {
    Absent,
    Bound { address: String, live: bool },
    /// The context could not be inspected.
    Unknown,
}

impl LegacyEndpointState {
    fn may_serve(&self, socket: &Path) -> bool {
        match self {
            Self::Absent => false,
            Self::Bound { address, live } => {
                *live && *address == format!("unix://{}", socket.display())
            }
            Self::Unknown => true,
        }
    }
}

impl LegacyResource {
    fn with_class(kind: LegacyResourceKind, class: ResourceClass) -> Self {
        Self { kind, class }
    }

    fn new(kind: LegacyResourceKind) -> Self {
        let class = match kind {
            LegacyResourceKind::SocketFile(_) | LegacyResourceKind::ConfigFragment(_) => {
                ResourceClass::Stateless
            }
            LegacyResourceKind::Endpoint(_) | LegacyResourceKind::VirtualMachine(_) => {
                ResourceClass::Stateful
            }
        };
        Self::with_class(kind, class)
    }

    pub fn is_stateful(&self) -> bool {
        self.class == ResourceClass::Stateful
    }
}

impl fmt::Display for LegacyResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LegacyResourceKind::SocketFile(path) => write!(f, "legacy socket {}", path.display()),
            LegacyResourceKind::ConfigFragment(path) => {
                write!(f, "legacy config fragment {}", path.display())
            }
            LegacyResourceKind::Endpoint(name) => write!(f, "legacy endpoint {}", name),
            LegacyResourceKind::VirtualMachine(name) => write!(f, "legacy VM {}", name),
        }
    }
}

/// Asks the operator before a stateful resource is removed.
pub trait Confirmer {
    fn confirm(&self, resource: &LegacyResource) -> bool;
}

/// Declines every prompt. Used whenever stdin is not a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Confirmer for NonInteractive {
    fn confirm(&self, _resource: &LegacyResource) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// The replacement endpoint passed verification in this invocation.
    pub verified: bool,
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum MigrationAction {
    Removed,
    Retained { reason: String },
    Planned { commands: Vec<String> },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationEntry {
    pub resource: LegacyResource,
    #[serde(flatten)]
    pub action: MigrationAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub entries: Vec<MigrationEntry>,
    /// Manual steps for every retained stateful resource.
    pub instructions: Vec<String>,
    pub warnings: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn removed(&self) -> impl Iterator<Item = &LegacyResource> {
        self.entries
            .iter()
            .filter(|e| e.action == MigrationAction::Removed)
            .map(|e| &e.resource)
    }

    pub fn retained(&self) -> impl Iterator<Item = &LegacyResource> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, MigrationAction::Retained { .. }))
            .map(|e| &e.resource)
    }

    pub fn has_failures(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.action, MigrationAction::Failed { .. }))
    }
}

pub struct LegacyMigrator<'a> {
    host: &'a dyn Host,
    engine: EngineCli<'a>,
    config: &'a BastionConfig,
    variant: PlatformVariant,
    confirmer: &'a dyn Confirmer,
}

impl<'a> LegacyMigrator<'a> {
    pub fn new(
        host: &'a dyn Host,
        config: &'a BastionConfig,
        variant: PlatformVariant,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        Self {
            host,
            engine: EngineCli::new(host, config.probe.timeout(), config.probe.workload_timeout()),
            config,
            variant,
            confirmer,
        }
    }

    /// Legacy resources of this platform that currently exist. Stateless first.
    ///
    /// A legacy socket is stale unless the legacy endpoint is bound to it and
    /// answers. A live socket is stateful and follows the endpoint it serves.
    pub fn inventory(&self) -> (Vec<LegacyResource>, Vec<String>) {
        let mut found = Vec::new();
        let mut warnings = Vec::new();
        let legacy = &self.config.legacy;

        let socket_paths = match self.variant {
            PlatformVariant::Linux | PlatformVariant::Wsl2 => &legacy.socket_paths,
            PlatformVariant::VmHosted => &legacy.vm_socket_paths,
            PlatformVariant::Containerized => return (found, warnings),
        };

        let endpoint = &self.config.endpoint.legacy;
        let endpoint_state = match self.engine.context_address(endpoint) {
            Ok(Some(address)) => LegacyEndpointState::Bound {
                live: self.answers(endpoint),
                address,
            },
            Ok(None) => LegacyEndpointState::Absent,
            Err(err) => {
                warnings.push(format!("could not inspect {}: {:#}", endpoint, err));
                LegacyEndpointState::Unknown
            }
        };

        let mut live_sockets = Vec::new();
        for path in socket_paths.iter().filter(|p| self.host.path_exists(p)) {
            let kind = LegacyResourceKind::SocketFile(path.clone());
            if endpoint_state.may_serve(path) {
                debug!(socket = %path.display(), "legacy socket may be live, treating as stateful");
                live_sockets.push(LegacyResource::with_class(kind, ResourceClass::Stateful));
            } else {
                found.push(LegacyResource::new(kind));
            }
        }
        if self.variant != PlatformVariant::VmHosted {
            found.extend(
                legacy
                    .config_fragments
                    .iter()
                    .filter(|p| self.host.path_exists(p))
                    .map(|p| LegacyResource::new(LegacyResourceKind::ConfigFragment(p.clone()))),
            );
        }

        if matches!(endpoint_state, LegacyEndpointState::Bound { .. }) {
            found.push(LegacyResource::new(LegacyResourceKind::Endpoint(endpoint.clone())));
        }
        found.extend(live_sockets);

        if self.variant == PlatformVariant::VmHosted {
            let vm = &self.config.vm.legacy_name;
            match lima::find(self.host, self.config.probe.timeout(), vm) {
                Ok(Some(_)) => found.push(LegacyResource::new(LegacyResourceKind::VirtualMachine(vm.clone()))),
                Ok(None) => {}
                Err(err) => warnings.push(format!("could not list VMs: {:#}", err)),
            }
        }

        (found, warnings)
    }

    /// Whether the engine behind `context` responds, whatever its runtime.
    fn answers(&self, context: &str) -> bool {
        let options = ProbeOptions {
            runtime: self.config.runtime.name.clone(),
            require_runtime: false,
        };
        AvailabilityProbe::new(self.host, self.engine, options)
            .check(context)
            .is_available()
    }

    #[instrument(skip(self), fields(variant = %self.variant))]
    pub fn migrate(&self, options: MigrationOptions) -> MigrationReport {
        let (resources, warnings) = self.inventory();
        let mut report = MigrationReport {
            warnings,
            ..MigrationReport::default()
        };
        for warning in &report.warnings {
            warn!("{}", warning);
        }

        for resource in resources {
            let action = self.handle(&resource, options, &mut report);
            debug!(resource = %resource, ?action, "legacy resource handled");
            report.entries.push(MigrationEntry { resource, action });
        }

        info!(
            removed = report.removed().count(),
            retained = report.retained().count(),
            dry_run = options.dry_run,
            "legacy migration finished"
        );
        report
    }

    fn handle(
        &self,
        resource: &LegacyResource,
        options: MigrationOptions,
        report: &mut MigrationReport,
    ) -> MigrationAction {
        if options.dry_run {
            return MigrationAction::Planned {
                commands: self.removal_commands(resource),
            };
        }

        if resource.is_stateful() {
            let reason = if !options.verified {
                Some("replacement endpoint not verified".to_string())
            } else if !options.force && !self.confirmer.confirm(resource) {
                Some("removal not confirmed".to_string())
            } else {
                None
            };
            if let Some(reason) = reason {
                report.instructions.push(self.manual_instructions(resource));
                return MigrationAction::Retained { reason };
            }
        }

        match self.remove(resource) {
            Ok(()) => {
                info!(resource = %resource, "removed");
                MigrationAction::Removed
            }
            Err(err) => {
                let error = format!("{:#}", err);
                warn!(resource = %resource, %error, "removal failed");
                MigrationAction::Failed { error }
            }
        }
    }

    fn remove(&self, resource: &LegacyResource) -> anyhow::Result<()> {
        match &resource.kind {
            LegacyResourceKind::SocketFile(path) | LegacyResourceKind::ConfigFragment(path) => {
                self.host.remove_file(path)
            }
            LegacyResourceKind::Endpoint(name) => {
                if self.engine.current_context()?.as_deref() == Some(name.as_str()) {
                    self.engine
                        .apply(&self.engine.use_context_spec(&self.config.endpoint.primary))?;
                }
                self.engine.apply(&self.engine.remove_context_spec(name))
            }
            LegacyResourceKind::VirtualMachine(name) => {
                let spec = lima::delete_spec(name, self.config.vm.lifecycle_timeout());
                let output = self.host.execute(&spec)?;
                if !output.success() {
                    anyhow::bail!("`{}` failed: {}", spec.display(), output.diagnostic());
                }
                Ok(())
            }
        }
    }

    fn removal_commands(&self, resource: &LegacyResource) -> Vec<String> {
        match &resource.kind {
            LegacyResourceKind::SocketFile(path) | LegacyResourceKind::ConfigFragment(path) => {
                vec![format!("rm {}", path.display())]
            }
            LegacyResourceKind::Endpoint(name) => vec![
                self.engine
                    .use_context_spec(&self.config.endpoint.primary)
                    .display(),
                self.engine.remove_context_spec(name).display(),
            ],
            LegacyResourceKind::VirtualMachine(name) => {
                vec![lima::delete_spec(name, self.config.vm.lifecycle_timeout()).display()]
            }
        }
    }

    fn manual_instructions(&self, resource: &LegacyResource) -> String {
        match &resource.kind {
            LegacyResourceKind::Endpoint(name) => format!(
                "move any workloads off {} to {}, then run: {}",
                name,
                self.config.endpoint.primary,
                self.engine.remove_context_spec(name).display()
            ),
            LegacyResourceKind::VirtualMachine(name) => format!(
                "copy any data you need out of VM {} (limactl shell {}), then run: {}",
                name,
                name,
                lima::delete_spec(name, self.config.vm.lifecycle_timeout()).display()
            ),
            LegacyResourceKind::SocketFile(path) if resource.is_stateful() => format!(
                "stop the legacy engine listening on {}, then remove it",
                path.display()
            ),
            LegacyResourceKind::SocketFile(path) | LegacyResourceKind::ConfigFragment(path) => {
                format!("remove {}", path.display())
            }
        }
    }
}
