//! The dedicated engine daemon on Linux and WSL2: its directories, bridge,
//! configuration, systemd unit and socket.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use tracing::info;

use crate::config::BastionConfig;
use crate::host::CommandSpec;
use crate::platform::PlatformVariant;
use crate::poll::{poll_until, PollOutcome};
use crate::step::{ProvisioningStep, StepContext};
use crate::steps::{enable_service_spec, restart_service_spec, service_running, systemctl};

/// Daemon configuration pinning every path and the bridge away from the stock engine.
pub fn render_engine_config(config: &BastionConfig) -> Result<String> {
    let engine = &config.engine;
    let runtime = &config.runtime;
    let document = json!({
        "data-root": engine.data_root,
        "exec-root": engine.exec_root,
        "pidfile": engine.pidfile,
        "hosts": [format!("unix://{}", engine.socket.display())],
        "bridge": engine.bridge,
        "default-runtime": runtime.name,
        "runtimes": {
            runtime.name.as_str(): { "path": runtime.binary_path }
        }
    });
    let mut rendered =
        serde_json::to_string_pretty(&document).context("Failed to render engine config")?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn render_service_unit(config: &BastionConfig) -> String {
    let engine = &config.engine;
    let runtime_service = format!("{}.service", config.runtime.service);
    format!(
        "[Unit]\n\
         Description=Bastion isolated container engine\n\
         After=network-online.target {runtime_service}\n\
         Wants=network-online.target\n\
         Requires={runtime_service}\n\
         \n\
         [Service]\n\
         Type=notify\n\
         ExecStart={dockerd} --config-file {config_path}\n\
         ExecReload=/bin/kill -s HUP $MAINPID\n\
         Restart=on-failure\n\
         RestartSec=2\n\
         LimitNOFILE=infinity\n\
         Delegate=yes\n\
         KillMode=process\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        runtime_service = runtime_service,
        dockerd = engine.dockerd_path,
        config_path = engine.config_path.display(),
    )
}

fn tee_preview(path: &Path) -> String {
    CommandSpec::new("tee", [path.display().to_string()])
        .privileged()
        .display()
}

fn file_matches(ctx: &StepContext<'_>, path: &Path, contents: &str) -> Result<bool> {
    Ok(ctx.host.read_file(path)?.as_deref() == Some(contents))
}

fn write_with_parent(ctx: &StepContext<'_>, path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !ctx.host.path_exists(parent) {
            ctx.host.create_dir_all(parent)?;
        }
    }
    ctx.host.write_file(path, contents)
}

pub struct CreateDataDir;

impl ProvisioningStep for CreateDataDir {
    fn name(&self) -> &'static str {
        "create-data-dir"
    }

    fn description(&self) -> String {
        "engine data root exists".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(ctx.host.path_exists(&ctx.config.engine.data_root))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let target = ctx.config.engine.data_root.to_string_lossy();
        vec![CommandSpec::new("mkdir", ["-p", target.as_ref()])
            .privileged()
            .display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.host.create_dir_all(&ctx.config.engine.data_root)?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "create {} as root",
            ctx.config.engine.data_root.display()
        )
    }
}

pub struct CreateBridge;

/// What `ip` reports about the bridge; a failed query reads as absent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BridgeState {
    exists: bool,
    has_addr: bool,
    up: bool,
}

impl BridgeState {
    fn complete(&self) -> bool {
        self.exists && self.has_addr && self.up
    }
}

/// Whether the flags in `<...>` of an `ip link show` line include UP.
fn link_is_up(line: &str) -> bool {
    line.split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map_or(false, |(flags, _)| flags.split(',').any(|flag| flag == "UP"))
}

/// Whether `ip -o addr show` output carries `cidr` as an inet address.
fn carries_addr(listing: &str, cidr: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "inet" {
                return fields.next() == Some(cidr);
            }
        }
        false
    })
}

impl CreateBridge {
    fn observe(ctx: &StepContext<'_>) -> Result<BridgeState> {
        let bridge = ctx.config.engine.bridge.as_str();
        let timeout = ctx.config.probe.timeout();
        let link = ctx
            .host
            .execute(&CommandSpec::new("ip", ["link", "show", bridge]).with_timeout(timeout))?;
        if !link.success() {
            return Ok(BridgeState::default());
        }
        let addrs = ctx
            .host
            .execute(&CommandSpec::new("ip", ["-o", "addr", "show", "dev", bridge]).with_timeout(timeout))?;
        Ok(BridgeState {
            exists: true,
            has_addr: addrs.success() && carries_addr(&addrs.stdout, &ctx.config.engine.bridge_cidr),
            up: link.stdout.lines().any(link_is_up),
        })
    }

    /// The `ip` calls still needed to get from `state` to a configured bridge.
    fn commands(ctx: &StepContext<'_>, state: BridgeState) -> Vec<CommandSpec> {
        let bridge = ctx.config.engine.bridge.as_str();
        let cidr = ctx.config.engine.bridge_cidr.as_str();
        let timeout = ctx.config.probe.timeout();
        let mut wanted = Vec::new();
        if !state.exists {
            wanted.push(vec!["link", "add", "name", bridge, "type", "bridge"]);
        }
        if !state.has_addr {
            wanted.push(vec!["addr", "add", cidr, "dev", bridge]);
        }
        if !state.up {
            wanted.push(vec!["link", "set", bridge, "up"]);
        }
        wanted
            .into_iter()
            .map(|args| CommandSpec::new("ip", args).privileged().with_timeout(timeout))
            .collect()
    }
}

impl ProvisioningStep for CreateBridge {
    fn name(&self) -> &'static str {
        "create-bridge"
    }

    fn description(&self) -> String {
        "dedicated network bridge exists, addressed and up".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(Self::observe(ctx)?.complete())
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let state = Self::observe(ctx).unwrap_or_default();
        Self::commands(ctx, state).iter().map(CommandSpec::display).collect()
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let state = Self::observe(ctx)?;
        for spec in Self::commands(ctx, state) {
            ctx.run(&spec)?;
        }
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "check that {} does not overlap an existing network: ip route",
            ctx.config.engine.bridge_cidr
        )
    }
}

/// Rewrites the daemon config whenever it drifts from the rendered content.
pub struct WriteEngineConfig;

impl ProvisioningStep for WriteEngineConfig {
    fn name(&self) -> &'static str {
        "write-engine-config"
    }

    fn description(&self) -> String {
        "engine daemon configuration is current".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let rendered = render_engine_config(ctx.config)?;
        file_matches(ctx, &ctx.config.engine.config_path, &rendered)
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        ctx.request_restart(&ctx.config.engine.service);
        vec![tee_preview(&ctx.config.engine.config_path)]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let rendered = render_engine_config(ctx.config)?;
        write_with_parent(ctx, &ctx.config.engine.config_path, &rendered)?;
        ctx.request_restart(&ctx.config.engine.service);
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "check that {} is writable as root",
            ctx.config.engine.config_path.display()
        )
    }
}

pub struct InstallServiceUnit;

impl InstallServiceUnit {
    fn reload_spec(ctx: &StepContext<'_>) -> CommandSpec {
        systemctl(ctx, ["daemon-reload"]).privileged()
    }
}

impl ProvisioningStep for InstallServiceUnit {
    fn name(&self) -> &'static str {
        "install-service-unit"
    }

    fn description(&self) -> String {
        "engine systemd unit is installed".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        file_matches(
            ctx,
            &ctx.config.engine.unit_path,
            &render_service_unit(ctx.config),
        )
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        ctx.request_restart(&ctx.config.engine.service);
        vec![
            tee_preview(&ctx.config.engine.unit_path),
            Self::reload_spec(ctx).display(),
        ]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        write_with_parent(
            ctx,
            &ctx.config.engine.unit_path,
            &render_service_unit(ctx.config),
        )?;
        ctx.run(&Self::reload_spec(ctx))?;
        ctx.request_restart(&ctx.config.engine.service);
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "inspect the unit with: systemctl cat {}",
            ctx.config.engine.service
        )
    }
}

/// Starts the engine, restarting it when its config or unit was rewritten
/// earlier in the same run.
pub struct StartEngineService;

impl StartEngineService {
    fn needs_restart(ctx: &StepContext<'_>) -> Result<bool> {
        let service = ctx.config.engine.service.as_str();
        Ok(ctx.restart_pending(service) && ctx.succeeds(&systemctl(ctx, ["is-active", service]))?)
    }
}

impl ProvisioningStep for StartEngineService {
    fn name(&self) -> &'static str {
        "start-engine-service"
    }

    fn description(&self) -> String {
        "engine service is enabled and running its current configuration".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let service = ctx.config.engine.service.as_str();
        Ok(!ctx.restart_pending(service) && service_running(ctx, service)?)
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let service = ctx.config.engine.service.as_str();
        if Self::needs_restart(ctx).unwrap_or(false) {
            vec![restart_service_spec(ctx, service).display()]
        } else {
            vec![enable_service_spec(ctx, service).display()]
        }
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let service = ctx.config.engine.service.as_str();
        if Self::needs_restart(ctx)? {
            info!(service, "configuration changed, restarting");
            ctx.run(&restart_service_spec(ctx, service))?;
        }
        ctx.clear_restart(service);
        if !service_running(ctx, service)? {
            ctx.run(&enable_service_spec(ctx, service))?;
        }
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        service_status_hint(ctx)
    }
}

fn service_status_hint(ctx: &StepContext<'_>) -> String {
    match ctx.facts.variant {
        PlatformVariant::VmHosted => "check VM status: limactl list".to_string(),
        _ => format!(
            "check service status: systemctl status {}",
            ctx.config.engine.service
        ),
    }
}

/// Waits for the engine socket with the bounded poll.
pub struct WaitForSocket;

impl ProvisioningStep for WaitForSocket {
    fn name(&self) -> &'static str {
        "wait-for-socket"
    }

    fn description(&self) -> String {
        "engine socket is present".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(ctx
            .host
            .path_exists(&ctx.config.expected_socket(ctx.facts.variant)))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![format!(
            "# wait up to {} x {:?} for {}",
            ctx.config.probe.socket_poll_attempts,
            ctx.config.probe.poll_interval(),
            ctx.config.expected_socket(ctx.facts.variant).display()
        )]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let socket = ctx.config.expected_socket(ctx.facts.variant);
        let outcome = poll_until(
            ctx.host,
            ctx.config.probe.poll_interval(),
            ctx.config.probe.socket_poll_attempts,
            || ctx.host.path_exists(&socket),
        );
        match outcome {
            PollOutcome::Ready { .. } => Ok(Vec::new()),
            PollOutcome::TimedOut { attempts } => anyhow::bail!(
                "socket {} did not appear after {} attempts",
                socket.display(),
                attempts
            ),
        }
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        service_status_hint(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeHost;
    use crate::platform::{ExecutionContext, HostFacts};
    use crate::step::{StepExecutor, StepOutcome};

    fn facts(variant: PlatformVariant) -> HostFacts {
        HostFacts::new(variant, ExecutionContext::Host)
    }

    #[test]
    fn engine_config_pins_paths_bridge_and_runtime() {
        let rendered = render_engine_config(&BastionConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["data-root"], "/var/lib/bastion/docker");
        assert_eq!(value["hosts"][0], "unix:///var/run/bastion-docker.sock");
        assert_eq!(value["bridge"], "bastion0");
        assert_eq!(value["default-runtime"], "sysbox-runc");
        assert_eq!(value["runtimes"]["sysbox-runc"]["path"], "/usr/bin/sysbox-runc");
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn service_unit_points_at_config_file() {
        let unit = render_service_unit(&BastionConfig::default());
        assert!(unit.contains("ExecStart=/usr/bin/dockerd --config-file /etc/bastion/daemon.json"));
        assert!(unit.contains("Requires=sysbox.service"));
    }

    #[test]
    fn given_drifted_config_when_applied_then_rewritten() {
        let host = FakeHost::new();
        host.add_file("/etc/bastion/daemon.json", "{\"bridge\": \"docker0\"}\n");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&WriteEngineConfig);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert_eq!(
            host.file("/etc/bastion/daemon.json"),
            Some(render_engine_config(&config).unwrap())
        );
    }

    #[test]
    fn given_running_engine_when_config_rewritten_then_restarted_once() {
        let host = FakeHost::new();
        host.set_service_running("bastion-docker");
        host.add_file("/etc/bastion/daemon.json", "{}\n");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));
        let executor = StepExecutor::new(&ctx, false);

        assert_eq!(executor.run(&StartEngineService).outcome, StepOutcome::Skipped);
        executor.run(&WriteEngineConfig);
        let record = executor.run(&StartEngineService);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert_eq!(host.count_commands("sudo systemctl restart bastion-docker"), 1);
        assert_eq!(host.count_commands("sudo systemctl enable"), 0);
        assert!(!ctx.restart_pending("bastion-docker"));
    }

    #[test]
    fn given_stopped_engine_when_config_rewritten_then_started_not_restarted() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));
        let executor = StepExecutor::new(&ctx, false);

        executor.run(&WriteEngineConfig);
        let record = executor.run(&StartEngineService);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert_eq!(host.count_commands("sudo systemctl restart"), 0);
        assert_eq!(host.count_commands("sudo systemctl enable --now bastion-docker"), 1);
    }

    #[test]
    fn given_identical_config_when_run_then_skipped() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        host.add_file("/etc/bastion/daemon.json", &render_engine_config(&config).unwrap());
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&WriteEngineConfig);

        assert_eq!(record.outcome, StepOutcome::Skipped);
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn given_missing_bridge_when_applied_then_created_with_fixed_subnet() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&CreateBridge);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert!(host.has_bridge("bastion0"));
        assert_eq!(
            host.count_commands("sudo ip addr add 172.29.0.1/16 dev bastion0"),
            1
        );
    }

    #[test]
    fn given_bare_bridge_link_when_run_then_address_and_link_state_repaired() {
        let host = FakeHost::new();
        host.add_bridge("bastion0");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&CreateBridge);

        assert_eq!(record.outcome, StepOutcome::Applied(Vec::new()));
        assert!(host.bridge_configured("bastion0", "172.29.0.1/16"));
        assert_eq!(host.count_commands("sudo ip link add"), 0);
        assert_eq!(
            host.count_commands("sudo ip addr add 172.29.0.1/16 dev bastion0"),
            1
        );
        assert_eq!(host.count_commands("sudo ip link set bastion0 up"), 1);
    }

    #[test]
    fn given_configured_bridge_when_run_then_skipped() {
        let host = FakeHost::new();
        host.add_configured_bridge("bastion0", "172.29.0.1/16");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&CreateBridge);

        assert_eq!(record.outcome, StepOutcome::Skipped);
        assert!(host.mutations().is_empty());
    }

    #[test]
    fn given_addressed_bridge_that_is_down_when_planned_then_only_link_up_listed() {
        let host = FakeHost::new();
        host.add_bridge("bastion0");
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));
        let state = BridgeState {
            exists: true,
            has_addr: true,
            up: false,
        };

        let planned: Vec<String> = CreateBridge::commands(&ctx, state)
            .iter()
            .map(CommandSpec::display)
            .collect();

        assert_eq!(planned, vec!["sudo ip link set bastion0 up".to_string()]);
    }

    #[test]
    fn link_flags_and_addresses_are_read_from_ip_output() {
        assert!(link_is_up("7: bastion0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500"));
        assert!(!link_is_up("7: bastion0: <BROADCAST,MULTICAST> mtu 1500 state UP"));
        assert!(carries_addr(
            "7: bastion0    inet 172.29.0.1/16 scope global bastion0\n",
            "172.29.0.1/16"
        ));
        assert!(!carries_addr(
            "7: bastion0    inet 10.0.0.1/24 scope global bastion0\n",
            "172.29.0.1/16"
        ));
    }

    #[test]
    fn given_unit_installed_when_applied_then_daemon_reloaded() {
        let host = FakeHost::new();
        let config = BastionConfig::default();
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        StepExecutor::new(&ctx, false).run(&InstallServiceUnit);

        assert!(host
            .file("/etc/systemd/system/bastion-docker.service")
            .is_some());
        assert_eq!(host.count_commands("sudo systemctl daemon-reload"), 1);
    }

    #[test]
    fn given_socket_never_appears_when_waiting_then_fatal_after_bounded_attempts() {
        let host = FakeHost::new();
        let mut config = BastionConfig::default();
        config.probe.socket_poll_attempts = 5;
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::Linux));

        let record = StepExecutor::new(&ctx, false).run(&WaitForSocket);

        assert!(record.is_fatal());
        assert_eq!(
            record.remediation.as_deref(),
            Some("check service status: systemctl status bastion-docker")
        );
        assert_eq!(host.slept(), config.probe.poll_interval() * 4);
    }

    #[test]
    fn given_vm_hosted_when_socket_missing_then_remediation_names_limactl() {
        let host = FakeHost::new();
        let mut config = BastionConfig::default();
        config.probe.socket_poll_attempts = 1;
        let ctx = StepContext::new(&host, &config, facts(PlatformVariant::VmHosted));

        let record = StepExecutor::new(&ctx, false).run(&WaitForSocket);

        assert_eq!(
            record.remediation.as_deref(),
            Some("check VM status: limactl list")
        );
    }
}
