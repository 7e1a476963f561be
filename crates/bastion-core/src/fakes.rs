//! In-memory simulation of a host (testing only)
//!
//! [`FakeHost`] answers the subset of `docker`, `systemctl`, `limactl`, `ip`,
//! `uname`, `which`, `curl` and `apt-get` invocations that the resolver,
//! pipeline and migrator issue, and keeps a log of every command and every
//! mutation so tests can assert on side effects.

use anyhow::Result;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::host::{CommandOutput, CommandSpec, Host, TIMED_OUT_STATUS, TIMEOUT_UNAVAILABLE_STATUS};

pub const DEFAULT_CONTEXT: &str = "default";
pub const DEFAULT_LOCAL_ADDRESS: &str = "unix:///var/run/docker.sock";

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

/// A daemon listening on one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeEngine {
    pub runtimes: Vec<String>,
    pub default_runtime: String,
    /// What `cat /proc/self/uid_map` prints inside a workload.
    pub uid_map: String,
    /// Images present locally. Workloads never pull implicitly.
    pub images: BTreeSet<String>,
    /// While set, every call against this engine fails with this text.
    pub error: Option<String>,
    pub server_errors: Vec<String>,
}

impl FakeEngine {
    /// Engine with the hardened runtime registered and a remapped user namespace.
    pub fn isolated() -> Self {
        Self {
            runtimes: vec![
                "io.containerd.runc.v2".to_string(),
                "runc".to_string(),
                "sysbox-runc".to_string(),
            ],
            default_runtime: "sysbox-runc".to_string(),
            uid_map: "         0     165536      65536\n".to_string(),
            images: BTreeSet::new(),
            error: None,
            server_errors: Vec::new(),
        }
    }

    /// Stock engine: runc only, workloads share the host's uid space.
    pub fn plain() -> Self {
        Self {
            runtimes: vec!["io.containerd.runc.v2".to_string(), "runc".to_string()],
            default_runtime: "runc".to_string(),
            uid_map: "         0          0 4294967295\n".to_string(),
            images: BTreeSet::new(),
            error: None,
            server_errors: Vec::new(),
        }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.images.insert(image.to_string());
        self
    }

    pub fn with_uid_map(mut self, uid_map: &str) -> Self {
        self.uid_map = uid_map.to_string();
        self
    }

    pub fn with_runtime(mut self, runtime: &str) -> Self {
        if !self.runtimes.iter().any(|r| r == runtime) {
            self.runtimes.push(runtime.to_string());
        }
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_server_error(mut self, error: &str) -> Self {
        self.server_errors.push(error.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FakeBridge {
    addrs: BTreeSet<String>,
    up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FakeVm {
    name: String,
    status: String,
}

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FakeState {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    binaries: BTreeSet<String>,
    installed_binary: String,
    active_services: BTreeSet<String>,
    enabled_services: BTreeSet<String>,
    service_sockets: BTreeMap<String, PathBuf>,
    socket_never_appears: bool,
    contexts: BTreeMap<String, String>,
    current_context: String,
    engines: BTreeMap<String, FakeEngine>,
    vms: Vec<FakeVm>,
    vm_sockets: BTreeMap<String, PathBuf>,
    kernel_release: String,
    arch: String,
    bridges: BTreeMap<String, FakeBridge>,
    info_times_out: bool,
    inspect_times_out: bool,
    timeout_unavailable: bool,
    failures: Vec<(String, String)>,
    commands: Vec<String>,
    mutations: Vec<String>,
    slept: Duration,
}

impl Default for FakeState {
    fn default() -> Self {
        let mut contexts = BTreeMap::new();
        contexts.insert(DEFAULT_CONTEXT.to_string(), DEFAULT_LOCAL_ADDRESS.to_string());
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            binaries: BTreeSet::new(),
            installed_binary: "sysbox-runc".to_string(),
            active_services: BTreeSet::new(),
            enabled_services: BTreeSet::new(),
            service_sockets: BTreeMap::new(),
            socket_never_appears: false,
            contexts,
            current_context: DEFAULT_CONTEXT.to_string(),
            engines: BTreeMap::new(),
            vms: Vec::new(),
            vm_sockets: BTreeMap::new(),
            kernel_release: "6.8.0-45-generic".to_string(),
            arch: "x86_64".to_string(),
            bridges: BTreeMap::new(),
            info_times_out: false,
            inspect_times_out: false,
            timeout_unavailable: false,
            failures: Vec::new(),
            commands: Vec::new(),
            mutations: Vec::new(),
            slept: Duration::ZERO,
        }
    }
}

/// Simulated host backed by in-memory state.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- filesystem ---------------------------------------------------------

    pub fn add_file(&self, path: impl AsRef<Path>, contents: &str) {
        self.state()
            .files
            .insert(path.as_ref().to_path_buf(), contents.to_string());
    }

    /// Sockets are modelled as empty files.
    pub fn add_socket(&self, path: impl AsRef<Path>) {
        self.add_file(path, "");
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        self.state().dirs.insert(path.as_ref().to_path_buf());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state().files.get(path.as_ref()).cloned()
    }

    pub fn has_path(&self, path: impl AsRef<Path>) -> bool {
        let state = self.state();
        let path = path.as_ref();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    // -- binaries, kernel ---------------------------------------------------

    pub fn add_binary(&self, name: &str) {
        self.state().binaries.insert(name.to_string());
    }

    pub fn add_binaries(&self, names: &[&str]) {
        let mut state = self.state();
        for name in names {
            state.binaries.insert(name.to_string());
        }
    }

    pub fn remove_binary(&self, name: &str) {
        self.state().binaries.remove(name);
    }

    pub fn set_kernel_release(&self, release: &str) {
        self.state().kernel_release = release.to_string();
    }

    pub fn set_arch(&self, arch: &str) {
        self.state().arch = arch.to_string();
    }

    // -- services -----------------------------------------------------------

    pub fn set_service_running(&self, service: &str) {
        let mut state = self.state();
        state.active_services.insert(service.to_string());
        state.enabled_services.insert(service.to_string());
    }

    pub fn service_running(&self, service: &str) -> bool {
        self.state().active_services.contains(service)
    }

    /// Starting `service` creates `socket`, unless sockets never appear.
    pub fn bind_service_socket(&self, service: &str, socket: impl AsRef<Path>) {
        self.state()
            .service_sockets
            .insert(service.to_string(), socket.as_ref().to_path_buf());
    }

    pub fn socket_never_appears(&self) {
        self.state().socket_never_appears = true;
    }

    // -- engine contexts and daemons ----------------------------------------

    pub fn add_context(&self, name: &str, address: &str) {
        self.state()
            .contexts
            .insert(name.to_string(), address.to_string());
    }

    pub fn context_address(&self, name: &str) -> Option<String> {
        self.state().contexts.get(name).cloned()
    }

    pub fn set_current_context(&self, name: &str) {
        self.state().current_context = name.to_string();
    }

    pub fn current_context(&self) -> String {
        self.state().current_context.clone()
    }

    pub fn add_engine(&self, address: &str, engine: FakeEngine) {
        self.state().engines.insert(address.to_string(), engine);
    }

    pub fn engine(&self, address: &str) -> Option<FakeEngine> {
        self.state().engines.get(address).cloned()
    }

    pub fn update_engine(&self, address: &str, update: impl FnOnce(&mut FakeEngine)) {
        if let Some(engine) = self.state().engines.get_mut(address) {
            update(engine);
        }
    }

    /// Every bounded `info` call reports the timed-out status.
    pub fn set_info_times_out(&self) {
        self.state().info_times_out = true;
    }

    /// Every `context inspect` reports the timed-out status.
    pub fn set_inspect_times_out(&self) {
        self.state().inspect_times_out = true;
    }

    /// Bounded calls report that no timeout mechanism exists; unbounded ones run.
    pub fn set_timeout_unavailable(&self) {
        self.state().timeout_unavailable = true;
    }

    // -- virtual machines ---------------------------------------------------

    pub fn add_vm(&self, name: &str, status: &str) {
        let mut state = self.state();
        state.vms.retain(|vm| vm.name != name);
        state.vms.push(FakeVm {
            name: name.to_string(),
            status: status.to_string(),
        });
    }

    pub fn vm_status(&self, name: &str) -> Option<String> {
        self.state()
            .vms
            .iter()
            .find(|vm| vm.name == name)
            .map(|vm| vm.status.clone())
    }

    /// Starting VM `name` creates the forwarded `socket`.
    pub fn bind_vm_socket(&self, name: &str, socket: impl AsRef<Path>) {
        self.state()
            .vm_sockets
            .insert(name.to_string(), socket.as_ref().to_path_buf());
    }

    // -- network ------------------------------------------------------------

    /// A bare link: no address and administratively down.
    pub fn add_bridge(&self, name: &str) {
        self.state().bridges.entry(name.to_string()).or_default();
    }

    pub fn add_configured_bridge(&self, name: &str, cidr: &str) {
        let mut state = self.state();
        let bridge = state.bridges.entry(name.to_string()).or_default();
        bridge.addrs.insert(cidr.to_string());
        bridge.up = true;
    }

    pub fn has_bridge(&self, name: &str) -> bool {
        self.state().bridges.contains_key(name)
    }

    /// Whether `name` exists, carries `cidr` and is up.
    pub fn bridge_configured(&self, name: &str, cidr: &str) -> bool {
        self.state()
            .bridges
            .get(name)
            .map_or(false, |bridge| bridge.up && bridge.addrs.contains(cidr))
    }

    // -- failure injection and inspection -----------------------------------

    /// Any command whose display form starts with `prefix` fails with `stderr`.
    pub fn fail_command(&self, prefix: &str, stderr: &str) {
        self.state()
            .failures
            .push((prefix.to_string(), stderr.to_string()));
    }

    /// Display form of every command executed so far.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Commands and filesystem operations that changed host state.
    pub fn mutations(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state();
        state.commands.clear();
        state.mutations.clear();
    }

    pub fn slept(&self) -> Duration {
        self.state().slept
    }
}

impl Host for FakeHost {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut state = self.state();
        let display = spec.display();
        state.commands.push(display.clone());
        if is_mutating(spec) {
            state.mutations.push(display.clone());
        }

        if let Some((_, stderr)) = state
            .failures
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
        {
            return Ok(CommandOutput::failed(1, stderr.clone()));
        }

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let output = match spec.program.as_str() {
            "docker" => docker(&mut state, spec, &args),
            "systemctl" => systemctl(&mut state, &args),
            "limactl" => limactl(&mut state, &args),
            "ip" => ip(&mut state, &args),
            "which" => match args.first() {
                Some(name) if state.binaries.contains(*name) => {
                    CommandOutput::ok(format!("/usr/bin/{}\n", name))
                }
                _ => CommandOutput::failed(1, ""),
            },
            "uname" => match args.first().copied() {
                Some("-r") => CommandOutput::ok(format!("{}\n", state.kernel_release)),
                Some("-m") => CommandOutput::ok(format!("{}\n", state.arch)),
                _ => CommandOutput::ok("Linux\n"),
            },
            "curl" => {
                if let Some(pos) = args.iter().position(|a| *a == "-o") {
                    if let Some(target) = args.get(pos + 1) {
                        state.files.insert(PathBuf::from(target), String::new());
                    }
                }
                CommandOutput::ok("")
            }
            "apt-get" if args.first() == Some(&"install") => {
                let binary = state.installed_binary.clone();
                state.binaries.insert(binary);
                CommandOutput::ok("")
            }
            other => CommandOutput::failed(127, format!("{}: command not found", other)),
        };
        Ok(output)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.has_path(path)
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.file(path))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state();
        state.mutations.push(format!("write {}", path.display()));
        state.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        state.mutations.push(format!("remove {}", path.display()));
        state.files.remove(path);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        state.mutations.push(format!("mkdir {}", path.display()));
        for dir in path.ancestors() {
            state.dirs.insert(dir.to_path_buf());
        }
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        self.state().slept += duration;
    }
}

fn is_mutating(spec: &CommandSpec) -> bool {
    let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
    match spec.program.as_str() {
        "docker" => {
            let rest = strip_context_flag(&args).1;
            match rest {
                ["run", ..] | ["pull", ..] => true,
                ["context", sub, ..] => matches!(*sub, "create" | "update" | "rm" | "use"),
                _ => false,
            }
        }
        "systemctl" => matches!(
            args.first().copied(),
            Some("enable" | "disable" | "start" | "stop" | "restart" | "daemon-reload")
        ),
        "ip" => !args.contains(&"show"),
        "limactl" => matches!(
            args.first().copied(),
            Some("create" | "start" | "stop" | "delete")
        ),
        "curl" | "apt-get" | "tee" | "rm" | "mkdir" => true,
        _ => false,
    }
}

fn strip_context_flag<'a, 'b>(args: &'b [&'a str]) -> (Option<&'a str>, &'b [&'a str]) {
    match args {
        ["--context", name, rest @ ..] => (Some(*name), rest),
        rest => (None, rest),
    }
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|pos| args.get(pos + 1).copied())
}

fn daemon_unreachable(address: &str) -> CommandOutput {
    CommandOutput::failed(
        1,
        format!(
            "Cannot connect to the Docker daemon at {}. Is the docker daemon running?",
            address
        ),
    )
}

fn reachable_engine<'s>(state: &'s FakeState, context: &str) -> Result<&'s FakeEngine, CommandOutput> {
    let address = state.contexts.get(context).ok_or_else(|| {
        CommandOutput::failed(1, format!("context \"{}\" does not exist", context))
    })?;
    if let Some(path) = address.strip_prefix("unix://") {
        if !state.files.contains_key(Path::new(path)) {
            return Err(daemon_unreachable(address));
        }
    }
    let engine = state
        .engines
        .get(address)
        .ok_or_else(|| daemon_unreachable(address))?;
    match &engine.error {
        Some(error) => Err(CommandOutput::failed(1, error.clone())),
        None => Ok(engine),
    }
}

fn docker(state: &mut FakeState, spec: &CommandSpec, args: &[&str]) -> CommandOutput {
    let (context, rest) = strip_context_flag(args);
    let context = context.unwrap_or(DEFAULT_CONTEXT).to_string();

    match rest {
        ["context", "inspect", ..] if state.inspect_times_out => {
            CommandOutput::failed(TIMED_OUT_STATUS, "")
        }
        ["context", "inspect", name, ..] => match state.contexts.get(*name) {
            Some(address) => CommandOutput::ok(format!("{}\n", address)),
            None => CommandOutput::failed(1, format!("context \"{}\" does not exist", name)),
        },
        ["context", "create", name, tail @ ..] => {
            if state.contexts.contains_key(*name) {
                return CommandOutput::failed(1, format!("context \"{}\" already exists", name));
            }
            match flag_value(tail, "--docker").and_then(|v| v.strip_prefix("host=")) {
                Some(address) => {
                    state.contexts.insert(name.to_string(), address.to_string());
                    CommandOutput::ok(format!("{}\nSuccessfully created context \"{}\"\n", name, name))
                }
                None => CommandOutput::failed(1, "missing --docker host"),
            }
        }
        ["context", "update", name, tail @ ..] => {
            if !state.contexts.contains_key(*name) {
                return CommandOutput::failed(1, format!("context \"{}\" does not exist", name));
            }
            match flag_value(tail, "--docker").and_then(|v| v.strip_prefix("host=")) {
                Some(address) => {
                    state.contexts.insert(name.to_string(), address.to_string());
                    CommandOutput::ok(format!("{}\nSuccessfully updated context \"{}\"\n", name, name))
                }
                None => CommandOutput::failed(1, "missing --docker host"),
            }
        }
        ["context", "rm", .., name] => {
            if *name == DEFAULT_CONTEXT {
                return CommandOutput::failed(1, "default context cannot be removed");
            }
            if state.current_context == *name {
                return CommandOutput::failed(
                    1,
                    format!("context \"{}\" is in use, switch to another context first", name),
                );
            }
            match state.contexts.remove(*name) {
                Some(_) => CommandOutput::ok(format!("{}\n", name)),
                None => CommandOutput::failed(1, format!("context \"{}\" does not exist", name)),
            }
        }
        ["context", "use", name] => {
            if !state.contexts.contains_key(*name) {
                return CommandOutput::failed(1, format!("context \"{}\" does not exist", name));
            }
            state.current_context = name.to_string();
            CommandOutput::ok(format!("{}\n", name))
        }
        ["context", "show"] => CommandOutput::ok(format!("{}\n", state.current_context)),
        ["info", ..] => {
            if !state.contexts.contains_key(&context) {
                return CommandOutput::failed(1, format!("context \"{}\" does not exist", context));
            }
            if state.info_times_out {
                return CommandOutput::failed(TIMED_OUT_STATUS, "");
            }
            if state.timeout_unavailable && spec.timeout.is_some() {
                return CommandOutput::failed(TIMEOUT_UNAVAILABLE_STATUS, "timeout: not supported");
            }
            match reachable_engine(state, &context) {
                Ok(engine) => {
                    let runtimes: serde_json::Map<String, serde_json::Value> = engine
                        .runtimes
                        .iter()
                        .map(|r| (r.clone(), json!({ "path": r })))
                        .collect();
                    let server_errors = if engine.server_errors.is_empty() {
                        serde_json::Value::Null
                    } else {
                        json!(engine.server_errors)
                    };
                    let info = json!({
                        "Runtimes": runtimes,
                        "DefaultRuntime": engine.default_runtime,
                        "ServerErrors": server_errors,
                    });
                    CommandOutput::ok(format!("{}\n", info))
                }
                Err(output) => output,
            }
        }
        ["run", tail @ ..] => {
            let engine = match reachable_engine(state, &context) {
                Ok(engine) => engine,
                Err(output) => return output,
            };
            let runtime = flag_value(tail, "--runtime").unwrap_or("runc");
            if !engine.runtimes.iter().any(|r| r == runtime) {
                return CommandOutput::failed(
                    125,
                    format!(
                        "docker: Error response from daemon: unknown or invalid runtime name: {}.",
                        runtime
                    ),
                );
            }
            let positional: Vec<&str> = match tail.iter().position(|a| *a == "--runtime") {
                Some(pos) => tail.iter().skip(pos + 2).copied().collect(),
                None => tail.iter().copied().filter(|a| !a.starts_with("--")).collect(),
            };
            let (image, command) = match positional.split_first() {
                Some((image, command)) => (*image, command),
                None => return CommandOutput::failed(125, "\"docker run\" requires at least 1 argument."),
            };
            if !engine.images.contains(image) {
                return CommandOutput::failed(
                    125,
                    format!(
                        "Unable to find image '{}' locally\ndocker: Error response from daemon: pull access denied.",
                        image
                    ),
                );
            }
            match command {
                ["cat", "/proc/self/uid_map"] => CommandOutput::ok(engine.uid_map.clone()),
                ["echo", words @ ..] => CommandOutput::ok(format!("{}\n", words.join(" "))),
                _ => CommandOutput::ok(""),
            }
        }
        ["pull", image] => {
            let address = match reachable_engine(state, &context) {
                Ok(_) => state.contexts.get(&context).cloned().unwrap_or_default(),
                Err(output) => return output,
            };
            if let Some(engine) = state.engines.get_mut(&address) {
                engine.images.insert(image.to_string());
            }
            CommandOutput::ok(format!("Status: Downloaded newer image for {}\n", image))
        }
        ["image", "inspect", image] => match reachable_engine(state, &context) {
            Ok(engine) if engine.images.contains(*image) => CommandOutput::ok("[{}]\n"),
            Ok(_) => CommandOutput::failed(1, format!("Error: No such image: {}", image)),
            Err(output) => output,
        },
        _ => CommandOutput::failed(1, format!("docker: unsupported invocation {:?}", rest)),
    }
}

fn systemctl(state: &mut FakeState, args: &[&str]) -> CommandOutput {
    match args {
        ["is-active", service] => {
            if state.active_services.contains(*service) {
                CommandOutput::ok("active\n")
            } else {
                CommandOutput {
                    status: 3,
                    stdout: "inactive\n".to_string(),
                    stderr: String::new(),
                }
            }
        }
        ["is-enabled", service] => {
            if state.enabled_services.contains(*service) {
                CommandOutput::ok("enabled\n")
            } else {
                CommandOutput {
                    status: 1,
                    stdout: "disabled\n".to_string(),
                    stderr: String::new(),
                }
            }
        }
        ["enable", "--now", service] => {
            state.enabled_services.insert(service.to_string());
            activate(state, service);
            CommandOutput::ok("")
        }
        ["restart", service] => {
            activate(state, service);
            CommandOutput::ok("")
        }
        ["daemon-reload"] | ["status", ..] => CommandOutput::ok(""),
        _ => CommandOutput::failed(1, format!("systemctl: unsupported invocation {:?}", args)),
    }
}

fn activate(state: &mut FakeState, service: &str) {
    state.active_services.insert(service.to_string());
    if !state.socket_never_appears {
        if let Some(socket) = state.service_sockets.get(service).cloned() {
            state.files.insert(socket, String::new());
        }
    }
}

fn limactl(state: &mut FakeState, args: &[&str]) -> CommandOutput {
    match args {
        ["list", "--json"] => {
            let lines: Vec<String> = state
                .vms
                .iter()
                .map(|vm| json!({ "name": vm.name, "status": vm.status }).to_string())
                .collect();
            CommandOutput::ok(lines.join("\n"))
        }
        ["create", tail @ ..] => match flag_value(tail, "--name") {
            Some(name) if state.vms.iter().any(|vm| vm.name == name) => {
                CommandOutput::failed(1, format!("instance \"{}\" already exists", name))
            }
            Some(name) => {
                state.vms.push(FakeVm {
                    name: name.to_string(),
                    status: "Stopped".to_string(),
                });
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(1, "missing --name"),
        },
        ["start", name] => match state.vms.iter_mut().find(|vm| vm.name == *name) {
            Some(vm) => {
                vm.status = "Running".to_string();
                if !state.socket_never_appears {
                    if let Some(socket) = state.vm_sockets.get(*name).cloned() {
                        state.files.insert(socket, String::new());
                    }
                }
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(1, format!("instance \"{}\" not found", name)),
        },
        ["delete", "--force", name] => {
            let before = state.vms.len();
            state.vms.retain(|vm| vm.name != *name);
            if state.vms.len() == before {
                CommandOutput::failed(1, format!("instance \"{}\" not found", name))
            } else {
                CommandOutput::ok("")
            }
        }
        _ => CommandOutput::failed(1, format!("limactl: unsupported invocation {:?}", args)),
    }
}

fn ip(state: &mut FakeState, args: &[&str]) -> CommandOutput {
    let missing = |name: &str| CommandOutput::failed(1, format!("Device \"{}\" does not exist.", name));
    match args {
        ["link", "show", name] => match state.bridges.get(*name) {
            Some(bridge) => {
                let flags = if bridge.up { "BROADCAST,MULTICAST,UP,LOWER_UP" } else { "BROADCAST,MULTICAST" };
                CommandOutput::ok(format!("7: {}: <{}> mtu 1500 qdisc noqueue\n", name, flags))
            }
            None => missing(name),
        },
        ["-o", "addr", "show", "dev", name] => match state.bridges.get(*name) {
            Some(bridge) => CommandOutput::ok(
                bridge
                    .addrs
                    .iter()
                    .map(|cidr| format!("7: {}    inet {} scope global {}\n", name, cidr, name))
                    .collect::<String>(),
            ),
            None => missing(name),
        },
        ["link", "add", "name", name, ..] => {
            if state.bridges.contains_key(*name) {
                return CommandOutput::failed(2, "RTNETLINK answers: File exists");
            }
            state.bridges.insert(name.to_string(), FakeBridge::default());
            CommandOutput::ok("")
        }
        ["addr", "add", cidr, "dev", name] => match state.bridges.get_mut(*name) {
            Some(bridge) => {
                if !bridge.addrs.insert(cidr.to_string()) {
                    CommandOutput::failed(2, "RTNETLINK answers: File exists")
                } else {
                    CommandOutput::ok("")
                }
            }
            None => CommandOutput::failed(1, format!("Cannot find device \"{}\"", name)),
        },
        ["link", "set", name, "up"] => match state.bridges.get_mut(*name) {
            Some(bridge) => {
                bridge.up = true;
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(1, format!("Cannot find device \"{}\"", name)),
        },
        _ => CommandOutput::failed(1, format!("ip: unsupported invocation {:?}", args)),
    }
}
