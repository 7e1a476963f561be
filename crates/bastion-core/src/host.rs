//! Process and filesystem access to the host.
//!
//! Everything the resolver, pipeline and migrator do to the outside world goes
//! through the [`Host`] trait, so that the same logic can run against the real
//! system ([`SystemHost`]) or the in-memory simulation in [`crate::fakes`].

use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Exit status reported when a bounded call exceeded its timeout.
pub const TIMED_OUT_STATUS: i32 = 124;

/// Exit status reported when the host could not enforce a timeout at all.
pub const TIMEOUT_UNAVAILABLE_STATUS: i32 = 125;

/// Ambient variables that would otherwise take precedence over `--context`.
pub const ENDPOINT_ENV_VARS: [&str; 2] = ["DOCKER_HOST", "DOCKER_CONTEXT"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub clear_env: Vec<String>,
    pub privileged: bool,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            clear_env: Vec::new(),
            privileged: false,
            stdin: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn clearing_endpoint_env(mut self) -> Self {
        self.clear_env = ENDPOINT_ENV_VARS.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The command line as an operator would type it. Used verbatim in dry-run previews.
    pub fn display(&self) -> String {
        let mut s = String::new();
        if self.privileged {
            s.push_str("sudo ");
        }
        s.push_str(&self.program);
        for arg in &self.args {
            s.push(' ');
            s.push_str(&shell_quote(arg));
        }
        s
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let needs_quotes = arg.chars().any(|c| {
        c.is_whitespace() || matches!(c, '\'' | '"' | '{' | '}' | '$' | '*' | '|' | '&' | ';' | '<' | '>')
    });
    if needs_quotes {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn timed_out(&self) -> bool {
        self.status == TIMED_OUT_STATUS
    }

    pub fn timeout_unavailable(&self) -> bool {
        self.status == TIMEOUT_UNAVAILABLE_STATUS
    }

    /// Everything the tool said, stderr first. Never discarded by callers.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (false, false) => format!("{}\n{}", stderr, stdout),
            (false, true) => stderr.to_string(),
            (true, false) => stdout.to_string(),
            (true, true) => String::new(),
        }
    }
}

pub trait Host {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    fn path_exists(&self, path: &Path) -> bool;

    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    /// Write a file, escalating privileges when the location requires it.
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn sleep(&self, duration: Duration);

    fn binary_in_path(&self, name: &str) -> bool {
        self.execute(&CommandSpec::new("which", [name]))
            .map(|output| output.success())
            .unwrap_or(false)
    }
}

/// The real host: subprocesses with enforced timeouts, `sudo` for privileged work.
#[derive(Debug, Default, Clone)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }

    fn is_root(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions and cannot fail.
            unsafe { libc::geteuid() == 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn run_privileged(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<()> {
        let mut spec = CommandSpec::new(program, args.iter().copied()).privileged();
        if let Some(input) = stdin {
            spec = spec.with_stdin(input);
        }
        let output = self.execute(&spec)?;
        if !output.success() {
            anyhow::bail!("`{}` failed: {}", spec.display(), output.diagnostic());
        }
        Ok(())
    }
}

impl Host for SystemHost {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = if spec.privileged && !self.is_root() {
            let mut cmd = Command::new("sudo");
            cmd.arg(&spec.program);
            cmd
        } else {
            Command::new(&spec.program)
        };
        cmd.args(&spec.args);
        for var in &spec.clear_env {
            cmd.env_remove(var);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!(command = %spec.display(), timeout = ?spec.timeout, "executing");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", spec.display()))?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .with_context(|| "Failed to write to stdin")?;
            }
        }

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let status = match spec.timeout {
            None => Some(
                child
                    .wait()
                    .with_context(|| "Failed to wait for command completion")?,
            ),
            Some(limit) => match child.wait_timeout(limit) {
                Ok(Some(status)) => Some(status),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    None
                }
                Err(err) => {
                    warn!(command = %spec.display(), error = %err, "timed wait unavailable");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(CommandOutput {
                        status: TIMEOUT_UNAVAILABLE_STATUS,
                        stdout: join_reader(stdout_reader),
                        stderr: join_reader(stderr_reader),
                    });
                }
            },
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        Ok(match status {
            Some(status) => CommandOutput {
                status: status.code().unwrap_or(-1),
                stdout,
                stderr,
            },
            None => CommandOutput {
                status: TIMED_OUT_STATUS,
                stdout,
                stderr,
            },
        })
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        match fs::write(path, contents) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::PermissionDenied && !self.is_root() => {
                let target = path.to_string_lossy();
                self.run_privileged("tee", &[target.as_ref()], Some(contents))
            }
            Err(err) => Err(err).with_context(|| format!("Failed to write {}", path.display())),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) if err.kind() == IoErrorKind::PermissionDenied && !self.is_root() => {
                let target = path.to_string_lossy();
                self.run_privileged("rm", &["-f", target.as_ref()], None)
            }
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        match fs::create_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::PermissionDenied && !self.is_root() => {
                let target = path.to_string_lossy();
                self.run_privileged("mkdir", &["-p", target.as_ref()], None)
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to create directory {}", path.display()))
            }
        }
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<thread::JoinHandle<String>> {
    source.map(|reader| thread::spawn(move || drain(reader)))
}

/// Everything readable from `reader`. A read error is appended, not dropped.
fn drain<R: Read>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let result = reader.read_to_end(&mut buf);
    let mut text = String::from_utf8_lossy(&buf).to_string();
    if let Err(err) = result {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[output truncated: {}]", err));
    }
    text
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
