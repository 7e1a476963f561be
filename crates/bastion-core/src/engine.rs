//! Typed access to the container engine's CLI.
//!
//! Every call names its context explicitly and clears `DOCKER_HOST` /
//! `DOCKER_CONTEXT`, so the reference argument is authoritative.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::host::{CommandOutput, CommandSpec, Host};
use crate::probe::{classify, ErrorKind, CONTEXT_MISSING_PHRASES};

pub const ENGINE_CLI: &str = "docker";

const CONTEXT_HOST_FORMAT: &str = "{{.Endpoints.docker.Host}}";
const INFO_FORMAT: &str = "{{json .}}";

/// Snapshot of a named endpoint as seen by one verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEndpoint {
    pub name: String,
    pub address: Option<String>,
    pub exists: bool,
    pub reachable: bool,
    /// The hardened runtime is registered with the engine.
    pub capable: bool,
}

impl EngineEndpoint {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: None,
            exists: false,
            reachable: false,
            capable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    Socket(PathBuf),
    Remote(String),
}

impl EndpointAddress {
    pub fn parse(address: &str) -> Self {
        match address.trim().strip_prefix("unix://") {
            Some(path) => EndpointAddress::Socket(PathBuf::from(path)),
            None => EndpointAddress::Remote(address.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextLookup {
    Found { address: String },
    Missing { diagnostic: String },
    /// The inspect call itself failed, so existence is unknown.
    Unavailable { kind: ErrorKind, diagnostic: String },
}

impl ContextLookup {
    fn from_output(output: &CommandOutput) -> Self {
        let address = output.stdout.trim();
        if output.success() && !address.is_empty() {
            return ContextLookup::Found {
                address: address.to_string(),
            };
        }
        let diagnostic = output.diagnostic();
        if output.success() {
            return ContextLookup::Missing {
                diagnostic: "context has no docker endpoint".to_string(),
            };
        }
        if output.timed_out() {
            return ContextLookup::Unavailable {
                kind: ErrorKind::Timeout,
                diagnostic: "context inspect did not answer in time".to_string(),
            };
        }
        let lowered = diagnostic.to_lowercase();
        if CONTEXT_MISSING_PHRASES.iter().any(|p| lowered.contains(p)) {
            ContextLookup::Missing { diagnostic }
        } else {
            ContextLookup::Unavailable {
                kind: classify(&diagnostic),
                diagnostic,
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineInfo {
    pub runtimes: Vec<String>,
    pub default_runtime: Option<String>,
    pub server_errors: Vec<String>,
}

impl EngineInfo {
    pub fn has_runtime(&self, name: &str) -> bool {
        self.runtimes.iter().any(|r| r == name)
    }
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    #[serde(rename = "Runtimes", default)]
    runtimes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(rename = "DefaultRuntime", default)]
    default_runtime: Option<String>,
    #[serde(rename = "ServerErrors", default)]
    server_errors: Option<Vec<String>>,
}

pub fn parse_info(json: &str) -> Result<EngineInfo> {
    let raw: RawInfo =
        serde_json::from_str(json.trim()).context("Failed to parse engine info JSON")?;
    Ok(EngineInfo {
        runtimes: raw.runtimes.unwrap_or_default().into_keys().collect(),
        default_runtime: raw.default_runtime.filter(|r| !r.is_empty()),
        server_errors: raw.server_errors.unwrap_or_default(),
    })
}

#[derive(Clone, Copy)]
pub struct EngineCli<'a> {
    host: &'a dyn Host,
    timeout: Duration,
    workload_timeout: Duration,
}

impl<'a> EngineCli<'a> {
    pub fn new(host: &'a dyn Host, timeout: Duration, workload_timeout: Duration) -> Self {
        Self {
            host,
            timeout,
            workload_timeout,
        }
    }

    fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(ENGINE_CLI, args)
            .clearing_endpoint_env()
            .with_timeout(self.timeout)
    }

    pub fn inspect_context_spec(&self, name: &str) -> CommandSpec {
        self.command(["context", "inspect", name, "--format", CONTEXT_HOST_FORMAT])
    }

    pub fn create_context_spec(&self, name: &str, address: &str, description: &str) -> CommandSpec {
        let host = format!("host={}", address);
        self.command([
            "context",
            "create",
            name,
            "--description",
            description,
            "--docker",
            host.as_str(),
        ])
    }

    pub fn update_context_spec(&self, name: &str, address: &str) -> CommandSpec {
        let host = format!("host={}", address);
        self.command(["context", "update", name, "--docker", host.as_str()])
    }

    pub fn remove_context_spec(&self, name: &str) -> CommandSpec {
        self.command(["context", "rm", "--force", name])
    }

    pub fn use_context_spec(&self, name: &str) -> CommandSpec {
        self.command(["context", "use", name])
    }

    pub fn show_context_spec(&self) -> CommandSpec {
        self.command(["context", "show"])
    }

    pub fn info_spec(&self, context: &str) -> CommandSpec {
        self.command(["--context", context, "info", "--format", INFO_FORMAT])
    }

    pub fn run_workload_spec(
        &self,
        context: &str,
        runtime: &str,
        image: &str,
        command: &[&str],
    ) -> CommandSpec {
        let mut args = vec![
            "--context", context, "run", "--rm", "--runtime", runtime, image,
        ];
        args.extend_from_slice(command);
        self.command(args).with_timeout(self.workload_timeout)
    }

    pub fn pull_spec(&self, context: &str, image: &str) -> CommandSpec {
        self.command(["--context", context, "pull", image])
            .with_timeout(self.workload_timeout)
    }

    pub fn image_inspect_spec(&self, context: &str, image: &str) -> CommandSpec {
        self.command(["--context", context, "image", "inspect", image])
    }

    pub fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.host.execute(spec)
    }

    /// Run a mutating call and fail with the tool's own diagnostic.
    pub fn apply(&self, spec: &CommandSpec) -> Result<()> {
        let output = self.host.execute(spec)?;
        if !output.success() {
            anyhow::bail!("`{}` failed: {}", spec.display(), output.diagnostic());
        }
        Ok(())
    }

    pub fn inspect_context(&self, name: &str) -> Result<ContextLookup> {
        let output = self.host.execute(&self.inspect_context_spec(name))?;
        Ok(ContextLookup::from_output(&output))
    }

    /// The context's address, `None` when it is not defined. A failed inspect is an error.
    pub fn context_address(&self, name: &str) -> Result<Option<String>> {
        match self.inspect_context(name)? {
            ContextLookup::Found { address } => Ok(Some(address)),
            ContextLookup::Missing { .. } => Ok(None),
            ContextLookup::Unavailable { kind, diagnostic } => {
                anyhow::bail!("could not inspect context {}: {} ({})", name, kind, diagnostic)
            }
        }
    }

    pub fn current_context(&self) -> Result<Option<String>> {
        let output = self.host.execute(&self.show_context_spec())?;
        let name = output.stdout.trim();
        Ok((output.success() && !name.is_empty()).then(|| name.to_string()))
    }

    pub fn image_present(&self, context: &str, image: &str) -> bool {
        self.host
            .execute(&self.image_inspect_spec(context, image))
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TIMED_OUT_STATUS;

    #[test]
    fn parse_info_lists_runtimes_and_default() {
        let info = parse_info(
            r#"{"Runtimes":{"runc":{"path":"runc"},"sysbox-runc":{"path":"/usr/bin/sysbox-runc"}},"DefaultRuntime":"sysbox-runc"}"#,
        )
        .unwrap();
        assert!(info.has_runtime("sysbox-runc"));
        assert!(info.has_runtime("runc"));
        assert_eq!(info.default_runtime.as_deref(), Some("sysbox-runc"));
    }

    #[test]
    fn parse_info_surfaces_server_errors() {
        let info = parse_info(r#"{"ServerErrors":["Cannot connect to the Docker daemon"]}"#).unwrap();
        assert!(info.runtimes.is_empty());
        assert_eq!(info.server_errors.len(), 1);
    }

    #[test]
    fn parse_info_rejects_non_json() {
        assert!(parse_info("Client: Docker Engine").is_err());
    }

    #[test]
    fn given_inspect_outputs_when_interpreted_then_only_missing_contexts_are_missing() {
        assert_eq!(
            ContextLookup::from_output(&CommandOutput::ok("unix:///var/run/bastion-docker.sock\n")),
            ContextLookup::Found {
                address: "unix:///var/run/bastion-docker.sock".to_string()
            }
        );
        assert!(matches!(
            ContextLookup::from_output(&CommandOutput::failed(
                1,
                "context \"bastion\": context not found: open /root/.docker/contexts/meta/x/meta.json: no such file or directory"
            )),
            ContextLookup::Missing { .. }
        ));
        assert!(matches!(
            ContextLookup::from_output(&CommandOutput::failed(TIMED_OUT_STATUS, "")),
            ContextLookup::Unavailable {
                kind: ErrorKind::Timeout,
                ..
            }
        ));
        assert!(matches!(
            ContextLookup::from_output(&CommandOutput::failed(
                1,
                "open /root/.docker/config.json: permission denied"
            )),
            ContextLookup::Unavailable {
                kind: ErrorKind::PermissionDenied,
                ..
            }
        ));
    }

    #[test]
    fn endpoint_address_distinguishes_sockets() {
        assert_eq!(
            EndpointAddress::parse("unix:///var/run/bastion-docker.sock"),
            EndpointAddress::Socket(PathBuf::from("/var/run/bastion-docker.sock"))
        );
        assert_eq!(
            EndpointAddress::parse("ssh://ops@build-host"),
            EndpointAddress::Remote("ssh://ops@build-host".to_string())
        );
    }
}
