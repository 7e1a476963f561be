//! Availability probing of a named endpoint.
//!
//! A probe is read-only and never cached: host state can change between runs,
//! so every [`AvailabilityProbe::check`] produces a fresh [`ProbeResult`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::engine::{parse_info, ContextLookup, EndpointAddress, EngineCli};
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SocketNotFound,
    ContextNotFound,
    Timeout,
    PermissionDenied,
    ConnectionRefused,
    DaemonUnavailable,
    RuntimeNotFound,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::SocketNotFound => "socket not found",
            ErrorKind::ContextNotFound => "context not found",
            ErrorKind::Timeout => "timed out",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::DaemonUnavailable => "daemon unavailable",
            ErrorKind::RuntimeNotFound => "hardened runtime not registered",
            ErrorKind::Unknown => "unknown failure",
        };
        f.write_str(text)
    }
}

/// Phrases the engine CLI uses for a context that is not defined.
pub const CONTEXT_MISSING_PHRASES: &[&str] = &["context not found", "does not exist"];

/// Ordered classification table. The first row with a matching phrase wins.
const CLASSIFICATION_RULES: &[(&[&str], ErrorKind)] = &[
    (
        &["permission denied", "operation not permitted", "access denied"],
        ErrorKind::PermissionDenied,
    ),
    (&["connection refused"], ErrorKind::ConnectionRefused),
    (
        &[
            "cannot connect to the docker daemon",
            "is the docker daemon running",
            "error during connect",
            "daemon is not running",
            "no such file or directory",
        ],
        ErrorKind::DaemonUnavailable,
    ),
    (
        &["context deadline exceeded", "i/o timeout", "timed out"],
        ErrorKind::Timeout,
    ),
    (CONTEXT_MISSING_PHRASES, ErrorKind::ContextNotFound),
    (
        &["unknown or invalid runtime name", "unknown runtime"],
        ErrorKind::RuntimeNotFound,
    ),
];

/// Map a failed command's diagnostic text to exactly one [`ErrorKind`].
///
/// Total: unrecognized or empty text is [`ErrorKind::Unknown`], never "available".
pub fn classify(diagnostic: &str) -> ErrorKind {
    let text = diagnostic.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(phrases, _)| phrases.iter().any(|p| text.contains(p)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    endpoint: String,
    address: Option<String>,
    available: bool,
    #[serde(rename = "errorKind")]
    error: Option<ErrorKind>,
    diagnostic: String,
    warnings: Vec<String>,
}

impl ProbeResult {
    fn available(endpoint: &str, address: String, diagnostic: String) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            address: Some(address),
            available: true,
            error: None,
            diagnostic,
            warnings: Vec::new(),
        }
    }

    fn failed(
        endpoint: &str,
        address: Option<String>,
        kind: ErrorKind,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            address,
            available: false,
            error: Some(kind),
            diagnostic: diagnostic.into(),
            warnings: Vec::new(),
        }
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            None => write!(f, "{}: available", self.endpoint),
            Some(kind) if self.diagnostic.is_empty() => write!(f, "{}: {}", self.endpoint, kind),
            Some(kind) => write!(f, "{}: {} ({})", self.endpoint, kind, self.diagnostic),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Hardened runtime that must appear in the engine's runtime list.
    pub runtime: String,
    /// Callers running under an outer isolation layer opt out of the capability check.
    pub require_runtime: bool,
}

pub struct AvailabilityProbe<'a> {
    host: &'a dyn Host,
    engine: EngineCli<'a>,
    options: ProbeOptions,
}

impl<'a> AvailabilityProbe<'a> {
    pub fn new(host: &'a dyn Host, engine: EngineCli<'a>, options: ProbeOptions) -> Self {
        Self {
            host,
            engine,
            options,
        }
    }

    pub fn without_capability_check(&self) -> AvailabilityProbe<'a> {
        AvailabilityProbe {
            host: self.host,
            engine: self.engine,
            options: ProbeOptions {
                require_runtime: false,
                ..self.options.clone()
            },
        }
    }

    #[instrument(skip(self))]
    pub fn check(&self, name: &str) -> ProbeResult {
        let address = match self.engine.inspect_context(name) {
            Ok(ContextLookup::Found { address }) => address,
            Ok(ContextLookup::Missing { diagnostic }) => {
                return ProbeResult::failed(name, None, ErrorKind::ContextNotFound, diagnostic)
            }
            Ok(ContextLookup::Unavailable { kind, diagnostic }) => {
                return ProbeResult::failed(name, None, kind, diagnostic)
            }
            Err(err) => {
                return ProbeResult::failed(name, None, ErrorKind::Unknown, format!("{:#}", err))
            }
        };

        if let EndpointAddress::Socket(path) = EndpointAddress::parse(&address) {
            if !self.host.path_exists(&path) {
                return ProbeResult::failed(
                    name,
                    Some(address.clone()),
                    ErrorKind::SocketNotFound,
                    format!("socket {} does not exist", path.display()),
                );
            }
        }

        self.query_info(name, address)
    }

    fn query_info(&self, name: &str, address: String) -> ProbeResult {
        let mut warnings = Vec::new();
        let spec = self.engine.info_spec(name);

        let mut output = match self.engine.execute(&spec) {
            Ok(output) => output,
            Err(err) => {
                return ProbeResult::failed(name, Some(address), ErrorKind::Unknown, format!("{:#}", err))
            }
        };

        if output.timeout_unavailable() {
            let message = format!(
                "no timeout mechanism available; re-running `{}` without a bound",
                spec.display()
            );
            warn!("{}", message);
            warnings.push(message);
            output = match self.engine.execute(&spec.clone().unbounded()) {
                Ok(output) => output,
                Err(err) => {
                    return ProbeResult::failed(
                        name,
                        Some(address),
                        ErrorKind::Unknown,
                        format!("{:#}", err),
                    )
                    .with_warnings(warnings)
                }
            };
        }

        if output.timed_out() {
            return ProbeResult::failed(
                name,
                Some(address),
                ErrorKind::Timeout,
                format!("`{}` did not answer in time", spec.display()),
            )
            .with_warnings(warnings);
        }

        if !output.success() {
            let diagnostic = output.diagnostic();
            let kind = classify(&diagnostic);
            debug!(?kind, "info call failed");
            return ProbeResult::failed(name, Some(address), kind, diagnostic).with_warnings(warnings);
        }

        let info = match parse_info(&output.stdout) {
            Ok(info) => info,
            Err(err) => {
                return ProbeResult::failed(
                    name,
                    Some(address),
                    ErrorKind::Unknown,
                    format!("{:#}: {}", err, output.diagnostic()),
                )
                .with_warnings(warnings)
            }
        };

        if !info.server_errors.is_empty() {
            let diagnostic = info.server_errors.join("; ");
            let kind = classify(&diagnostic);
            return ProbeResult::failed(name, Some(address), kind, diagnostic).with_warnings(warnings);
        }

        if self.options.require_runtime && !info.has_runtime(&self.options.runtime) {
            return ProbeResult::failed(
                name,
                Some(address),
                ErrorKind::RuntimeNotFound,
                format!(
                    "runtime '{}' not registered (available: {})",
                    self.options.runtime,
                    info.runtimes.join(", ")
                ),
            )
            .with_warnings(warnings);
        }

        let diagnostic = match &info.default_runtime {
            Some(default) => format!("default runtime {}", default),
            None => String::new(),
        };
        ProbeResult::available(name, address, diagnostic).with_warnings(warnings)
    }
}
