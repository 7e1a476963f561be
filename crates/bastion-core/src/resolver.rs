//! Selection of the endpoint workloads should be sent to.
//!
//! Precedence is fixed: execution context first, then an explicit override,
//! then the primary endpoint, then the legacy one. Every probe attempt is kept
//! so a caller can explain a `NotFound`.

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::config::BastionConfig;
use crate::engine::EngineCli;
use crate::host::Host;
use crate::platform::{ExecutionContext, HostFacts, PlatformVariant};
use crate::probe::{AvailabilityProbe, ProbeOptions, ProbeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionSource {
    /// Running inside an isolated workload; the surrounding engine is used as-is.
    NestedWorkload,
    Containerized,
    Override,
    Primary,
    Legacy,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResolutionSource::NestedWorkload => "nested isolated workload",
            ResolutionSource::Containerized => "containerized",
            ResolutionSource::Override => "override",
            ResolutionSource::Primary => "primary",
            ResolutionSource::Legacy => "legacy",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Resolution {
    Endpoint {
        name: String,
        source: ResolutionSource,
        warnings: Vec<String>,
    },
    NotFound {
        attempts: Vec<ProbeResult>,
        warnings: Vec<String>,
    },
}

impl Resolution {
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Resolution::Endpoint { name, .. } => Some(name),
            Resolution::NotFound { .. } => None,
        }
    }

    pub fn source(&self) -> Option<ResolutionSource> {
        match self {
            Resolution::Endpoint { source, .. } => Some(*source),
            Resolution::NotFound { .. } => None,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Resolution::Endpoint { warnings, .. } | Resolution::NotFound { warnings, .. } => warnings,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Endpoint { .. })
    }
}

pub struct EndpointResolver<'a> {
    engine: EngineCli<'a>,
    probe: AvailabilityProbe<'a>,
    config: &'a BastionConfig,
    facts: HostFacts,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(host: &'a dyn Host, config: &'a BastionConfig, facts: HostFacts) -> Self {
        let engine = EngineCli::new(host, config.probe.timeout(), config.probe.workload_timeout());
        let options = ProbeOptions {
            runtime: config.runtime.name.clone(),
            require_runtime: true,
        };
        Self {
            engine,
            probe: AvailabilityProbe::new(host, engine, options),
            config,
            facts,
        }
    }

    /// Resolve, taking the override from `BASTION_CONTEXT` when none is passed.
    pub fn resolve_with_env(&self, override_name: Option<&str>) -> Resolution {
        let from_env = BastionConfig::context_override_from_env();
        self.resolve(override_name.or(from_env.as_deref()))
    }

    #[instrument(skip(self), fields(variant = %self.facts.variant, context = ?self.facts.context))]
    pub fn resolve(&self, override_name: Option<&str>) -> Resolution {
        let endpoints = &self.config.endpoint;
        match self.facts.context {
            ExecutionContext::IsolatedWorkload => {
                debug!("inside an isolated workload, using the local endpoint");
                return found(&endpoints.default_local, ResolutionSource::NestedWorkload, Vec::new());
            }
            ExecutionContext::GenericContainer => {
                return found(&endpoints.default_local, ResolutionSource::Containerized, Vec::new());
            }
            ExecutionContext::Host => {}
        }

        let mut warnings = Vec::new();
        let mut attempts = Vec::new();

        if self.facts.variant != PlatformVariant::Containerized {
            if let Some(warning) = self.repair_primary_address() {
                warnings.push(warning);
            }
        }

        if let Some(name) = override_name {
            let result = self.probe.check(name);
            warnings.extend(result.warnings().iter().cloned());
            if result.is_available() {
                return found(name, ResolutionSource::Override, warnings);
            }
            let message = format!("override endpoint unavailable, falling back: {}", result);
            warn!("{}", message);
            warnings.push(message);
            attempts.push(result);
        }

        for (name, source) in [
            (&endpoints.primary, ResolutionSource::Primary),
            (&endpoints.legacy, ResolutionSource::Legacy),
        ] {
            let result = self.probe.check(name);
            warnings.extend(result.warnings().iter().cloned());
            if result.is_available() {
                return found(name, source, warnings);
            }
            debug!(endpoint = %name, result = %result, "endpoint unavailable");
            attempts.push(result);
        }

        Resolution::NotFound { attempts, warnings }
    }

    /// Point a drifted primary back at this platform's engine. Returns a warning
    /// when the repair was needed but failed.
    fn repair_primary_address(&self) -> Option<String> {
        let name = &self.config.endpoint.primary;
        let expected = self.config.expected_address(self.facts.variant);
        let current = match self.engine.context_address(name) {
            Ok(Some(address)) => address,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %format!("{:#}", err), "could not inspect primary endpoint");
                return None;
            }
        };
        if current == expected {
            return None;
        }

        match self.engine.apply(&self.engine.update_context_spec(name, &expected)) {
            Ok(()) => {
                info!(endpoint = %name, from = %current, to = %expected, "repaired endpoint address");
                None
            }
            Err(err) => {
                let message = format!("could not repair {} address ({}): {:#}", name, current, err);
                warn!("{}", message);
                Some(message)
            }
        }
    }
}

fn found(name: &str, source: ResolutionSource, warnings: Vec<String>) -> Resolution {
    info!(endpoint = name, %source, "resolved endpoint");
    Resolution::Endpoint {
        name: name.to_string(),
        source,
        warnings,
    }
}
