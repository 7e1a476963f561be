use anyhow::Result;

use crate::host::CommandSpec;
use crate::step::{Criticality, ProvisioningStep, StepContext};

/// Binds the primary context to this platform's engine address.
pub struct CreateEndpoint;

impl CreateEndpoint {
    fn spec(ctx: &StepContext<'_>) -> Result<CommandSpec> {
        let name = &ctx.config.endpoint.primary;
        let expected = ctx.config.expected_address(ctx.facts.variant);
        Ok(match ctx.engine.context_address(name)? {
            Some(_) => ctx.engine.update_context_spec(name, &expected),
            None => ctx
                .engine
                .create_context_spec(name, &expected, &ctx.config.endpoint.description),
        })
    }
}

impl ProvisioningStep for CreateEndpoint {
    fn name(&self) -> &'static str {
        "create-endpoint"
    }

    fn description(&self) -> String {
        "primary endpoint points at the isolated engine".to_string()
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        let expected = ctx.config.expected_address(ctx.facts.variant);
        Ok(ctx.engine.context_address(&ctx.config.endpoint.primary)?.as_deref() == Some(expected.as_str()))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        let spec = Self::spec(ctx).unwrap_or_else(|_| {
            ctx.engine.create_context_spec(
                &ctx.config.endpoint.primary,
                &ctx.config.expected_address(ctx.facts.variant),
                &ctx.config.endpoint.description,
            )
        });
        vec![spec.display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.engine.apply(&Self::spec(ctx)?)?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "inspect the endpoint with: docker context inspect {}",
            ctx.config.endpoint.primary
        )
    }
}

/// Pre-pulls the image used by the verification workloads.
pub struct PullProbeImage;

impl ProvisioningStep for PullProbeImage {
    fn name(&self) -> &'static str {
        "pull-probe-image"
    }

    fn description(&self) -> String {
        "verification image is present".to_string()
    }

    fn criticality(&self) -> Criticality {
        Criticality::NonCritical
    }

    fn is_satisfied(&self, ctx: &StepContext<'_>) -> Result<bool> {
        Ok(ctx
            .engine
            .image_present(&ctx.config.endpoint.primary, &ctx.config.probe.image))
    }

    fn preview(&self, ctx: &StepContext<'_>) -> Vec<String> {
        vec![ctx
            .engine
            .pull_spec(&ctx.config.endpoint.primary, &ctx.config.probe.image)
            .display()]
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        ctx.engine
            .apply(&ctx.engine.pull_spec(&ctx.config.endpoint.primary, &ctx.config.probe.image))?;
        Ok(Vec::new())
    }

    fn remediation(&self, ctx: &StepContext<'_>) -> String {
        format!(
            "pull it manually: {}",
            ctx.engine
                .pull_spec(&ctx.config.endpoint.primary, &ctx.config.probe.image)
                .display()
        )
    }
}
