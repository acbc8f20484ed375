//! Built-in agent catalog
//!
//! The stock agent set is registered through an explicit call list rather
//! than runtime discovery: one descriptor plus a factory per type. The
//! production factories build [`RemoteAgent`]s against the configured
//! collaborator service; embedders with in-process agents register their
//! own factories instead.

use crate::collaborator::{Agent, RemoteAgent};
use crate::error::Result;
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::types::ConfigClass;
use std::sync::Arc;
use url::Url;

/// Descriptors of the stock agent set used by the default pipeline
pub fn builtin_descriptors() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("requirements_analyst", "Requirements Analyst")
            .with_description("Extracts concrete requirements from a natural-language request")
            .with_capabilities(["requirements_analysis", "scope_definition"]),
        AgentDescriptor::new("solution_architect", "Solution Architect")
            .with_description("Designs the component structure for the analyzed requirements")
            .with_capabilities(["architecture_design", "technology_selection"])
            .with_dependencies(["requirements_analyst"]),
        AgentDescriptor::new("code_generator", "Code Generator")
            .with_description("Produces and revises code drafts from the architecture")
            .with_capabilities(["code_generation", "refactoring"])
            .with_config_class(ConfigClass::Coding)
            .with_dependencies(["solution_architect"]),
        AgentDescriptor::new("code_reviewer", "Code Reviewer")
            .with_description("Scores drafts and produces structured feedback")
            .with_capabilities(["code_review", "quality_scoring"])
            .with_config_class(ConfigClass::Review)
            .with_dependencies(["code_generator"]),
        AgentDescriptor::new("documentation_writer", "Documentation Writer")
            .with_description("Writes user-facing documentation for the generated artifact")
            .with_capabilities(["documentation"])
            .with_config_class(ConfigClass::Creative)
            .with_dependencies(["code_generator"]),
    ]
}

/// Register the stock agent set against a collaborator service base URL
pub fn register_builtin_agents(registry: &AgentRegistry, collaborator_url: &Url) -> Result<()> {
    for descriptor in builtin_descriptors() {
        let base = collaborator_url.clone();
        let template = descriptor.clone();
        registry.register(descriptor, move |_class| {
            Ok(Arc::new(RemoteAgent::new(template.clone(), &base)?) as Arc<dyn Agent>)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_registers_and_resolves() {
        let registry = AgentRegistry::new();
        let url = Url::parse("http://localhost:8600/v1/").unwrap();
        register_builtin_agents(&registry, &url).unwrap();

        assert_eq!(registry.len(), 5);
        let order = registry.resolve_order().unwrap();
        let index = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(index("requirements_analyst") < index("solution_architect"));
        assert!(index("solution_architect") < index("code_generator"));
        assert!(index("code_generator") < index("code_reviewer"));
    }

    #[test]
    fn builtin_set_covers_the_default_pipeline() {
        let registry = AgentRegistry::new();
        let url = Url::parse("http://localhost:8600/v1/").unwrap();
        register_builtin_agents(&registry, &url).unwrap();

        let config = crate::pipeline::PipelineConfig::builtin_default();
        for step in &config.steps {
            if let Some(params) = &step.iterative {
                assert!(registry.contains(&params.improver_agent));
                assert!(registry.contains(&params.evaluator_agent));
            } else {
                assert!(registry.contains(&step.agent_type));
            }
        }
    }
}
