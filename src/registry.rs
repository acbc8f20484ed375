//! Agent registry and dependency resolver
//!
//! Agents are registered explicitly at process start through a static call
//! list: one [`AgentDescriptor`] plus a factory closure per type. The
//! registry orders types so every agent appears after its declared
//! dependencies and hands out cached collaborator instances per
//! `(type, config class)` pair.

use crate::collaborator::Agent;
use crate::error::{Error, Result};
use crate::types::ConfigClass;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable metadata describing one agent type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Machine name used in pipeline documents and dependency lists
    pub type_name: String,
    /// Human-readable name for events and progress display
    pub name: String,
    /// What this agent does
    pub description: String,
    /// Capability tags exposed through the capabilities route
    pub capabilities: Vec<String>,
    /// Configuration class instances default to
    pub config_class: ConfigClass,
    /// Agent type names this agent depends on
    pub dependencies: Vec<String>,
    /// Semantic version of the collaborator contract
    pub version: String,
}

impl AgentDescriptor {
    /// Create a descriptor with the mandatory fields
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            config_class: ConfigClass::Standard,
            dependencies: Vec::new(),
            version: "1.0.0".to_string(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the capability tags
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default configuration class
    pub fn with_config_class(mut self, config_class: ConfigClass) -> Self {
        self.config_class = config_class;
        self
    }

    /// Set the declared dependencies
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Set the contract version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Factory constructing a collaborator instance for a configuration class
pub type AgentFactory = Arc<dyn Fn(ConfigClass) -> Result<Arc<dyn Agent>> + Send + Sync>;

struct RegistryEntry {
    descriptor: AgentDescriptor,
    factory: AgentFactory,
}

/// Registry of agent types with dependency resolution and instance caching
pub struct AgentRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    // registration order keeps resolve_order and listings deterministic
    order: RwLock<Vec<String>>,
    instances: DashMap<(String, ConfigClass), Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            instances: DashMap::new(),
        }
    }

    /// Register an agent type with its factory.
    ///
    /// Fails with [`Error::DuplicateAgent`] if the type name already exists.
    pub fn register<F>(&self, descriptor: AgentDescriptor, factory: F) -> Result<()>
    where
        F: Fn(ConfigClass) -> Result<Arc<dyn Agent>> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        if entries.contains_key(&descriptor.type_name) {
            return Err(Error::DuplicateAgent(descriptor.type_name.clone()));
        }
        self.order.write().push(descriptor.type_name.clone());
        entries.insert(
            descriptor.type_name.clone(),
            RegistryEntry {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Whether a type name is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.read().contains_key(type_name)
    }

    /// Descriptor for one type, if registered
    pub fn descriptor(&self, type_name: &str) -> Option<AgentDescriptor> {
        self.entries
            .read()
            .get(type_name)
            .map(|e| e.descriptor.clone())
    }

    /// All descriptors in registration order
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let entries = self.entries.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| entries.get(name).map(|e| e.descriptor.clone()))
            .collect()
    }

    /// Number of registered agent types
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All registered type names ordered so that every name appears after
    /// all of its declared dependencies.
    ///
    /// Depth-first traversal with a "visiting" marker set: revisiting a node
    /// still marked visiting signals [`Error::CircularDependency`] naming
    /// the offending type. A declared dependency on an unregistered type is
    /// an [`Error::UnknownAgent`].
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let entries = self.entries.read();
        let order = self.order.read();

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut resolved = Vec::with_capacity(order.len());

        fn visit(
            name: &str,
            entries: &HashMap<String, RegistryEntry>,
            visiting: &mut HashSet<String>,
            visited: &mut HashSet<String>,
            resolved: &mut Vec<String>,
        ) -> Result<()> {
            if visited.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name.to_string()) {
                return Err(Error::CircularDependency(name.to_string()));
            }
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::UnknownAgent(name.to_string()))?;
            for dep in &entry.descriptor.dependencies {
                visit(dep, entries, visiting, visited, resolved)?;
            }
            visiting.remove(name);
            visited.insert(name.to_string());
            resolved.push(name.to_string());
            Ok(())
        }

        for name in order.iter() {
            visit(name, &entries, &mut visiting, &mut visited, &mut resolved)?;
        }
        Ok(resolved)
    }

    /// Cached collaborator handle for `(type, config class)`.
    ///
    /// The instance is constructed lazily on first request and shared by all
    /// later callers, so expensive collaborator setup happens once.
    pub fn instance(&self, type_name: &str, config_class: ConfigClass) -> Result<Arc<dyn Agent>> {
        let key = (type_name.to_string(), config_class);
        if let Some(handle) = self.instances.get(&key) {
            return Ok(handle.clone());
        }

        let factory = {
            let entries = self.entries.read();
            let entry = entries
                .get(type_name)
                .ok_or_else(|| Error::UnknownAgent(type_name.to_string()))?;
            entry.factory.clone()
        };
        let handle = factory(config_class)?;

        // A racing caller may have inserted first; keep whichever won.
        Ok(self.instances.entry(key).or_insert(handle).clone())
    }

    /// Drop all cached instances (descriptors stay registered)
    pub fn reset_instances(&self) {
        self.instances.clear();
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{AgentReply, ProcessContext};
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Debug)]
    struct StubAgent {
        descriptor: AgentDescriptor,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn process(&self, payload: Value, _ctx: &ProcessContext) -> Result<AgentReply> {
            Ok(AgentReply::ok(payload))
        }
    }

    fn stub_factory(descriptor: AgentDescriptor) -> impl Fn(ConfigClass) -> Result<Arc<dyn Agent>> {
        move |_class| {
            Ok(Arc::new(StubAgent {
                descriptor: descriptor.clone(),
            }) as Arc<dyn Agent>)
        }
    }

    fn register_stub(registry: &AgentRegistry, descriptor: AgentDescriptor) {
        let factory = stub_factory(descriptor.clone());
        registry.register(descriptor, factory).unwrap();
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = AgentRegistry::new();
        register_stub(&registry, AgentDescriptor::new("coder", "Coder"));
        let err = registry
            .register(AgentDescriptor::new("coder", "Coder Again"), |_| {
                unreachable!()
            })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAgent(name) if name == "coder"));
    }

    #[test]
    fn resolve_order_puts_dependencies_first() {
        let registry = AgentRegistry::new();
        register_stub(
            &registry,
            AgentDescriptor::new("writer", "Writer").with_dependencies(["architect"]),
        );
        register_stub(
            &registry,
            AgentDescriptor::new("architect", "Architect").with_dependencies(["analyst"]),
        );
        register_stub(&registry, AgentDescriptor::new("analyst", "Analyst"));

        let order = registry.resolve_order().unwrap();
        let index = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(index("analyst") < index("architect"));
        assert!(index("architect") < index("writer"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn circular_dependency_names_offending_type() {
        let registry = AgentRegistry::new();
        register_stub(
            &registry,
            AgentDescriptor::new("a", "A").with_dependencies(["b"]),
        );
        register_stub(
            &registry,
            AgentDescriptor::new("b", "B").with_dependencies(["a"]),
        );
        let err = registry.resolve_order().unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));
    }

    #[test]
    fn dependency_on_unregistered_type_fails() {
        let registry = AgentRegistry::new();
        register_stub(
            &registry,
            AgentDescriptor::new("a", "A").with_dependencies(["ghost"]),
        );
        let err = registry.resolve_order().unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(name) if name == "ghost"));
    }

    #[test]
    fn instances_are_cached_per_type_and_class() {
        let registry = AgentRegistry::new();
        register_stub(&registry, AgentDescriptor::new("coder", "Coder"));

        let first = registry.instance("coder", ConfigClass::Coding).unwrap();
        let second = registry.instance("coder", ConfigClass::Coding).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other_class = registry.instance("coder", ConfigClass::Review).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_class));
    }

    #[test]
    fn unknown_instance_request_fails() {
        let registry = AgentRegistry::new();
        let err = registry
            .instance("ghost", ConfigClass::Standard)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(_)));
    }
}
