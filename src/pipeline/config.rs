//! Pipeline configuration parsing from YAML documents
//!
//! A document names its steps, their execution modes, prerequisites, and
//! timeouts. Validation happens once, before execution: cyclic prerequisite
//! graphs, unknown references, and malformed iterative blocks are rejected
//! here and never surface at run time.

use crate::error::{Error, Result};
use crate::types::ConfigClass;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How the steps of one group are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One after another, in config order
    #[default]
    Sequential,
    /// Concurrently, bounded by `max_parallel_steps`
    Parallel,
    /// Through the generator/evaluator convergence loop
    Iterative,
}

/// How a required-step failure is handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Abort the pipeline, skipping all remaining groups
    #[default]
    Stop,
    /// Keep executing independent steps; the run still ends `failed`
    Continue,
}

/// Parameters of an iterative step's convergence loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterativeParams {
    /// Agent that generates/improves the draft
    pub improver_agent: String,
    /// Agent that scores the draft
    pub evaluator_agent: String,
    /// Hard cap on generate/evaluate cycles
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Score (0-100) at which the loop accepts a draft
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Per-collaborator-call timeout in seconds
    #[serde(default = "default_iteration_timeout")]
    pub timeout_per_iteration: u64,
}

fn default_max_iterations() -> u32 {
    3
}
fn default_quality_threshold() -> f64 {
    85.0
}
fn default_iteration_timeout() -> u64 {
    300
}

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Agent type to invoke; also the step's name
    pub agent_type: String,
    /// Configuration class for the collaborator instance
    #[serde(default)]
    pub config_type: ConfigClass,
    /// Execution mode
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Step names that must be terminal before this step becomes ready
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether a failure of this step is tolerated
    #[serde(default)]
    pub optional: bool,
    /// Step timeout in seconds
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// Loop parameters; present only when `execution_mode: iterative`
    #[serde(default, rename = "iterative_config", skip_serializing_if = "Option::is_none")]
    pub iterative: Option<IterativeParams>,
}

fn default_step_timeout() -> u64 {
    300
}

impl PipelineStep {
    /// Whether this step runs the convergence loop
    pub fn is_iterative(&self) -> bool {
        self.execution_mode == ExecutionMode::Iterative
    }

    /// The step's name (identical to its agent type)
    pub fn name(&self) -> &str {
        &self.agent_type
    }
}

/// A declarative DAG of agent steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, referenced by the execute/initialize routes
    pub name: String,
    /// What the pipeline produces
    #[serde(default)]
    pub description: String,
    /// Whole-run timeout in seconds
    #[serde(default = "default_global_timeout")]
    pub global_timeout_seconds: u64,
    /// Concurrency bound for parallel steps
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,
    /// Required-step failure handling
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Ordered step list
    pub steps: Vec<PipelineStep>,
}

fn default_global_timeout() -> u64 {
    1800
}
fn default_max_parallel() -> usize {
    4
}

impl PipelineConfig {
    /// Load a configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("failed to parse pipeline document: {e}")))
    }

    /// Load a configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read pipeline document {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.agent_type == name)
    }

    /// Check the document for structural problems.
    ///
    /// Rejects empty pipelines, duplicate step names, unknown prerequisite
    /// references, malformed iterative blocks, and cyclic step graphs.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::config(format!("pipeline '{}' has no steps", self.name)));
        }
        if self.max_parallel_steps == 0 {
            return Err(Error::config("max_parallel_steps must be at least 1"));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.agent_type.as_str()) {
                return Err(Error::config(format!(
                    "duplicate step name '{}' in pipeline '{}'",
                    step.agent_type, self.name
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(Error::config(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.agent_type, dep
                    )));
                }
            }
            match (step.execution_mode, &step.iterative) {
                (ExecutionMode::Iterative, None) => {
                    return Err(Error::config(format!(
                        "iterative step '{}' is missing its iterative_config block",
                        step.agent_type
                    )));
                }
                (ExecutionMode::Iterative, Some(params)) => {
                    if params.max_iterations == 0 {
                        return Err(Error::config(format!(
                            "iterative step '{}' must allow at least one iteration",
                            step.agent_type
                        )));
                    }
                    if !(0.0..=100.0).contains(&params.quality_threshold) {
                        return Err(Error::config(format!(
                            "iterative step '{}' has quality_threshold outside 0-100",
                            step.agent_type
                        )));
                    }
                }
                (_, Some(_)) => {
                    return Err(Error::config(format!(
                        "step '{}' carries an iterative_config block but is not iterative",
                        step.agent_type
                    )));
                }
                _ => {}
            }
        }

        self.check_cycles()
    }

    // DFS with a visiting marker over the prerequisite edges.
    fn check_cycles(&self) -> Result<()> {
        let by_name: HashMap<&str, &PipelineStep> =
            self.steps.iter().map(|s| (s.agent_type.as_str(), s)).collect();

        fn visit<'a>(
            name: &'a str,
            by_name: &HashMap<&'a str, &'a PipelineStep>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if visited.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(Error::CyclicPipeline(name.to_string()));
            }
            if let Some(step) = by_name.get(name) {
                for dep in &step.depends_on {
                    visit(dep.as_str(), by_name, visiting, visited)?;
                }
            }
            visiting.remove(name);
            visited.insert(name);
            Ok(())
        }

        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        for step in &self.steps {
            visit(step.agent_type.as_str(), &by_name, &mut visiting, &mut visited)?;
        }
        Ok(())
    }

    /// The maximal set of steps eligible to run now: not yet scheduled, with
    /// every prerequisite in the satisfied set. Config order is preserved.
    pub fn ready_steps<'a>(
        &'a self,
        satisfied: &HashSet<String>,
        scheduled: &HashSet<String>,
    ) -> Vec<&'a PipelineStep> {
        self.steps
            .iter()
            .filter(|s| !scheduled.contains(s.agent_type.as_str()))
            .filter(|s| s.depends_on.iter().all(|d| satisfied.contains(d)))
            .collect()
    }

    /// Static preview of the step groups assuming every step completes.
    ///
    /// Used by the info routes; the engine recomputes readiness after every
    /// group instead of trusting this preview.
    pub fn execution_order(&self) -> Vec<Vec<String>> {
        let mut groups = Vec::new();
        let mut satisfied = HashSet::new();
        let mut scheduled = HashSet::new();

        loop {
            let ready: Vec<String> = self
                .ready_steps(&satisfied, &scheduled)
                .iter()
                .map(|s| s.agent_type.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for name in &ready {
                scheduled.insert(name.clone());
                satisfied.insert(name.clone());
            }
            groups.push(ready);
        }
        groups
    }

    /// The built-in `default` artifact-generation pipeline
    pub fn builtin_default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Requirements analysis, architecture, iterative code generation, and documentation"
                .to_string(),
            global_timeout_seconds: default_global_timeout(),
            max_parallel_steps: default_max_parallel(),
            failure_strategy: FailureStrategy::Stop,
            steps: vec![
                PipelineStep {
                    agent_type: "requirements_analyst".to_string(),
                    config_type: ConfigClass::Standard,
                    execution_mode: ExecutionMode::Sequential,
                    depends_on: vec![],
                    optional: false,
                    timeout_seconds: 180,
                    iterative: None,
                },
                PipelineStep {
                    agent_type: "solution_architect".to_string(),
                    config_type: ConfigClass::Standard,
                    execution_mode: ExecutionMode::Sequential,
                    depends_on: vec!["requirements_analyst".to_string()],
                    optional: false,
                    timeout_seconds: 240,
                    iterative: None,
                },
                PipelineStep {
                    agent_type: "code_generation".to_string(),
                    config_type: ConfigClass::Coding,
                    execution_mode: ExecutionMode::Iterative,
                    depends_on: vec!["solution_architect".to_string()],
                    optional: false,
                    timeout_seconds: 1200,
                    iterative: Some(IterativeParams {
                        improver_agent: "code_generator".to_string(),
                        evaluator_agent: "code_reviewer".to_string(),
                        max_iterations: 3,
                        quality_threshold: 85.0,
                        timeout_per_iteration: 300,
                    }),
                },
                PipelineStep {
                    agent_type: "documentation_writer".to_string(),
                    config_type: ConfigClass::Creative,
                    execution_mode: ExecutionMode::Parallel,
                    depends_on: vec!["code_generation".to_string()],
                    optional: true,
                    timeout_seconds: 240,
                    iterative: None,
                },
            ],
        }
    }
}

/// Named pipeline configurations available to the HTTP surface
pub struct PipelineLibrary {
    configs: RwLock<HashMap<String, PipelineConfig>>,
}

impl PipelineLibrary {
    /// Create an empty library
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a library seeded with the built-in default pipeline
    pub fn with_builtin_default() -> Self {
        let library = Self::new();
        library
            .configs
            .write()
            .insert("default".to_string(), PipelineConfig::builtin_default());
        library
    }

    /// Validate and insert a configuration, replacing any previous one of
    /// the same name
    pub fn insert(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.configs.write().insert(config.name.clone(), config);
        Ok(())
    }

    /// Load every `*.yaml`/`*.yml` document in a directory
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let config = PipelineConfig::from_file(&path)?;
            tracing::info!(pipeline = %config.name, path = %path.display(), "loaded pipeline document");
            self.insert(config)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Configuration by name
    pub fn get(&self, name: &str) -> Option<PipelineConfig> {
        self.configs.read().get(name).cloned()
    }

    /// All known pipeline names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PipelineLibrary {
    fn default() -> Self {
        Self::new()
    }
}
