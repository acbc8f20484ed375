//! Pipeline configuration and execution
//!
//! A pipeline is a named DAG of agent steps loaded from a YAML document,
//! validated for cycles and unknown references, and executed as successive
//! step groups:
//!
//! - **sequential** steps run one after another in config order
//! - **parallel** steps run concurrently under a permit bound
//! - **iterative** steps run the generator/evaluator convergence loop
//!
//! # Example
//!
//! ```rust,ignore
//! use atelier::pipeline::{PipelineConfig, PipelineEngine};
//!
//! let config = PipelineConfig::from_file("pipelines/default.yaml")?;
//! let plan = engine.initialize(&config)?;
//! let execution_id = engine.execute(plan, input, None).await?;
//! ```

pub mod config;
pub mod engine;
pub mod iterative;

// Re-exports
pub use config::{
    ExecutionMode, FailureStrategy, IterativeParams, PipelineConfig, PipelineLibrary, PipelineStep,
};
pub use engine::{PipelineEngine, PipelinePlan};
pub use iterative::IterativeLoop;
