//! # Atelier
//!
//! A single-process orchestration core that generates software artifacts by
//! driving a configurable DAG of AI agents. The agents themselves are
//! external collaborators behind one trait; this crate owns the hard part:
//! dependency resolution, step-group scheduling, the generator/evaluator
//! convergence loop, and real-time progress streaming.
//!
//! ## Components
//!
//! - [`registry`]: agent descriptors, explicit factory registration,
//!   dependency-ordered resolution, cached collaborator handles
//! - [`pipeline`]: YAML pipeline documents, validation, the step-group
//!   execution engine, and the iterative loop controller
//! - [`events`]: typed publish/subscribe bus with bounded history
//! - [`store`]: execution records with snapshot and streaming access
//! - [`http`]: the axum surface for initialize, execute, status, and streaming
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use atelier::pipeline::{PipelineConfig, PipelineEngine, PipelineLibrary};
//! use atelier::registry::AgentRegistry;
//! use atelier::store::ExecutionStore;
//! use atelier::events::EventBus;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(AgentRegistry::new());
//!     // register agent factories here...
//!
//!     let engine = PipelineEngine::new(
//!         registry,
//!         Arc::new(ExecutionStore::new()),
//!         EventBus::new(),
//!     );
//!     let plan = engine.initialize(&PipelineConfig::builtin_default())?;
//!     let id = engine.execute(plan, serde_json::json!("build a CLI tool"), None);
//!     println!("execution {id} started");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtin;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod events;
pub mod feedback;
pub mod http;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use collaborator::{Agent, AgentReply, InputValidation, ProcessContext};
pub use error::{Error, Result};
pub use events::{Event, EventBus, EventType};
pub use feedback::{LoopOutcome, StructuredFeedback};
pub use pipeline::{
    ExecutionMode, FailureStrategy, PipelineConfig, PipelineEngine, PipelineLibrary,
};
pub use registry::{AgentDescriptor, AgentRegistry};
pub use store::{ExecutionRecord, ExecutionStore, StreamFrame};
pub use types::{ConfigClass, CorrelationId, ExecutionId, ExecutionStatus, StepState};
