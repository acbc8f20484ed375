//! Error types for the atelier orchestration core

use thiserror::Error;

/// Result type alias for atelier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the atelier orchestration core
#[derive(Debug, Error)]
pub enum Error {
    /// An agent type name was registered twice
    #[error("duplicate agent type: {0}")]
    DuplicateAgent(String),

    /// The registered agent dependency graph contains a cycle
    #[error("circular agent dependency involving: {0}")]
    CircularDependency(String),

    /// A pipeline or dependency references an agent type that is not registered
    #[error("unknown agent type: {0}")]
    UnknownAgent(String),

    /// Pipeline or service configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The pipeline step graph contains a cycle
    #[error("cyclic pipeline step graph involving: {0}")]
    CyclicPipeline(String),

    /// A step's collaborator call failed or returned a failure
    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    /// A step exceeded its declared timeout
    #[error("step '{step}' timed out after {seconds}s")]
    StepTimeout { step: String, seconds: u64 },

    /// No execution record exists for the given id
    #[error("unknown execution: {0}")]
    UnknownExecution(String),

    /// No pipeline configuration exists for the given name
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// Execution was cancelled before reaching a natural terminal state
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    /// Outbound HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a step execution error
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error was caused by invalid configuration rather than a
    /// runtime failure. Configuration errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::CyclicPipeline(_)
                | Self::UnknownAgent(_)
                | Self::DuplicateAgent(_)
                | Self::CircularDependency(_)
        )
    }
}
