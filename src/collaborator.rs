//! Agent collaborator boundary
//!
//! The orchestration core never constructs prompts or calls models itself;
//! every agent is an external collaborator behind the [`Agent`] trait. The
//! core gives each call a [`ProcessContext`] (step name, iteration, prior
//! feedback) and consumes a uniform [`AgentReply`].

use crate::error::{Error, Result};
use crate::registry::AgentDescriptor;
use crate::types::CorrelationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Outcome of validating an input payload before processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputValidation {
    /// Whether the payload is acceptable at all
    pub is_valid: bool,
    /// Non-fatal problems with the payload
    pub warnings: Vec<String>,
    /// Phrasing hints for better results
    pub suggestions: Vec<String>,
}

impl InputValidation {
    /// A validation result with no findings
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Uniform reply from a collaborator call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    /// Whether the collaborator considers the call successful
    pub success: bool,
    /// Produced output (collaborator-defined shape)
    pub output: Value,
    /// Failure description when `success` is false
    pub error: Option<String>,
}

impl AgentReply {
    /// A successful reply carrying the given output
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// A failed reply with an error description
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Context handed to every collaborator call
#[derive(Debug, Clone)]
pub struct ProcessContext {
    /// Token linking this call to one pipeline execution
    pub correlation_id: CorrelationId,
    /// Step the call belongs to
    pub step: String,
    /// Iteration number inside an iterative loop (0 outside loops)
    pub iteration: u32,
    /// Rendered evaluator feedback from the prior iteration, if any
    pub feedback: Option<String>,
}

impl ProcessContext {
    /// Create a context for a plain (non-iterative) step
    pub fn new(correlation_id: CorrelationId, step: impl Into<String>) -> Self {
        Self {
            correlation_id,
            step: step.into(),
            iteration: 0,
            feedback: None,
        }
    }

    /// Set the loop iteration number
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Attach rendered feedback from the previous iteration
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// The boundary every agent collaborator implements.
///
/// Instances cached by the registry are immutable after construction and may
/// be invoked concurrently by parallel steps.
#[async_trait]
pub trait Agent: Send + Sync + std::fmt::Debug {
    /// Metadata this agent was registered with
    fn descriptor(&self) -> &AgentDescriptor;

    /// Check an input payload before processing.
    ///
    /// The default applies the generic request heuristics to string payloads
    /// and accepts everything else.
    async fn validate_input(&self, payload: &Value) -> Result<InputValidation> {
        match payload.as_str() {
            Some(text) => Ok(appraise_request(text)),
            None => Ok(InputValidation::valid()),
        }
    }

    /// Process a payload and produce a reply
    async fn process(&self, payload: Value, ctx: &ProcessContext) -> Result<AgentReply>;
}

/// Heuristic appraisal of a free-text generation request.
///
/// Warns on empty/short/very long requests and suggests phrasing that tends
/// to produce better pipeline output.
pub fn appraise_request(input: &str) -> InputValidation {
    let mut result = InputValidation::valid();
    let trimmed = input.trim();

    if trimmed.is_empty() {
        result.is_valid = false;
        result.warnings.push("Input cannot be empty".to_string());
        return result;
    }
    if trimmed.len() < 10 {
        result.warnings.push(
            "Input is very short. Consider providing more details for better results.".to_string(),
        );
    }
    if input.len() > 5000 {
        result.warnings.push(
            "Input is very long. Consider breaking it down into smaller, more focused requests."
                .to_string(),
        );
    }

    let lower = input.to_lowercase();
    if !["create", "build", "develop"]
        .iter()
        .any(|w| lower.contains(w))
    {
        result.suggestions.push(
            "Consider starting with action words like 'Create', 'Build', or 'Develop' to clarify your intent."
                .to_string(),
        );
    }
    let tech_keywords = [
        "python", "rust", "web", "api", "database", "gui", "cli", "script", "application", "tool",
    ];
    if !tech_keywords.iter().any(|w| lower.contains(w)) {
        result.suggestions.push(
            "Consider mentioning the type of application or technology you want (e.g. web app, CLI tool, script)."
                .to_string(),
        );
    }
    if lower.split_whitespace().count() < 5 {
        result
            .suggestions
            .push("Provide more details about the functionality you want to implement.".to_string());
    }

    result
}

/// Collaborator adapter that forwards calls to an external agent service.
///
/// This is the production face of the boundary: the core posts the payload
/// and context to `<base>/agents/<type>/process` and maps the JSON reply
/// into an [`AgentReply`]. Transport errors surface as `Error::Http`;
/// collaborator-reported failures come back as unsuccessful replies so the
/// engine can apply the step's optional/required policy.
#[derive(Debug)]
pub struct RemoteAgent {
    descriptor: AgentDescriptor,
    endpoint: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl RemoteAgent {
    /// Create an adapter for the given descriptor against a collaborator base URL
    pub fn new(descriptor: AgentDescriptor, base_url: &Url) -> Result<Self> {
        let endpoint = base_url
            .join(&format!("agents/{}/process", descriptor.type_name))
            .map_err(|e| Error::config(format!("invalid collaborator URL: {e}")))?;
        Ok(Self {
            descriptor,
            endpoint,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(300),
        })
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(&self, payload: Value, ctx: &ProcessContext) -> Result<AgentReply> {
        let body = json!({
            "input_data": payload,
            "context": {
                "correlation_id": ctx.correlation_id,
                "step": ctx.step,
                "iteration": ctx.iteration,
                "feedback": ctx.feedback,
            },
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(AgentReply::failure(format!(
                "collaborator returned HTTP {status}"
            )));
        }

        // Collaborators reply with {success, result|output, error}; tolerate
        // bare payloads from minimal implementations.
        let reply: Value = response.json().await?;
        let success = reply
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let output = reply
            .get("result")
            .or_else(|| reply.get("output"))
            .cloned()
            .unwrap_or(reply.clone());
        let error = reply
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(AgentReply {
            success,
            output,
            error,
        })
    }
}
