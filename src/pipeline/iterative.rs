//! Iterative loop controller
//!
//! Runs the generator/evaluator convergence loop for one iterative step:
//! generate a draft, score it, and either accept (threshold reached), stop
//! (iteration cap), or feed the critique into the next generation. The loop
//! is best-effort by design: an evaluator failure ends it early with the
//! best draft obtained so far instead of failing the pipeline.

use crate::collaborator::{Agent, AgentReply, ProcessContext};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventType};
use crate::feedback::{IterationRecord, LoopOutcome, StructuredFeedback};
use crate::pipeline::config::IterativeParams;
use crate::types::CorrelationId;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

// {Generate, Evaluate, CheckThreshold, Done}; Generate always precedes
// Evaluate, so a draft exists whenever Evaluate runs.
enum LoopState {
    Generate,
    Evaluate,
    CheckThreshold,
    Done,
}

/// One configured generator/evaluator convergence loop
pub struct IterativeLoop {
    name: String,
    improver: Arc<dyn Agent>,
    evaluator: Arc<dyn Agent>,
    params: IterativeParams,
    bus: EventBus,
    correlation_id: CorrelationId,
}

impl IterativeLoop {
    /// Create a loop for one iterative step
    pub fn new(
        name: impl Into<String>,
        improver: Arc<dyn Agent>,
        evaluator: Arc<dyn Agent>,
        params: IterativeParams,
        bus: EventBus,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            name: name.into(),
            improver,
            evaluator,
            params,
            bus,
            correlation_id,
        }
    }

    /// Drive the loop to completion, seeded with the upstream result.
    ///
    /// Never performs more than `max_iterations` generator calls. Iteration
    /// N+1 starts only after iteration N's evaluation has completed.
    pub async fn run(&self, seed: Value) -> LoopOutcome {
        let loop_started = Instant::now();
        let mut state = LoopState::Generate;
        let mut iteration: u32 = 1;
        let mut iteration_started = Instant::now();

        let mut draft: Option<Value> = None;
        let mut feedback: Option<StructuredFeedback> = None;
        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut trend: Vec<f64> = Vec::new();
        let mut threshold_met = false;
        let mut evaluator_failed = false;

        tracing::info!(
            loop_name = %self.name,
            max_iterations = self.params.max_iterations,
            quality_threshold = self.params.quality_threshold,
            "starting iterative loop"
        );

        loop {
            match state {
                LoopState::Generate => {
                    iteration_started = Instant::now();
                    let improver_name = self.improver.descriptor().name.clone();
                    self.publish_call(EventType::AgentStarted, &improver_name, iteration);

                    let input = match (&draft, &feedback) {
                        (Some(current), Some(prior)) => json!({
                            "original_request": seed,
                            "current_draft": current,
                            "feedback": prior.render_for_agent(),
                            "iteration": iteration,
                        }),
                        _ => seed.clone(),
                    };
                    let mut ctx = ProcessContext::new(self.correlation_id.clone(), &self.name)
                        .with_iteration(iteration);
                    if let Some(prior) = &feedback {
                        ctx = ctx.with_feedback(prior.render_for_agent());
                    }

                    match self.call(&self.improver, input, &ctx).await {
                        Ok(reply) if reply.success => {
                            self.publish_call(EventType::AgentCompleted, &improver_name, iteration);
                            draft = Some(reply.output);
                            state = LoopState::Evaluate;
                        }
                        Ok(reply) => {
                            let reason = reply
                                .error
                                .unwrap_or_else(|| "generator returned failure".to_string());
                            self.publish_call(EventType::AgentFailed, &improver_name, iteration);
                            tracing::warn!(loop_name = %self.name, iteration, %reason, "generator failed");
                            iterations.push(self.failed_iteration(
                                iteration,
                                draft.clone(),
                                reason,
                                iteration_started,
                            ));
                            state = LoopState::Done;
                        }
                        Err(e) => {
                            self.publish_call(EventType::AgentFailed, &improver_name, iteration);
                            tracing::warn!(loop_name = %self.name, iteration, error = %e, "generator call failed");
                            iterations.push(self.failed_iteration(
                                iteration,
                                draft.clone(),
                                e.to_string(),
                                iteration_started,
                            ));
                            state = LoopState::Done;
                        }
                    }
                }
                LoopState::Evaluate => {
                    let evaluator_name = self.evaluator.descriptor().name.clone();
                    self.publish_call(EventType::AgentStarted, &evaluator_name, iteration);

                    let current = draft.clone().unwrap_or(Value::Null);
                    let input = json!({
                        "draft": current,
                        "iteration": iteration,
                        "previous_score": feedback.as_ref().map(|f| f.quality_score),
                    });
                    let ctx = ProcessContext::new(self.correlation_id.clone(), &self.name)
                        .with_iteration(iteration);

                    match self.call(&self.evaluator, input, &ctx).await {
                        Ok(reply) if reply.success => {
                            self.publish_call(EventType::AgentCompleted, &evaluator_name, iteration);
                            let parsed = StructuredFeedback::from_value(
                                &reply.output,
                                iteration,
                                &evaluator_name,
                            );
                            trend.push(parsed.quality_score);
                            iterations.push(IterationRecord {
                                iteration,
                                output: draft.clone(),
                                feedback: Some(parsed.clone()),
                                duration_ms: iteration_started.elapsed().as_millis() as u64,
                                success: true,
                                error: None,
                            });
                            tracing::info!(
                                loop_name = %self.name,
                                iteration,
                                quality_score = parsed.quality_score,
                                "iteration evaluated"
                            );
                            feedback = Some(parsed);
                            state = LoopState::CheckThreshold;
                        }
                        Ok(reply) => {
                            let reason = reply
                                .error
                                .unwrap_or_else(|| "evaluator returned failure".to_string());
                            self.publish_call(EventType::AgentFailed, &evaluator_name, iteration);
                            tracing::warn!(loop_name = %self.name, iteration, %reason, "evaluator failed, keeping best draft");
                            evaluator_failed = true;
                            iterations.push(self.failed_iteration(
                                iteration,
                                draft.clone(),
                                format!("evaluator failed: {reason}"),
                                iteration_started,
                            ));
                            state = LoopState::Done;
                        }
                        Err(e) => {
                            self.publish_call(EventType::AgentFailed, &evaluator_name, iteration);
                            tracing::warn!(loop_name = %self.name, iteration, error = %e, "evaluator call failed, keeping best draft");
                            evaluator_failed = true;
                            iterations.push(self.failed_iteration(
                                iteration,
                                draft.clone(),
                                format!("evaluator failed: {e}"),
                                iteration_started,
                            ));
                            state = LoopState::Done;
                        }
                    }
                }
                LoopState::CheckThreshold => {
                    let score = feedback.as_ref().map(|f| f.quality_score).unwrap_or(0.0);
                    if score >= self.params.quality_threshold {
                        threshold_met = true;
                        state = LoopState::Done;
                    } else if iteration >= self.params.max_iterations {
                        state = LoopState::Done;
                    } else {
                        iteration += 1;
                        state = LoopState::Generate;
                    }
                }
                LoopState::Done => break,
            }
        }

        let final_quality_score = trend.last().copied().unwrap_or(0.0);
        tracing::info!(
            loop_name = %self.name,
            total_iterations = iterations.len(),
            final_quality_score,
            threshold_met,
            evaluator_failed,
            "iterative loop finished"
        );

        LoopOutcome {
            loop_name: self.name.clone(),
            total_iterations: iterations.len() as u32,
            final_quality_score,
            quality_threshold: self.params.quality_threshold,
            threshold_met,
            evaluator_failed,
            iterations,
            final_output: draft,
            total_duration_ms: loop_started.elapsed().as_millis() as u64,
            trend,
        }
    }

    // Collaborator call with the per-iteration timeout applied.
    async fn call(
        &self,
        agent: &Arc<dyn Agent>,
        payload: Value,
        ctx: &ProcessContext,
    ) -> Result<AgentReply> {
        let limit = Duration::from_secs(self.params.timeout_per_iteration);
        match tokio::time::timeout(limit, agent.process(payload, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::StepTimeout {
                step: self.name.clone(),
                seconds: self.params.timeout_per_iteration,
            }),
        }
    }

    fn failed_iteration(
        &self,
        iteration: u32,
        output: Option<Value>,
        error: String,
        started: Instant,
    ) -> IterationRecord {
        IterationRecord {
            iteration,
            output,
            feedback: None,
            duration_ms: started.elapsed().as_millis() as u64,
            success: false,
            error: Some(error),
        }
    }

    fn publish_call(&self, event_type: EventType, agent_name: &str, iteration: u32) {
        self.bus.publish(
            Event::new(event_type, agent_name)
                .with_payload(json!({ "step": self.name, "iteration": iteration }))
                .with_correlation(self.correlation_id.clone()),
        );
    }
}
