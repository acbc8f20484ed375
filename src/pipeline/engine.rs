//! Pipeline execution engine
//!
//! Consumes a validated configuration plus an input payload and drives the
//! run group by group: after every group the ready set is recomputed, so a
//! step becomes eligible the moment its last prerequisite turns terminal.
//! The engine owns all mutation of the execution record and publishes
//! lifecycle events along the way.

use crate::collaborator::{Agent, ProcessContext};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventType};
use crate::persist::PersistClient;
use crate::pipeline::config::{ExecutionMode, FailureStrategy, PipelineConfig, PipelineStep};
use crate::pipeline::iterative::IterativeLoop;
use crate::registry::AgentRegistry;
use crate::store::{ExecutionRecord, ExecutionStore, StepProgress};
use crate::types::{ConfigClass, CorrelationId, ExecutionId, ExecutionStatus, StepState};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

/// A validated pipeline with all collaborator handles resolved up front
#[derive(Clone, Debug)]
pub struct PipelinePlan {
    config: PipelineConfig,
    agents: HashMap<(String, ConfigClass), Arc<dyn Agent>>,
}

impl PipelinePlan {
    /// The validated configuration behind this plan
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn agent(&self, type_name: &str, class: ConfigClass) -> Option<Arc<dyn Agent>> {
        self.agents.get(&(type_name.to_string(), class)).cloned()
    }
}

enum StepOutcome {
    Completed(Value),
    Failed(String),
}

enum Applied {
    Success(Value),
    OptionalFailure,
    RequiredFailure(String),
}

/// Executes validated pipelines against the registry, store, and event bus
#[derive(Clone)]
pub struct PipelineEngine {
    registry: Arc<AgentRegistry>,
    store: Arc<ExecutionStore>,
    bus: EventBus,
    persist: Option<Arc<PersistClient>>,
    cancellations: Arc<DashMap<ExecutionId, watch::Sender<Option<String>>>>,
}

impl PipelineEngine {
    /// Create an engine over the given registry, store, and bus
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<ExecutionStore>, bus: EventBus) -> Self {
        Self {
            registry,
            store,
            bus,
            persist: None,
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Archive completed records through the given client
    pub fn with_persist(mut self, persist: Arc<PersistClient>) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Validate a configuration against the registry and resolve every
    /// collaborator handle it needs.
    ///
    /// Fails with a configuration error (cycle, malformed iterative block)
    /// or [`Error::UnknownAgent`] when a step or its improver/evaluator
    /// references an unregistered type. `execute` is unreachable until this
    /// succeeds.
    pub fn initialize(&self, config: &PipelineConfig) -> Result<PipelinePlan> {
        config.validate()?;

        let mut agents = HashMap::new();
        for step in &config.steps {
            if let Some(params) = &step.iterative {
                let improver = self
                    .registry
                    .instance(&params.improver_agent, step.config_type)?;
                agents.insert(
                    (params.improver_agent.clone(), step.config_type),
                    improver,
                );
                // Evaluators always run under the review class.
                let evaluator = self
                    .registry
                    .instance(&params.evaluator_agent, ConfigClass::Review)?;
                agents.insert(
                    (params.evaluator_agent.clone(), ConfigClass::Review),
                    evaluator,
                );
            } else {
                let agent = self.registry.instance(&step.agent_type, step.config_type)?;
                agents.insert((step.agent_type.clone(), step.config_type), agent);
            }
        }

        tracing::info!(
            pipeline = %config.name,
            steps = config.steps.len(),
            agents = agents.len(),
            "pipeline initialized"
        );
        Ok(PipelinePlan {
            config: config.clone(),
            agents,
        })
    }

    /// Start an execution and return its id immediately.
    ///
    /// The run is driven by a spawned task; progress is observable through
    /// the store and the event bus.
    pub fn execute(
        &self,
        plan: PipelinePlan,
        input: Value,
        correlation_id: Option<CorrelationId>,
    ) -> ExecutionId {
        let (id, correlation_id) = self.begin(&plan, input.clone(), correlation_id);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(plan, id, correlation_id, input).await;
        });
        id
    }

    /// Run an execution to completion and return the terminal record
    pub async fn execute_blocking(
        &self,
        plan: PipelinePlan,
        input: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<ExecutionRecord> {
        let (id, correlation_id) = self.begin(&plan, input.clone(), correlation_id);
        self.drive(plan, id, correlation_id, input).await;
        self.store.snapshot(id)
    }

    /// Request cancellation of a running execution.
    ///
    /// Returns `true` when a running execution accepted the request. Steps
    /// already in flight are allowed to finish, but their results are
    /// discarded and no further group is scheduled.
    pub fn cancel(&self, id: ExecutionId) -> bool {
        self.cancel_with_reason(id, "cancelled by request")
    }

    fn cancel_with_reason(&self, id: ExecutionId, reason: &str) -> bool {
        match self.cancellations.get(&id) {
            Some(tx) => tx.send(Some(reason.to_string())).is_ok(),
            None => false,
        }
    }

    fn cancel_reason(&self, id: ExecutionId) -> Option<String> {
        self.cancellations
            .get(&id)
            .and_then(|tx| tx.borrow().clone())
    }

    fn begin(
        &self,
        plan: &PipelinePlan,
        input: Value,
        correlation_id: Option<CorrelationId>,
    ) -> (ExecutionId, CorrelationId) {
        let steps = plan
            .config
            .steps
            .iter()
            .map(|s| StepProgress {
                step: s.agent_type.clone(),
                agent_type: s.agent_type.clone(),
                status: StepState::Pending,
                optional: s.optional,
                detail: None,
            })
            .collect();
        let record = ExecutionRecord::new(&plan.config.name, input.clone(), steps);
        let id = self.store.insert(record);
        let correlation_id = correlation_id.unwrap_or_else(|| CorrelationId::from(id));

        let (cancel_tx, _) = watch::channel(None);
        self.cancellations.insert(id, cancel_tx);

        self.bus.publish(
            Event::new(EventType::PipelineStarted, "pipeline_engine")
                .with_payload(json!({
                    "pipeline_name": plan.config.name,
                    "execution_id": id,
                    "input_data": input,
                }))
                .with_correlation(correlation_id.clone()),
        );
        tracing::info!(execution = %id, pipeline = %plan.config.name, "pipeline execution started");
        (id, correlation_id)
    }

    async fn drive(
        &self,
        plan: PipelinePlan,
        id: ExecutionId,
        correlation_id: CorrelationId,
        input: Value,
    ) {
        // The global timeout is a cancellation, not a hard drop: in-flight
        // collaborator calls finish, their results are discarded.
        let watchdog = {
            let engine = self.clone();
            let global = Duration::from_secs(plan.config.global_timeout_seconds);
            tokio::spawn(async move {
                tokio::time::sleep(global).await;
                engine.cancel_with_reason(id, "pipeline timeout");
            })
        };

        let mut satisfied: HashSet<String> = HashSet::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut current_data = input;
        let mut failure: Option<String> = None;

        'walk: loop {
            if self.cancel_reason(id).is_some() {
                break 'walk;
            }
            let ready: Vec<PipelineStep> = plan
                .config
                .ready_steps(&satisfied, &scheduled)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                break 'walk;
            }
            for step in &ready {
                scheduled.insert(step.agent_type.clone());
            }

            // Sequential and iterative members run one after another in
            // config order; parallel members run as one bounded batch.
            let (ordered, parallel): (Vec<PipelineStep>, Vec<PipelineStep>) = ready
                .into_iter()
                .partition(|s| s.execution_mode != ExecutionMode::Parallel);

            let mut last_output: Option<Value> = None;

            for step in ordered {
                if self.cancel_reason(id).is_some() {
                    break 'walk;
                }
                let outcome = self
                    .run_step(&plan, &step, id, &correlation_id, current_data.clone())
                    .await;
                match self.apply_outcome(id, &correlation_id, &step, outcome) {
                    Applied::Success(value) => {
                        current_data = value.clone();
                        last_output = Some(value);
                        satisfied.insert(step.agent_type.clone());
                    }
                    Applied::OptionalFailure => {
                        // A failed optional step still satisfies dependents.
                        satisfied.insert(step.agent_type.clone());
                    }
                    Applied::RequiredFailure(reason) => {
                        failure.get_or_insert(reason);
                        if plan.config.failure_strategy == FailureStrategy::Stop {
                            break 'walk;
                        }
                    }
                }
            }

            if !parallel.is_empty() {
                let semaphore = Arc::new(Semaphore::new(plan.config.max_parallel_steps));
                let batch = parallel.iter().map(|step| {
                    let engine = self.clone();
                    let plan = plan.clone();
                    let step = step.clone();
                    let correlation_id = correlation_id.clone();
                    let data = current_data.clone();
                    let semaphore = semaphore.clone();
                    async move {
                        let _permit = match semaphore.acquire().await {
                            Ok(permit) => permit,
                            // Only possible if the semaphore is closed, which
                            // this engine never does.
                            Err(_) => {
                                return (
                                    step,
                                    StepOutcome::Failed("parallel scheduler unavailable".into()),
                                )
                            }
                        };
                        let outcome = engine
                            .run_step(&plan, &step, id, &correlation_id, data)
                            .await;
                        (step, outcome)
                    }
                });

                // Group barrier: every member finishes (or fails) before the
                // next ready set is computed.
                for (step, outcome) in join_all(batch).await {
                    match self.apply_outcome(id, &correlation_id, &step, outcome) {
                        Applied::Success(value) => {
                            last_output = Some(value);
                            satisfied.insert(step.agent_type.clone());
                        }
                        Applied::OptionalFailure => {
                            satisfied.insert(step.agent_type.clone());
                        }
                        Applied::RequiredFailure(reason) => {
                            failure.get_or_insert(reason);
                            if plan.config.failure_strategy == FailureStrategy::Stop {
                                break 'walk;
                            }
                        }
                    }
                }
            }

            if let Some(value) = last_output {
                current_data = value;
            }
        }

        watchdog.abort();
        self.finish(id, &correlation_id, &plan, failure);
    }

    fn finish(
        &self,
        id: ExecutionId,
        correlation_id: &CorrelationId,
        plan: &PipelinePlan,
        failure: Option<String>,
    ) {
        let cancel_reason = self.cancel_reason(id);
        self.cancellations.remove(&id);

        let error = failure.or(cancel_reason);
        let status = if error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        self.update_record(id, |record| {
            for step in &mut record.steps {
                if !step.status.is_terminal() {
                    step.status = StepState::Skipped;
                    step.detail = Some("never scheduled".to_string());
                }
            }
            record.finish(status, error.clone());
        });

        let event_type = match status {
            ExecutionStatus::Completed => EventType::PipelineCompleted,
            _ => EventType::PipelineFailed,
        };
        self.bus.publish(
            Event::new(event_type, "pipeline_engine")
                .with_payload(json!({
                    "pipeline_name": plan.config.name,
                    "execution_id": id,
                    "error": error,
                }))
                .with_correlation(correlation_id.clone()),
        );
        tracing::info!(execution = %id, %status, "pipeline execution finished");

        if status == ExecutionStatus::Completed {
            if let Some(persist) = &self.persist {
                if let Ok(record) = self.store.snapshot(id) {
                    let persist = persist.clone();
                    let correlation_id = correlation_id.clone();
                    tokio::spawn(async move {
                        persist.persist(&record, correlation_id).await;
                    });
                }
            }
        }
    }

    async fn run_step(
        &self,
        plan: &PipelinePlan,
        step: &PipelineStep,
        id: ExecutionId,
        correlation_id: &CorrelationId,
        input: Value,
    ) -> StepOutcome {
        let step_name = step.agent_type.clone();
        self.update_record(id, |r| r.set_step(&step_name, StepState::Running, None));
        self.bus.publish(
            Event::new(EventType::StepStarted, "pipeline_engine")
                .with_payload(json!({ "step": step_name, "mode": step.execution_mode }))
                .with_correlation(correlation_id.clone()),
        );

        let limit = Duration::from_secs(step.timeout_seconds);
        if step.is_iterative() {
            let Some(params) = step.iterative.clone() else {
                return StepOutcome::Failed("missing iterative parameters".to_string());
            };
            let Some(improver) = plan.agent(&params.improver_agent, step.config_type) else {
                return StepOutcome::Failed(format!(
                    "improver agent '{}' not resolved",
                    params.improver_agent
                ));
            };
            let Some(evaluator) = plan.agent(&params.evaluator_agent, ConfigClass::Review) else {
                return StepOutcome::Failed(format!(
                    "evaluator agent '{}' not resolved",
                    params.evaluator_agent
                ));
            };

            let controller = IterativeLoop::new(
                &step_name,
                improver,
                evaluator,
                params,
                self.bus.clone(),
                correlation_id.clone(),
            );
            match tokio::time::timeout(limit, controller.run(input)).await {
                Ok(outcome) => match outcome.final_output.clone() {
                    Some(output) => StepOutcome::Completed(json!({
                        "output": output,
                        "quality_score": outcome.final_quality_score,
                        "iterations_completed": outcome.total_iterations,
                        "threshold_met": outcome.threshold_met,
                        "evaluator_failed": outcome.evaluator_failed,
                        "trend": outcome.trend,
                    })),
                    None => StepOutcome::Failed(format!(
                        "iterative loop produced no draft after {} iterations",
                        outcome.total_iterations
                    )),
                },
                Err(_) => StepOutcome::Failed(
                    Error::StepTimeout {
                        step: step_name,
                        seconds: step.timeout_seconds,
                    }
                    .to_string(),
                ),
            }
        } else {
            let Some(agent) = plan.agent(&step.agent_type, step.config_type) else {
                return StepOutcome::Failed(format!("agent '{}' not resolved", step.agent_type));
            };
            let agent_name = agent.descriptor().name.clone();
            self.bus.publish(
                Event::new(EventType::AgentStarted, &agent_name)
                    .with_payload(json!({ "step": step_name }))
                    .with_correlation(correlation_id.clone()),
            );

            let ctx = ProcessContext::new(correlation_id.clone(), &step_name);
            match tokio::time::timeout(limit, agent.process(input, &ctx)).await {
                Ok(Ok(reply)) if reply.success => {
                    self.bus.publish(
                        Event::new(EventType::AgentCompleted, &agent_name)
                            .with_payload(json!({ "step": step_name }))
                            .with_correlation(correlation_id.clone()),
                    );
                    StepOutcome::Completed(reply.output)
                }
                Ok(Ok(reply)) => {
                    let reason = reply
                        .error
                        .unwrap_or_else(|| "collaborator returned failure".to_string());
                    self.publish_agent_failed(&agent_name, &step_name, &reason, correlation_id);
                    StepOutcome::Failed(reason)
                }
                Ok(Err(e)) => {
                    let reason = e.to_string();
                    self.publish_agent_failed(&agent_name, &step_name, &reason, correlation_id);
                    StepOutcome::Failed(reason)
                }
                Err(_) => {
                    let reason = Error::StepTimeout {
                        step: step_name.clone(),
                        seconds: step.timeout_seconds,
                    }
                    .to_string();
                    self.publish_agent_failed(&agent_name, &step_name, &reason, correlation_id);
                    StepOutcome::Failed(reason)
                }
            }
        }
    }

    // Writes the outcome into the record (unless the run was cancelled, in
    // which case the result is discarded) and translates it into a
    // scheduling directive.
    fn apply_outcome(
        &self,
        id: ExecutionId,
        correlation_id: &CorrelationId,
        step: &PipelineStep,
        outcome: StepOutcome,
    ) -> Applied {
        let step_name = step.agent_type.clone();
        let cancelled = self.cancel_reason(id).is_some();

        match outcome {
            StepOutcome::Completed(value) => {
                self.update_record(id, |record| {
                    record.set_step(&step_name, StepState::Completed, None);
                    if cancelled {
                        record.warnings.push(format!(
                            "result of step '{step_name}' discarded after cancellation"
                        ));
                    } else {
                        record.results.insert(step_name.clone(), value.clone());
                    }
                });
                self.bus.publish(
                    Event::new(EventType::StepCompleted, "pipeline_engine")
                        .with_payload(json!({ "step": step_name }))
                        .with_correlation(correlation_id.clone()),
                );
                Applied::Success(value)
            }
            StepOutcome::Failed(reason) => {
                self.update_record(id, |record| {
                    record.set_step(&step_name, StepState::Failed, Some(reason.clone()));
                    if step.optional {
                        record
                            .warnings
                            .push(format!("optional step '{step_name}' failed: {reason}"));
                    }
                });
                self.bus.publish(
                    Event::new(EventType::StepFailed, "pipeline_engine")
                        .with_payload(json!({
                            "step": step_name,
                            "reason": reason,
                            "optional": step.optional,
                        }))
                        .with_correlation(correlation_id.clone()),
                );
                if step.optional {
                    tracing::warn!(execution = %id, step = %step.agent_type, %reason, "optional step failed");
                    Applied::OptionalFailure
                } else {
                    tracing::error!(execution = %id, step = %step.agent_type, %reason, "required step failed");
                    Applied::RequiredFailure(format!("step '{}' failed: {reason}", step.agent_type))
                }
            }
        }
    }

    fn publish_agent_failed(
        &self,
        agent_name: &str,
        step_name: &str,
        reason: &str,
        correlation_id: &CorrelationId,
    ) {
        self.bus.publish(
            Event::new(EventType::AgentFailed, agent_name)
                .with_payload(json!({ "step": step_name, "reason": reason }))
                .with_correlation(correlation_id.clone()),
        );
    }

    fn update_record<F>(&self, id: ExecutionId, f: F)
    where
        F: FnOnce(&mut ExecutionRecord),
    {
        if let Err(e) = self.store.update(id, f) {
            tracing::error!(execution = %id, error = %e, "failed to update execution record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::AgentReply;
    use crate::pipeline::config::IterativeParams;
    use crate::registry::AgentDescriptor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    type ReplyFn = Box<dyn Fn(&Value) -> Result<AgentReply> + Send + Sync>;

    struct ScriptedAgent {
        descriptor: AgentDescriptor,
        calls: AtomicU32,
        inputs: Mutex<Vec<Value>>,
        delay: Option<Duration>,
        reply: ReplyFn,
    }

    impl std::fmt::Debug for ScriptedAgent {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedAgent")
                .field("descriptor", &self.descriptor)
                .field("calls", &self.calls)
                .field("inputs", &self.inputs)
                .field("delay", &self.delay)
                .finish_non_exhaustive()
        }
    }

    impl ScriptedAgent {
        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn process(&self, payload: Value, _ctx: &ProcessContext) -> Result<AgentReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().push(payload.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.reply)(&payload)
        }
    }

    struct Harness {
        registry: Arc<AgentRegistry>,
        store: Arc<ExecutionStore>,
        engine: PipelineEngine,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(AgentRegistry::new());
            let store = Arc::new(ExecutionStore::new());
            let engine =
                PipelineEngine::new(registry.clone(), store.clone(), EventBus::new());
            Self {
                registry,
                store,
                engine,
            }
        }

        fn agent(&self, type_name: &str, reply: ReplyFn) -> Arc<ScriptedAgent> {
            self.agent_with_delay(type_name, None, reply)
        }

        fn agent_with_delay(
            &self,
            type_name: &str,
            delay: Option<Duration>,
            reply: ReplyFn,
        ) -> Arc<ScriptedAgent> {
            let agent = Arc::new(ScriptedAgent {
                descriptor: AgentDescriptor::new(type_name, type_name),
                calls: AtomicU32::new(0),
                inputs: Mutex::new(Vec::new()),
                delay,
                reply,
            });
            let handle = agent.clone();
            self.registry
                .register(agent.descriptor.clone(), move |_| {
                    Ok(handle.clone() as Arc<dyn Agent>)
                })
                .unwrap();
            agent
        }
    }

    fn step(agent_type: &str, depends_on: &[&str]) -> PipelineStep {
        PipelineStep {
            agent_type: agent_type.to_string(),
            config_type: ConfigClass::Standard,
            execution_mode: ExecutionMode::Sequential,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            optional: false,
            timeout_seconds: 30,
            iterative: None,
        }
    }

    fn pipeline(name: &str, steps: Vec<PipelineStep>) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            description: String::new(),
            global_timeout_seconds: 600,
            max_parallel_steps: 2,
            failure_strategy: FailureStrategy::Stop,
            steps,
        }
    }

    fn echo(prefix: &'static str) -> ReplyFn {
        Box::new(move |input| {
            Ok(AgentReply::ok(json!(format!(
                "{prefix}: {}",
                input.as_str().unwrap_or("?")
            ))))
        })
    }

    #[tokio::test]
    async fn sequential_steps_chain_outputs_in_order() {
        let h = Harness::new();
        let analyst = h.agent("analyst", echo("analysis"));
        let coder = h.agent("coder", echo("code"));

        let config = pipeline("chain", vec![step("analyst", &[]), step("coder", &["analyst"])]);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("request"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.results["analyst"], json!("analysis: request"));
        assert_eq!(record.results["coder"], json!("code: analysis: request"));
        assert_eq!(analyst.call_count(), 1);
        assert_eq!(coder.inputs.lock()[0], json!("analysis: request"));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn initialize_rejects_unknown_agents() {
        let h = Harness::new();
        let config = pipeline("ghost", vec![step("ghost", &[])]);
        let err = h.engine.initialize(&config).unwrap_err();
        assert!(matches!(err, Error::UnknownAgent(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn initialize_rejects_cycles_before_execute_is_reachable() {
        let h = Harness::new();
        h.agent("a", echo("a"));
        h.agent("b", echo("b"));
        let config = pipeline("cyclic", vec![step("a", &["b"]), step("b", &["a"])]);
        let err = h.engine.initialize(&config).unwrap_err();
        assert!(matches!(err, Error::CyclicPipeline(_)));
    }

    #[tokio::test]
    async fn optional_step_failure_completes_the_run_with_a_warning() {
        let h = Harness::new();
        h.agent("flaky", Box::new(|_| Ok(AgentReply::failure("no output"))));

        let mut failing = step("flaky", &[]);
        failing.optional = true;
        let config = pipeline("tolerant", vec![failing]);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("request"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        let entry = &record.steps[0];
        assert_eq!(entry.status, StepState::Failed);
        assert!(entry.optional);
        assert!(!record.warnings.is_empty());
        assert!(record.results.is_empty());
    }

    #[tokio::test]
    async fn required_step_failure_fails_the_run_and_skips_dependents() {
        let h = Harness::new();
        h.agent("flaky", Box::new(|_| Ok(AgentReply::failure("no output"))));
        let downstream = h.agent("downstream", echo("down"));

        let config = pipeline(
            "strict",
            vec![step("flaky", &[]), step("downstream", &["flaky"])],
        );
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("request"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("flaky"));
        assert_eq!(record.steps[1].status, StepState::Skipped);
        assert_eq!(downstream.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_optional_prerequisite_still_satisfies_dependents() {
        let h = Harness::new();
        h.agent("flaky", Box::new(|_| Ok(AgentReply::failure("no output"))));
        let downstream = h.agent("downstream", echo("down"));

        let mut flaky = step("flaky", &[]);
        flaky.optional = true;
        let config = pipeline("lenient", vec![flaky, step("downstream", &["flaky"])]);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("request"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(downstream.call_count(), 1);
    }

    #[tokio::test]
    async fn parallel_group_is_bounded_and_waits_for_all_members() {
        let h = Harness::new();

        // Tracks how many collaborator calls overlap.
        static RUNNING: AtomicI32 = AtomicI32::new(0);
        static PEAK: AtomicI32 = AtomicI32::new(0);
        RUNNING.store(0, Ordering::SeqCst);
        PEAK.store(0, Ordering::SeqCst);

        #[derive(Debug)]
        struct GaugedAgent {
            descriptor: AgentDescriptor,
        }

        #[async_trait]
        impl Agent for GaugedAgent {
            fn descriptor(&self) -> &AgentDescriptor {
                &self.descriptor
            }
            async fn process(&self, _payload: Value, _ctx: &ProcessContext) -> Result<AgentReply> {
                let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                RUNNING.fetch_sub(1, Ordering::SeqCst);
                Ok(AgentReply::ok(json!("done")))
            }
        }

        for name in ["p1", "p2", "p3"] {
            let descriptor = AgentDescriptor::new(name, name);
            h.registry
                .register(descriptor.clone(), move |_| {
                    Ok(Arc::new(GaugedAgent {
                        descriptor: descriptor.clone(),
                    }) as Arc<dyn Agent>)
                })
                .unwrap();
        }

        let mut steps: Vec<PipelineStep> = ["p1", "p2", "p3"]
            .iter()
            .map(|name| step(name, &[]))
            .collect();
        for s in &mut steps {
            s.execution_mode = ExecutionMode::Parallel;
        }
        let config = pipeline("fanout", steps);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("go"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record
            .steps
            .iter()
            .all(|s| s.status == StepState::Completed));
        assert!(PEAK.load(Ordering::SeqCst) <= 2);
        assert_eq!(record.results.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn step_exceeding_its_timeout_is_failed_with_the_timeout_reason() {
        let h = Harness::new();
        h.agent_with_delay(
            "slow",
            Some(Duration::from_secs(120)),
            echo("never"),
        );

        let mut slow = step("slow", &[]);
        slow.timeout_seconds = 1;
        let config = pipeline("impatient", vec![slow]);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("go"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.steps[0]
            .detail
            .as_ref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn iterative_step_runs_the_convergence_loop() {
        let h = Harness::new();
        h.agent("generator", echo("draft"));
        h.agent(
            "reviewer",
            Box::new(|_| Ok(AgentReply::ok(json!({ "quality_score": 95.0 })))),
        );

        let mut iter_step = step("code_generation", &[]);
        iter_step.execution_mode = ExecutionMode::Iterative;
        iter_step.iterative = Some(IterativeParams {
            improver_agent: "generator".to_string(),
            evaluator_agent: "reviewer".to_string(),
            max_iterations: 3,
            quality_threshold: 85.0,
            timeout_per_iteration: 30,
        });
        let config = pipeline("looped", vec![iter_step]);
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("request"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        let result = &record.results["code_generation"];
        assert_eq!(result["threshold_met"], json!(true));
        assert_eq!(result["iterations_completed"], json!(1));
        assert_eq!(result["output"], json!("draft: request"));
    }

    #[tokio::test]
    async fn continue_strategy_keeps_running_but_ends_failed() {
        let h = Harness::new();
        h.agent("flaky", Box::new(|_| Ok(AgentReply::failure("no output"))));
        let independent = h.agent("independent", echo("ok"));

        let mut config = pipeline(
            "persistent",
            vec![step("flaky", &[]), step("independent", &[])],
        );
        config.failure_strategy = FailureStrategy::Continue;
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("go"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(independent.call_count(), 1);
        assert_eq!(record.results["independent"], json!("ok: go"));
    }

    #[tokio::test]
    async fn cancellation_discards_in_flight_results_and_skips_the_rest() {
        let h = Harness::new();
        h.agent_with_delay("slow", Some(Duration::from_millis(100)), echo("slow"));
        let late = h.agent("late", echo("late"));

        let config = pipeline("doomed", vec![step("slow", &[]), step("late", &["slow"])]);
        let plan = h.engine.initialize(&config).unwrap();
        let id = h.engine.execute(plan, json!("go"), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.engine.cancel(id));

        // Wait for the driving task to wind down.
        let mut record = h.store.snapshot(id).unwrap();
        for _ in 0..50 {
            if record.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            record = h.store.snapshot(id).unwrap();
        }

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("cancelled"));
        // The in-flight step finished but its result was discarded.
        assert!(record.results.is_empty());
        assert_eq!(record.steps[1].status, StepState::Skipped);
        assert_eq!(late.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn global_timeout_fails_the_run() {
        let h = Harness::new();
        h.agent_with_delay("slow", Some(Duration::from_secs(3600)), echo("slow"));

        let mut config = pipeline("endless", vec![step("slow", &[])]);
        config.global_timeout_seconds = 2;
        config.steps[0].timeout_seconds = 7200;
        let plan = h.engine.initialize(&config).unwrap();
        let record = h
            .engine
            .execute_blocking(plan, json!("go"), None)
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("timeout"));
    }
}
