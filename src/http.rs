//! HTTP surface for the orchestration core
//!
//! Thin axum handlers over the library, engine, store, and bus. Error
//! mapping is uniform: unknown ids and pipeline names become 404,
//! configuration problems become 400, everything else 500.

use crate::collaborator::appraise_request;
use crate::error::Error;
use crate::events::EventBus;
use crate::pipeline::{PipelineEngine, PipelineLibrary};
use crate::registry::AgentRegistry;
use crate::store::{ExecutionRecord, ExecutionStore, StreamFrame};
use crate::types::{CorrelationId, ExecutionId};
use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    /// Registered agent types
    pub registry: Arc<AgentRegistry>,
    /// Named pipeline configurations
    pub library: Arc<PipelineLibrary>,
    /// Execution engine
    pub engine: PipelineEngine,
    /// Execution records
    pub store: Arc<ExecutionStore>,
    /// Lifecycle event bus
    pub bus: EventBus,
}

/// Error wrapper translating core errors into HTTP responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::UnknownExecution(_) | Error::UnknownPipeline(_) => StatusCode::NOT_FOUND,
            e if e.is_configuration() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the service router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/capabilities", get(capabilities))
        .route("/pipelines/initialize", post(initialize_pipeline))
        .route("/pipelines/execute", post(execute_pipeline))
        .route("/pipelines/executions", get(list_executions))
        .route("/pipelines/validate", post(validate_input))
        .route("/pipelines/execution/:id/status", get(execution_status))
        .route("/pipelines/execution/:id/stream", get(execution_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "registered_agents": state.registry.len(),
        "pipelines": state.library.names(),
        "executions": state.store.len(),
        "event_subscribers": state.bus.subscriber_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct InitializeQuery {
    pipeline_name: Option<String>,
}

async fn initialize_pipeline(
    State(state): State<AppState>,
    Query(query): Query<InitializeQuery>,
) -> ApiResult<Json<Value>> {
    let name = query.pipeline_name.unwrap_or_else(|| "default".to_string());
    let config = state
        .library
        .get(&name)
        .ok_or_else(|| Error::UnknownPipeline(name.clone()))?;
    let _plan = state.engine.initialize(&config)?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Pipeline '{name}' initialized successfully"),
        "pipeline_info": {
            "name": config.name,
            "description": config.description,
            "total_steps": config.steps.len(),
            "step_names": config.steps.iter().map(|s| s.agent_type.clone()).collect::<Vec<_>>(),
            "execution_order": config.execution_order(),
        },
    })))
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    input_data: Value,
    #[serde(default)]
    pipeline_name: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    async_execution: bool,
}

async fn execute_pipeline(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<Value>> {
    let name = request
        .pipeline_name
        .unwrap_or_else(|| "default".to_string());
    let config = state
        .library
        .get(&name)
        .ok_or_else(|| Error::UnknownPipeline(name.clone()))?;
    let plan = state.engine.initialize(&config)?;
    let correlation_id = request.correlation_id.map(CorrelationId::from_token);

    if request.async_execution {
        let execution_id = state.engine.execute(plan, request.input_data, correlation_id);
        Ok(Json(json!({
            "execution_id": execution_id,
            "pipeline_name": name,
            "status": "running",
            "message": "Pipeline execution started in background",
        })))
    } else {
        let record = state
            .engine
            .execute_blocking(plan, request.input_data, correlation_id)
            .await?;
        Ok(Json(json!({
            "execution_id": record.id,
            "pipeline_name": name,
            "status": record.status,
            "message": "Pipeline execution completed",
            "record": record,
        })))
    }
}

async fn list_executions(State(state): State<AppState>) -> Json<Value> {
    let executions = state.store.list();
    Json(json!({
        "total_executions": executions.len(),
        "executions": executions,
    }))
}

async fn validate_input(Json(body): Json<Value>) -> Json<Value> {
    let input = body.get("input_data").cloned().unwrap_or(body);
    let text = match &input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Json(json!({
        "validation": appraise_request(&text),
        "input_data": input,
    }))
}

async fn execution_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    let id = parse_execution_id(&id)?;
    Ok(Json(state.store.snapshot(id)?))
}

async fn execution_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<SseEvent, axum::Error>>>> {
    let id = parse_execution_id(&id)?;
    let frames = state.store.stream(id)?;

    let stream = frames.map(|frame| match frame {
        StreamFrame::Snapshot(record) => SseEvent::default().json_data(&record),
        StreamFrame::Ended { events_sent } => SseEvent::default().json_data(&json!({
            "stream_status": "ended",
            "events_sent": events_sent,
        })),
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let resolution_order = state.registry.resolve_order()?;
    Ok(Json(json!({
        "total_agents": state.registry.len(),
        "resolution_order": resolution_order,
        "agents": state.registry.descriptors(),
    })))
}

async fn capabilities(State(state): State<AppState>) -> Json<Value> {
    let descriptors = state.registry.descriptors();
    let all_capabilities: BTreeSet<&str> = descriptors
        .iter()
        .flat_map(|d| d.capabilities.iter().map(String::as_str))
        .collect();

    let agents: serde_json::Map<String, Value> = descriptors
        .iter()
        .map(|d| {
            (
                d.type_name.clone(),
                json!({
                    "name": d.name,
                    "description": d.description,
                    "capabilities": d.capabilities,
                    "config_class": d.config_class,
                    "dependencies": d.dependencies,
                    "version": d.version,
                }),
            )
        })
        .collect();

    Json(json!({
        "service_info": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "description": env!("CARGO_PKG_DESCRIPTION"),
        },
        "total_agents": descriptors.len(),
        "capabilities": all_capabilities,
        "pipelines": state.library.names(),
        "agents": agents,
    }))
}

// Unparseable ids map to the unknown-execution error so the caller sees a
// uniform 404 instead of a parse detail.
fn parse_execution_id(raw: &str) -> std::result::Result<ExecutionId, Error> {
    raw.parse::<ExecutionId>()
        .map_err(|_| Error::UnknownExecution(raw.to_string()))
}
