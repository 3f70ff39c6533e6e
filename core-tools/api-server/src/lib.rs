//! API Server Core Tool
//!
//! HTTP entry point of the waypoint engine. It only sees the handles in
//! `sdk::RunContext`, never the engine's concrete types.
//!
//! # Endpoints
//!
//! - POST /agent/run - Execute one step (called by the scheduler)
//! - GET /agent/run - Liveness check
//! - POST /agent/operations - Create an operation
//! - GET /agent/operations/:id - Operation status (`?history=true&historyLimit=10`)
//! - POST /agent/operations/:id/start - Schedule execution
//! - POST /agent/operations/:id/intervene - Submit a human decision
//! - POST /agent/operations/:id/cancel - Cancel
//! - GET /agent/interventions - Pending human decisions (`?userId=&operationId=`)
//!
//! The management routes require `Authorization: Bearer <api_token>` when a
//! token is configured. `/agent/run` is authenticated by the scheduler
//! signature instead.

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use sdk::errors::{EngineError, ErrorCategory, ErrorExt};
use sdk::handles::RunContext;
use sdk::operations::{CreateOperationParams, InterventionAction, InterventionFilter, StartExecutionParams};
use sdk::state::{HumanPrompt, HumanSelect, StatusKind};
use sdk::step::{StepRequest, StepResult};
use sdk::types::{StepError, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Options for the HTTP layer
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Bearer token guarding the management routes
    pub api_token: Option<String>,
}

/// API server state shared across handlers
#[derive(Clone)]
struct ServerState {
    ctx: RunContext,
    api_token: Option<Arc<str>>,
    draining: Arc<AtomicBool>,
}

/// Response of the step endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    success: bool,
    status: StatusKind,
    operation_id: String,
    step_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_step_index: Option<u64>,
    next_step_scheduled: bool,
    completed: bool,
    waiting_for_human: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_approval: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_prompt: Option<HumanPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_select: Option<HumanSelect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<StepError>,
    total_cost: f64,
    total_steps: u64,
    duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_error: Option<String>,
    /// Milliseconds spent in this invocation
    execution_time: u64,
}

impl RunResponse {
    fn from_result(result: StepResult, step_index: u64, execution_time: u64) -> Self {
        let state = result.state;
        let status = state.status.kind();

        let (pending_approval, pending_prompt, pending_select) = match state.pending() {
            Some(sdk::state::PendingReason::ToolApproval(calls)) => (Some(calls.clone()), None, None),
            Some(sdk::state::PendingReason::HumanPrompt(prompt)) => (None, Some(prompt.clone()), None),
            Some(sdk::state::PendingReason::HumanSelect(select)) => (None, None, Some(select.clone())),
            None => (None, None, None),
        };

        Self {
            success: result.success,
            status,
            operation_id: state.operation_id.clone(),
            step_index,
            next_step_index: step_index
                .checked_add(1)
                .filter(|_| result.next_step_scheduled),
            next_step_scheduled: result.next_step_scheduled,
            completed: status == StatusKind::Done,
            waiting_for_human: status == StatusKind::WaitingForHuman,
            pending_approval,
            pending_prompt,
            pending_select,
            error: state.status.error().cloned(),
            total_cost: state.cost.total,
            total_steps: state.step_count,
            duplicate: result.duplicate,
            message_id: result.message_id,
            schedule_error: result.schedule_error,
            execution_time,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    #[serde(default)]
    history: bool,
    #[serde(default)]
    history_limit: Option<u32>,
}

/// Build the router
///
/// `draining` flips the health check to 503 while the server shuts down.
pub fn router(ctx: RunContext, options: ServerOptions, draining: Arc<AtomicBool>) -> Router {
    let state = ServerState {
        ctx,
        api_token: options.api_token.map(Arc::from),
        draining,
    };

    let management = Router::new()
        .route("/agent/operations", post(create_handler))
        .route("/agent/operations/:id", get(status_handler))
        .route("/agent/operations/:id/start", post(start_handler))
        .route("/agent/operations/:id/intervene", post(intervene_handler))
        .route("/agent/operations/:id/cancel", post(cancel_handler))
        .route("/agent/interventions", get(interventions_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/agent/run", post(run_handler).get(health_handler))
        .merge(management)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Last-resort 500 for a panic outside the step task
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Request handler panicked: {}", panic_message(panic.as_ref()));
    error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// A running API server
pub struct ApiServer {
    addr: SocketAddr,
    draining: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ApiServer {
    /// Bind `bind_addr` and serve in the background
    pub async fn start(
        ctx: RunContext,
        options: ServerOptions,
        bind_addr: &str,
    ) -> Result<Self, EngineError> {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| EngineError::Network(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        let addr = listener
            .local_addr()
            .map_err(|e| EngineError::Network(format!("Failed to get local address: {}", e)))?;

        let draining = Arc::new(AtomicBool::new(false));
        let app = router(ctx, options, Arc::clone(&draining));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            tracing::info!("API server listening on http://{}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                    tracing::info!("API server shutting down gracefully");
                })
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("API server error: {}", e);
                });
        });

        Ok(Self {
            addr,
            draining,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Report unhealthy so the scheduler stops routing new steps here
    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn stop(mut self) {
        self.begin_draining();
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            shutdown_tx.send(()).ok();
        }
        if let Err(e) = self.handle.await {
            tracing::error!("API server task failed: {}", e);
        }
        tracing::info!("API server stopped");
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Failure of the step endpoint after the request was accepted
fn step_failure(err: &EngineError, operation_id: &str, step_index: u64, started: Instant) -> Response {
    let status = match err.category() {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => StatusCode::UNAUTHORIZED,
        ErrorCategory::Business | ErrorCategory::Conflict | ErrorCategory::System => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Step {} of {} failed: {}", step_index, operation_id, err);
    } else {
        tracing::warn!("Rejected step {} of {}: {}", step_index, operation_id, err);
    }

    (
        status,
        Json(json!({
            "error": err.to_string(),
            "operationId": operation_id,
            "stepIndex": step_index,
            "executionTime": elapsed_ms(started),
        })),
    )
        .into_response()
}

/// Step endpoint
///
/// The body is taken as raw bytes so the signature is checked against
/// exactly what the scheduler signed.
async fn run_handler(State(state): State<ServerState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let verifier = &state.ctx.verifier;

    if verifier.is_enabled() {
        let signature = headers
            .get(verifier.header_name())
            .and_then(|v| v.to_str().ok());
        if !verifier.verify(&body, signature) {
            tracing::warn!("Rejected step request with invalid signature");
            return error_body(StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    } else {
        tracing::warn!("Signature verification disabled, accepting unsigned step request");
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return error_body(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e));
        }
    };

    let operation_id = match value.get("operationId").and_then(|v| v.as_str()) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => return error_body(StatusCode::BAD_REQUEST, "operationId is required"),
    };

    let request: StepRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return error_body(StatusCode::BAD_REQUEST, format!("Invalid step request: {}", e));
        }
    };
    let step_index = request.step_index;

    let owner = match state.ctx.executor.metadata(&operation_id).await {
        Ok(Some(metadata)) if !metadata.owner_user_id.is_empty() => metadata.owner_user_id,
        Ok(_) => {
            tracing::warn!("Step request for unknown operation {}", operation_id);
            return error_body(StatusCode::UNAUTHORIZED, EngineError::Unauthorized.to_string());
        }
        Err(e) => return step_failure(&e, &operation_id, step_index, started),
    };

    // Separate task: a panicking step still answers with the failure body
    let executor = state.ctx.executor.clone();
    let step = tokio::spawn(
        async move { executor.execute_step(&owner, request).await }.in_current_span(),
    );
    let outcome = match step.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            let detail = if join_error.is_panic() {
                let panic = join_error.into_panic();
                format!("Step panicked: {}", panic_message(panic.as_ref()))
            } else {
                "Step task was cancelled".to_string()
            };
            tracing::error!("Step {} of {} failed: {}", step_index, operation_id, detail);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": detail,
                    "operationId": operation_id,
                    "stepIndex": step_index,
                    "executionTime": elapsed_ms(started),
                })),
            )
                .into_response();
        }
    };

    match outcome {
        Ok(result) => {
            let code = if result.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            let response = RunResponse::from_result(result, step_index, elapsed_ms(started));
            (code, Json(response)).into_response()
        }
        Err(e) => step_failure(&e, &operation_id, step_index, started),
    }
}

/// Liveness only; touches neither the metadata store nor the executor
async fn health_handler(State(state): State<ServerState>) -> Response {
    let timestamp = Utc::now().to_rfc3339();

    if state.draining.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "healthy": false,
                "error": "Server is shutting down",
                "timestamp": timestamp,
            })),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({
            "healthy": true,
            "message": "Agent execution service is running",
            "timestamp": timestamp,
        })),
    )
        .into_response()
}

/// Bearer token check for the management routes
async fn require_token(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_token {
        let supplied = request
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match supplied {
            Some(token) if token == expected.as_ref() => {}
            Some(_) => return error_body(StatusCode::UNAUTHORIZED, "Invalid token"),
            None => return error_body(StatusCode::UNAUTHORIZED, "Missing authorization header"),
        }
    }

    next.run(request).await
}

/// Map a management error to a response
fn management_error(err: EngineError) -> Response {
    let status = match &err {
        EngineError::StateNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::OperationExists(_) | EngineError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        _ => match err.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Authentication => StatusCode::UNAUTHORIZED,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Business | ErrorCategory::System => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };

    if status.is_server_error() {
        tracing::error!("Management request failed: {}", err);
    }

    (
        status,
        Json(json!({ "error": err.to_string(), "hint": err.user_hint() })),
    )
        .into_response()
}

async fn create_handler(
    State(state): State<ServerState>,
    Json(params): Json<CreateOperationParams>,
) -> Response {
    match state.ctx.operations.create(params).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => management_error(e),
    }
}

async fn status_handler(
    State(state): State<ServerState>,
    Path(operation_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state
        .ctx
        .operations
        .status(&operation_id, query.history, query.history_limit.unwrap_or(10))
        .await
    {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Operation not found"),
        Err(e) => management_error(e),
    }
}

async fn start_handler(
    State(state): State<ServerState>,
    Path(operation_id): Path<String>,
    params: Option<Json<StartExecutionParams>>,
) -> Response {
    let params = params.map(|Json(p)| p).unwrap_or_default();
    match state.ctx.operations.start(&operation_id, params).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => management_error(e),
    }
}

async fn intervene_handler(
    State(state): State<ServerState>,
    Path(operation_id): Path<String>,
    Json(action): Json<InterventionAction>,
) -> Response {
    match state.ctx.operations.intervene(&operation_id, action).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => management_error(e),
    }
}

async fn cancel_handler(
    State(state): State<ServerState>,
    Path(operation_id): Path<String>,
) -> Response {
    match state.ctx.operations.cancel(&operation_id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => management_error(e),
    }
}

async fn interventions_handler(
    State(state): State<ServerState>,
    Query(filter): Query<InterventionFilter>,
) -> Response {
    match state.ctx.operations.pending(filter).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => management_error(e),
    }
}
