use api_server::{router, ServerOptions};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::handles::{
    ExecutorHandle, ExecutorHandleImpl, OperationsHandle, OperationsHandleImpl, RunContext,
    VerifierHandle, VerifierHandleImpl,
};
use sdk::operations::*;
use sdk::state::{OperationStatus, StepState};
use sdk::step::{OperationMetadata, StepRequest, StepResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

struct MockExecutor {
    requests: Mutex<Vec<(String, StepRequest)>>,
    fail_with: Option<fn() -> EngineError>,
    schedule_fails: bool,
    panics: bool,
}

impl MockExecutor {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail_with: None,
            schedule_fails: false,
            panics: false,
        }
    }
}

#[async_trait]
impl ExecutorHandleImpl for MockExecutor {
    async fn metadata(&self, operation_id: &str) -> Result<Option<OperationMetadata>, EngineError> {
        Ok(match operation_id {
            "op-1" => Some(OperationMetadata {
                operation_id: "op-1".to_string(),
                owner_user_id: "user-1".to_string(),
                created_at: Utc::now(),
            }),
            "orphan" => Some(OperationMetadata {
                operation_id: "orphan".to_string(),
                owner_user_id: String::new(),
                created_at: Utc::now(),
            }),
            _ => None,
        })
    }

    async fn execute_step(&self, owner: &str, request: StepRequest) -> Result<StepResult, EngineError> {
        self.requests
            .lock()
            .unwrap()
            .push((owner.to_string(), request.clone()));

        if self.panics {
            panic!("executor blew up");
        }

        if let Some(fail) = self.fail_with {
            return Err(fail());
        }

        let mut state = StepState::new(request.operation_id.clone(), vec![]);
        state.status = OperationStatus::Running;
        state.step_count = request.step_index + 1;
        state.cost.total = 0.25;

        Ok(StepResult {
            state,
            success: !self.schedule_fails,
            next_step_scheduled: !self.schedule_fails,
            duplicate: false,
            message_id: (!self.schedule_fails).then(|| "msg-1".to_string()),
            schedule_error: self.schedule_fails.then(|| "publish failed".to_string()),
        })
    }
}

struct MockOperations;

#[async_trait]
impl OperationsHandleImpl for MockOperations {
    async fn create(&self, params: CreateOperationParams) -> Result<CreateOperationResult, EngineError> {
        if params.operation_id == "taken" {
            return Err(EngineError::OperationExists(params.operation_id));
        }
        Ok(CreateOperationResult {
            operation_id: params.operation_id,
            auto_started: params.auto_start,
            message_id: None,
        })
    }

    async fn status(
        &self,
        _operation_id: &str,
        _include_history: bool,
        _history_limit: u32,
    ) -> Result<Option<OperationStatusReport>, EngineError> {
        Ok(None)
    }

    async fn pending(&self, filter: InterventionFilter) -> Result<PendingInterventionsReport, EngineError> {
        assert_eq!(filter.user_id.as_deref(), Some("user-1"));
        Ok(PendingInterventionsReport {
            total_count: 0,
            interventions: vec![],
            timestamp: Utc::now(),
        })
    }

    async fn start(
        &self,
        operation_id: &str,
        _params: StartExecutionParams,
    ) -> Result<ScheduleReceipt, EngineError> {
        Err(EngineError::InvalidTransition {
            id: operation_id.to_string(),
            reason: "operation is done".to_string(),
        })
    }

    async fn intervene(
        &self,
        operation_id: &str,
        action: InterventionAction,
    ) -> Result<ScheduleReceipt, EngineError> {
        assert_eq!(action, InterventionAction::Input { text: "yes".to_string() });
        Ok(ScheduleReceipt {
            operation_id: operation_id.to_string(),
            step_index: 3,
            scheduled: true,
            message_id: Some("msg-9".to_string()),
        })
    }

    async fn cancel(&self, operation_id: &str) -> Result<CancelResult, EngineError> {
        Err(EngineError::StateNotFound(operation_id.to_string()))
    }
}

struct MockVerifier {
    enabled: bool,
}

impl VerifierHandleImpl for MockVerifier {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn header_name(&self) -> &str {
        "x-signature"
    }

    fn verify(&self, _raw_body: &[u8], signature: Option<&str>) -> bool {
        signature == Some("good")
    }
}

fn app_with(executor: MockExecutor, verify: bool, api_token: Option<&str>) -> (Router, Arc<AtomicBool>) {
    let ctx = RunContext::new(
        ExecutorHandle::new(Arc::new(executor)),
        OperationsHandle::new(Arc::new(MockOperations)),
        VerifierHandle::new(Arc::new(MockVerifier { enabled: verify })),
    );
    let draining = Arc::new(AtomicBool::new(false));
    let options = ServerOptions {
        api_token: api_token.map(str::to_string),
    };
    (router(ctx, options, Arc::clone(&draining)), draining)
}

fn app() -> Router {
    app_with(MockExecutor::new(), false, None).0
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, draining) = app_with(MockExecutor::new(), false, None);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/agent/run").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["healthy"], true);
    assert!(body["timestamp"].is_string());

    draining.store(true, Ordering::SeqCst);
    let response = app
        .oneshot(Request::builder().uri("/agent/run").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json(response).await["healthy"], false);
}

#[tokio::test]
async fn test_run_executes_step_for_owner() {
    let executor = Arc::new(MockExecutor::new());
    let ctx = RunContext::new(
        ExecutorHandle::new(Arc::clone(&executor) as Arc<dyn ExecutorHandleImpl>),
        OperationsHandle::new(Arc::new(MockOperations)),
        VerifierHandle::new(Arc::new(MockVerifier { enabled: false })),
    );
    let app = router(ctx, ServerOptions::default(), Arc::new(AtomicBool::new(false)));

    let response = app
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1", "stepIndex": 2 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "running");
    assert_eq!(body["stepIndex"], 2);
    assert_eq!(body["nextStepIndex"], 3);
    assert_eq!(body["nextStepScheduled"], true);
    assert_eq!(body["totalSteps"], 3);
    assert_eq!(body["totalCost"], 0.25);
    assert_eq!(body["messageId"], "msg-1");
    assert_eq!(body["operationId"], "op-1");

    let requests = executor.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "user-1");
}

#[tokio::test]
async fn test_run_rejects_bad_signature() {
    let (app, _) = app_with(MockExecutor::new(), true, None);

    let response = app
        .clone()
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response).await["error"], "Invalid signature");

    let mut request = post_json("/agent/run", json!({ "operationId": "op-1" }));
    request
        .headers_mut()
        .insert("x-signature", "good".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_run_requires_operation_id() {
    let response = app()
        .oneshot(post_json("/agent/run", json!({ "stepIndex": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/agent/run")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_run_unknown_operation_is_unauthorized() {
    for id in ["missing", "orphan"] {
        let response = app()
            .oneshot(post_json("/agent/run", json!({ "operationId": id })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            read_json(response).await["error"],
            "Invalid operation or unauthorized"
        );
    }
}

#[tokio::test]
async fn test_run_maps_executor_errors() {
    let mut executor = MockExecutor::new();
    executor.fail_with = Some(|| EngineError::HumanInputMismatch {
        expected: "approval",
        supplied: "humanInput",
    });
    let (app, _) = app_with(executor, false, None);
    let response = app
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1", "stepIndex": 1 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["stepIndex"], 1);
    assert!(body["executionTime"].is_number());

    let mut executor = MockExecutor::new();
    executor.fail_with = Some(|| EngineError::Database("disk full".to_string()));
    let (app, _) = app_with(executor, false, None);
    let response = app
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_run_turns_executor_panic_into_failure() {
    let mut executor = MockExecutor::new();
    executor.panics = true;
    let (app, _) = app_with(executor, false, None);

    let response = app
        .clone()
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1", "stepIndex": 4 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_json(response).await;
    assert_eq!(body["operationId"], "op-1");
    assert_eq!(body["stepIndex"], 4);
    assert!(body["error"].as_str().unwrap().contains("executor blew up"));
    assert!(body["executionTime"].is_number());

    // The server keeps answering afterwards
    let health = app
        .oneshot(Request::builder().uri("/agent/run").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_run_reports_schedule_failure() {
    let mut executor = MockExecutor::new();
    executor.schedule_fails = true;
    let (app, _) = app_with(executor, false, None);

    let response = app
        .oneshot(post_json("/agent/run", json!({ "operationId": "op-1" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["scheduleError"], "publish failed");
}

#[tokio::test]
async fn test_management_requires_token() {
    let (app, _) = app_with(MockExecutor::new(), false, Some("secret"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/agent/interventions?userId=user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/agent/interventions?userId=user-1")
                .header("Authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["totalCount"], 0);
}

#[tokio::test]
async fn test_management_routes() {
    let response = app()
        .oneshot(post_json(
            "/agent/operations",
            json!({ "operationId": "op-2", "ownerUserId": "user-1", "autoStart": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(read_json(response).await["autoStarted"], false);

    let response = app()
        .oneshot(post_json(
            "/agent/operations",
            json!({ "operationId": "taken", "ownerUserId": "user-1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app()
        .oneshot(
            Request::builder()
                .uri("/agent/operations/nope?history=true&historyLimit=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app()
        .oneshot(post_json("/agent/operations/op-1/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app()
        .oneshot(post_json(
            "/agent/operations/op-1/intervene",
            json!({ "action": "input", "text": "yes" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["stepIndex"], 3);

    let response = app()
        .oneshot(post_json("/agent/operations/op-1/cancel", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
