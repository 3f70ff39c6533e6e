//! The HTTP entry point wired to a real executor

mod common;

use api_server::{router, ServerOptions};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{calling, text, Harness};
use ed25519_dalek::SigningKey;
use sdk::handles::{
    ExecutorHandle, ExecutorHandleImpl, OperationsHandle, OperationsHandleImpl, RunContext,
    VerifierHandle, VerifierHandleImpl,
};
use sdk::types::ToolCall;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower::ServiceExt;
use waypoint_engine::crypto::{sign_payload, SignatureVerifier};
use waypoint_engine::service::OperationService;

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn app(h: Harness, verifier: SignatureVerifier) -> (Router, Arc<Harness>) {
    let h = Arc::new(h);
    let executor: Arc<dyn ExecutorHandleImpl> = Arc::clone(&h.executor) as _;
    let service: Arc<dyn OperationsHandleImpl> =
        Arc::new(OperationService::new(Arc::clone(&h.executor)));
    let verifier: Arc<dyn VerifierHandleImpl> = Arc::new(verifier);

    let ctx = RunContext::new(
        ExecutorHandle::new(executor),
        OperationsHandle::new(service),
        VerifierHandle::new(verifier),
    );
    (
        router(ctx, ServerOptions::default(), Arc::new(AtomicBool::new(false))),
        h,
    )
}

fn signed(body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let header = sign_payload(&signing_key(), raw.as_bytes(), chrono::Utc::now().timestamp());
    Request::builder()
        .method("POST")
        .uri("/agent/run")
        .header("content-type", "application/json")
        .header("x-scheduler-signature", header)
        .body(Body::from(raw))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_signed_delivery_runs_step() {
    let h = Harness::new(vec![text("hi", 0.0)]).await;
    h.create("op-1").await;
    let verifier = SignatureVerifier::new(Some(signing_key().verifying_key()), None, 300);
    let (app, _h) = app(h, verifier);

    let response = app
        .oneshot(signed(&json!({ "operationId": "op-1", "stepIndex": 0 })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "running");
    assert_eq!(body["totalSteps"], 1);
    assert_eq!(body["nextStepScheduled"], true);
    assert_eq!(body["nextStepIndex"], 1);
}

#[tokio::test]
async fn test_tampered_body_is_rejected() {
    let h = Harness::new(vec![text("hi", 0.0)]).await;
    h.create("op-1").await;
    let verifier = SignatureVerifier::new(Some(signing_key().verifying_key()), None, 300);
    let (app, h) = app(h, verifier);

    let mut request = signed(&json!({ "operationId": "op-1", "stepIndex": 0 }));
    *request.body_mut() = Body::from(json!({ "operationId": "op-1", "stepIndex": 1 }).to_string());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn test_gate_reported_and_mismatch_is_bad_request() {
    let h = Harness::new(vec![calling(
        vec![ToolCall::new("c1", "deploy", "{}")],
        0.0,
    )])
    .await;
    h.create("op-g").await;
    let (app, h) = app(h, SignatureVerifier::disabled());

    let first = app
        .clone()
        .oneshot(signed(&json!({ "operationId": "op-g", "stepIndex": 0 })))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let continuation = serde_json::to_value(h.scheduler.last().request).unwrap();
    let gated = json_body(app.clone().oneshot(signed(&continuation)).await.unwrap()).await;
    assert_eq!(gated["waitingForHuman"], true);
    assert_eq!(gated["pendingApproval"][0]["apiName"], "deploy");

    let response = app
        .oneshot(signed(&json!({
            "operationId": "op-g",
            "stepIndex": 2,
            "humanInput": "go ahead"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["operationId"], "op-g");
    assert_eq!(body["stepIndex"], 2);
}

#[tokio::test]
async fn test_unknown_operation_is_unauthorized() {
    let h = Harness::new(vec![]).await;
    let (app, _h) = app(h, SignatureVerifier::disabled());

    let response = app
        .oneshot(signed(&json!({ "operationId": "nobody", "stepIndex": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
