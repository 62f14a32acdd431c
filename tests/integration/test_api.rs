// Integration tests for the HTTP API using in-process requests

use super::common::{rule_set, tool_rule};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use policyshield::api::{create_router, AppState};
use policyshield::approval::memory::InMemoryBackend;
use policyshield::config::ShieldConfig;
use policyshield::engine::shield::{ShieldEngine, ShieldEngineBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::ServiceExt;

fn test_engine() -> ShieldEngine {
    ShieldEngineBuilder::from_rule_set(rule_set(vec![tool_rule("block-exec", "exec", "BLOCK")]))
        .approval_backend(Arc::new(InMemoryBackend::new()))
        .approval_wait(false)
        .build()
        .unwrap()
}

fn test_app() -> Router {
    create_router(AppState::new(test_engine(), ShieldConfig::test_config()))
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_public_and_reports_rules() {
    let app = test_app();
    let response = app.oneshot(get("/api/v1/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["shield_name"], "test-shield");
    assert_eq!(body["rules_count"], 1);
    assert_eq!(body["rules_hash"].as_str().unwrap().len(), 16);
}

#[tokio::test]
async fn check_returns_block_verdict() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "exec", "args": {"cmd": "rm -rf /"}, "session_id": "s1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["verdict"], "BLOCK");
    assert_eq!(body["rule_id"], "block-exec");
    assert!(!body["request_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn check_echoes_client_request_id() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "read_file", "request_id": "req-42"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "ALLOW");
    assert_eq!(body["request_id"], "req-42");
}

#[tokio::test]
async fn invalid_tool_name_is_a_validation_error() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "no spaces allowed"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn deep_args_are_rejected() {
    let mut args = json!("leaf");
    for _ in 0..12 {
        args = json!({ "nested": args });
    }
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "read_file", "args": args}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn kill_switch_round_trip() {
    let app = test_app();

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/kill", json!({"reason": "drill"})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "killed");
    assert_eq!(body["reason"], "drill");

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "read_file"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "BLOCK");
    assert_eq!(body["rule_id"], "__kill_switch__");
    assert!(body["message"].as_str().unwrap().contains("drill"));

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/resume", json!({})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "resumed");

    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "read_file"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "ALLOW");
}

#[tokio::test]
async fn status_reflects_kill_state() {
    let app = test_app();
    let response = app.clone().oneshot(get("/api/v1/status")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "running");
    assert_eq!(body["killed"], false);
    assert_eq!(body["rules_count"], 1);
}

#[tokio::test]
async fn constraints_summarize_the_policy() {
    let app = test_app();
    let response = app.oneshot(get("/api/v1/constraints")).await.unwrap();
    let body = body_json(response).await;
    assert!(body["summary"].as_str().unwrap().contains("block-exec"));
}

#[tokio::test]
async fn bearer_auth_guards_everything_but_health() {
    let engine = test_engine();
    let state = AppState {
        engine,
        config: Arc::new(ShieldConfig::test_config()),
        api_token: Some("sekrit".to_string()),
        check_semaphore: Arc::new(Semaphore::new(4)),
    };
    let app = create_router(state);

    // Health stays public
    let response = app.clone().oneshot(get("/api/v1/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // No token → 401
    let response = app
        .clone()
        .oneshot(post_json("/api/v1/check", json!({"tool_name": "t"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong token → 403
    let mut request = post_json("/api/v1/check", json!({"tool_name": "t"}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer wrong".parse().unwrap(),
    );
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Correct token → 200
    let mut request = post_json("/api/v1/check", json!({"tool_name": "t"}));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer sekrit".parse().unwrap(),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn overloaded_check_returns_block_503() {
    let state = AppState {
        engine: test_engine(),
        config: Arc::new(ShieldConfig::test_config()),
        api_token: None,
        check_semaphore: Arc::new(Semaphore::new(0)),
    };
    let app = create_router(state);

    let response = app
        .oneshot(post_json("/api/v1/check", json!({"tool_name": "t"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "BLOCK");
    assert_eq!(body["error"], "server_overloaded");
}

#[tokio::test]
async fn approval_flow_over_the_api() {
    let engine = ShieldEngineBuilder::from_rule_set(rule_set(vec![super::common::rule(
        "{id: approve-delete, when: {tool: delete}, then: APPROVE, approval_strategy: per_rule}",
    )]))
    .approval_backend(Arc::new(InMemoryBackend::new()))
    .approval_wait(false)
    .build()
    .unwrap();
    let app = create_router(AppState::new(engine, ShieldConfig::test_config()));

    // Check returns a pending APPROVE
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "delete", "session_id": "s1"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "APPROVE");
    let approval_id = body["approval_id"].as_str().unwrap().to_string();

    // It shows up in the pending list
    let response = app
        .clone()
        .oneshot(get("/api/v1/pending-approvals"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["approvals"][0]["approval_id"], approval_id.as_str());
    assert_eq!(body["approvals"][0]["tool_name"], "delete");

    // Status is pending
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/check-approval",
            json!({"approval_id": approval_id}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");

    // Operator approves
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/respond-approval",
            json!({"approval_id": approval_id, "approved": true, "responder": "alice"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");

    // Status flips to approved
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/check-approval",
            json!({"approval_id": approval_id}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "approved");
    assert_eq!(body["responder"], "alice");

    // The cached decision allows the next call instantly
    let response = app
        .oneshot(post_json(
            "/api/v1/check",
            json!({"tool_name": "delete", "session_id": "s1"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["verdict"], "ALLOW");
}

#[tokio::test]
async fn post_check_reports_and_redacts_output_pii() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/post-check",
            json!({
                "tool_name": "web_fetch",
                "result": "reach me at john@example.com",
                "session_id": "s1"
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["pii_types"][0], "EMAIL");
    let redacted = body["redacted_output"].as_str().unwrap();
    assert!(!redacted.contains("john@example.com"));
}

#[tokio::test]
async fn clear_taint_acks_the_session() {
    let app = test_app();
    let response = app
        .oneshot(post_json(
            "/api/v1/clear-taint",
            json!({"session_id": "s1"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["session_id"], "s1");
}

#[tokio::test]
async fn readyz_reports_ready_with_healthy_backend() {
    let app = test_app();
    let response = app.oneshot(get("/readyz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
