// Request handlers for API endpoints

use crate::api::responses::*;
use crate::api::AppState;
use axum::{extract::State, Json};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_TOOL_NAME_LENGTH: usize = 256;
const MAX_ARGS_DEPTH: usize = 10;

fn tool_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[\w.\-:]+$").unwrap_or_else(|e| panic!("tool name pattern invalid: {}", e))
    })
}

fn request_id_or_new(explicit: Option<&str>) -> String {
    match explicit {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

fn validate_tool_name(tool_name: &str) -> Result<(), ApiError> {
    if tool_name.is_empty() || tool_name.len() > MAX_TOOL_NAME_LENGTH {
        return Err(ApiError::validation("tool_name length out of range"));
    }
    if !tool_name_pattern().is_match(tool_name) {
        return Err(ApiError::validation(
            "tool_name may only contain word characters, '.', '-' and ':'",
        ));
    }
    Ok(())
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn validate_args_depth(args: &Value) -> Result<(), ApiError> {
    if value_depth(args) > MAX_ARGS_DEPTH {
        return Err(ApiError::validation("args nesting exceeds max depth"));
    }
    Ok(())
}

/// POST /api/v1/check — the main verdict endpoint.
///
/// A semaphore bounds concurrent checks; overflow returns 503 with
/// `{verdict: BLOCK, error: server_overloaded}`.
pub async fn check_handler(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let request_id = request_id_or_new(request.request_id.as_deref());
    validate_tool_name(&request.tool_name)?;
    let args = Value::Object(request.args.clone());
    validate_args_depth(&args)?;
    if request.session_id.is_empty() || request.session_id.len() > 256 {
        return Err(ApiError::validation("session_id length out of range"));
    }

    let Ok(_permit) = state.check_semaphore.clone().try_acquire_owned() else {
        warn!(request_id = %request_id, "Concurrent check limit reached");
        return Err(ApiError::overloaded());
    };

    info!(
        tool = %request.tool_name,
        session_id = %request.session_id,
        request_id = %request_id,
        "Received check request"
    );

    let result = state
        .engine
        .check_async(
            request.tool_name.clone(),
            args,
            request.session_id.clone(),
            request.sender.clone(),
            request.context.clone(),
        )
        .await;

    Ok(Json(CheckResponse {
        verdict: result.verdict.as_str().to_string(),
        message: result.message,
        rule_id: result.rule_id,
        modified_args: result.modified_args,
        pii_types: result
            .pii_matches
            .iter()
            .map(|m| m.pii_type.as_str().to_string())
            .collect(),
        approval_id: result.approval_id,
        shield_version: env!("CARGO_PKG_VERSION").to_string(),
        request_id,
    }))
}

/// POST /api/v1/post-check — scan tool output for PII.
pub async fn post_check_handler(
    State(state): State<AppState>,
    Json(request): Json<PostCheckRequest>,
) -> Result<Json<PostCheckResponse>, ApiError> {
    let request_id = request_id_or_new(request.request_id.as_deref());
    validate_tool_name(&request.tool_name)?;
    validate_args_depth(&request.result)?;

    let result = state
        .engine
        .post_check_async(
            request.tool_name.clone(),
            request.result.clone(),
            request.session_id.clone(),
        )
        .await;

    Ok(Json(PostCheckResponse {
        pii_types: result
            .pii_matches
            .iter()
            .map(|m| m.pii_type.as_str().to_string())
            .collect(),
        redacted_output: result
            .modified_args
            .and_then(|v| v.as_str().map(|s| s.to_string())),
        request_id,
    }))
}

/// GET /api/v1/health — always public.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        shield_name: state.engine.shield_name(),
        version: state.engine.rules_version(),
        rules_count: state.engine.rule_count(),
        mode: state.engine.mode().as_str().to_string(),
        rules_hash: state.engine.rules_hash(),
    })
}

/// GET /readyz — 200 when the approval backend is healthy, else 503.
pub async fn readyz_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    // The probe may do blocking I/O (webhook backends)
    let engine = state.engine.clone();
    let health = tokio::task::spawn_blocking(move || engine.approval_backend_health())
        .await
        .map_err(|e| ApiError::not_ready(&e.to_string()))?;
    match health {
        Some(health) if !health.healthy => Err(ApiError::not_ready(
            health.error.as_deref().unwrap_or("approval backend unhealthy"),
        )),
        _ => Ok(Json(serde_json::json!({"status": "ready"}))),
    }
}

/// GET /api/v1/status
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running".to_string(),
        killed: state.engine.is_killed(),
        mode: state.engine.mode().as_str().to_string(),
        rules_count: state.engine.rule_count(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/v1/reload — reload rules from disk; on failure the
/// previous rule set stays active.
pub async fn reload_handler(
    State(state): State<AppState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let engine = state.engine.clone();
    let reloaded = tokio::task::spawn_blocking(move || engine.reload_rules(None))
        .await
        .map_err(|e| ApiError::internal(state.engine.fail_open(), &e.to_string()))?;

    match reloaded {
        Ok(count) => Ok(Json(ReloadResponse {
            status: "ok".to_string(),
            rules_count: count,
            rules_hash: state.engine.rules_hash(),
        })),
        Err(e) => {
            warn!(error = %e, "Rule reload failed; keeping previous rule set");
            Err(ApiError::internal(state.engine.fail_open(), &e.to_string()))
        }
    }
}

/// POST /api/v1/kill — force every check to BLOCK until resumed.
pub async fn kill_handler(
    State(state): State<AppState>,
    Json(request): Json<KillSwitchRequest>,
) -> Json<KillSwitchResponse> {
    state.engine.kill(&request.reason);
    Json(KillSwitchResponse {
        status: "killed".to_string(),
        reason: request.reason,
    })
}

/// POST /api/v1/resume
pub async fn resume_handler(State(state): State<AppState>) -> Json<ResumeResponse> {
    state.engine.resume();
    Json(ResumeResponse {
        status: "resumed".to_string(),
    })
}

/// GET /api/v1/constraints — textual policy summary.
pub async fn constraints_handler(State(state): State<AppState>) -> Json<ConstraintsResponse> {
    Json(ConstraintsResponse {
        summary: state.engine.policy_summary(),
    })
}

/// POST /api/v1/check-approval
pub async fn check_approval_handler(
    State(state): State<AppState>,
    Json(request): Json<ApprovalStatusRequest>,
) -> Json<ApprovalStatusResponse> {
    use crate::engine::shield::ApprovalStatus;
    let status = state.engine.approval_status(&request.approval_id);
    let responder = match &status {
        ApprovalStatus::Approved { responder } | ApprovalStatus::Denied { responder }
            if !responder.is_empty() =>
        {
            Some(responder.clone())
        }
        _ => None,
    };
    Json(ApprovalStatusResponse {
        approval_id: request.approval_id,
        status: status.as_str().to_string(),
        responder,
    })
}

/// POST /api/v1/respond-approval — deliver an operator decision.
pub async fn respond_approval_handler(
    State(state): State<AppState>,
    Json(request): Json<RespondApprovalRequest>,
) -> Result<Json<RespondApprovalResponse>, ApiError> {
    state
        .engine
        .respond_approval(
            &request.approval_id,
            request.approved,
            &request.responder,
            &request.comment,
        )
        .map_err(|e| ApiError::internal(state.engine.fail_open(), &e.user_message()))?;
    info!(
        approval_id = %request.approval_id,
        approved = request.approved,
        responder = %request.responder,
        "Approval response recorded"
    );
    Ok(Json(RespondApprovalResponse {
        status: "ok".to_string(),
        approval_id: request.approval_id,
    }))
}

/// GET /api/v1/pending-approvals
pub async fn pending_approvals_handler(
    State(state): State<AppState>,
) -> Json<PendingApprovalsResponse> {
    let approvals = state
        .engine
        .pending_approvals()
        .into_iter()
        .map(|r| PendingApprovalItem {
            approval_id: r.request_id,
            tool_name: r.tool_name,
            rule_id: r.rule_id,
            message: r.message,
            session_id: r.session_id,
            args: r.args,
        })
        .collect();
    Json(PendingApprovalsResponse { approvals })
}

/// POST /api/v1/clear-taint — re-enable outgoing calls for a session.
pub async fn clear_taint_handler(
    State(state): State<AppState>,
    Json(request): Json<ClearTaintRequest>,
) -> Json<ClearTaintResponse> {
    state.engine.sessions().clear_taint(&request.session_id);
    Json(ClearTaintResponse {
        status: "ok".to_string(),
        session_id: request.session_id,
    })
}

/// Spawn the periodic janitors: session eviction, approval GC, trace
/// flush and retention sweeps.
pub fn spawn_background_tasks(state: &AppState) {
    let engine = state.engine.clone();
    let gc_ttl = Duration::from_secs_f64(state.config.approval.gc_ttl.max(1.0));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            engine.sessions().sweep_idle();
            engine.approval_gc(gc_ttl);
            engine.flush_traces();
        }
    });

    let engine = state.engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            engine.sweep_traces();
        }
    });
}
