// Request and response types for API endpoints

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_session() -> String {
    "default".to_string()
}

/// Request body for POST /api/v1/check.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub tool_name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default = "default_session")]
    pub session_id: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
}

/// Response body for POST /api/v1/check.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub verdict: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pii_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    pub shield_version: String,
    pub request_id: String,
}

/// Request body for POST /api/v1/post-check.
#[derive(Debug, Clone, Deserialize)]
pub struct PostCheckRequest {
    pub tool_name: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default = "default_session")]
    pub session_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Response body for POST /api/v1/post-check.
#[derive(Debug, Serialize)]
pub struct PostCheckResponse {
    pub pii_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacted_output: Option<String>,
    pub request_id: String,
}

/// Response body for GET /api/v1/health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub shield_name: String,
    pub version: i64,
    pub rules_count: usize,
    pub mode: String,
    pub rules_hash: String,
}

/// Response body for GET /api/v1/status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub killed: bool,
    pub mode: String,
    pub rules_count: usize,
    pub version: String,
}

/// Response body for POST /api/v1/reload.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub status: String,
    pub rules_count: usize,
    pub rules_hash: String,
}

/// Response body for GET /api/v1/constraints.
#[derive(Debug, Serialize)]
pub struct ConstraintsResponse {
    pub summary: String,
}

/// Request body for POST /api/v1/kill.
#[derive(Debug, Deserialize)]
pub struct KillSwitchRequest {
    #[serde(default = "default_kill_reason")]
    pub reason: String,
}

fn default_kill_reason() -> String {
    "Kill switch activated via API".to_string()
}

/// Response body for POST /api/v1/kill.
#[derive(Debug, Serialize)]
pub struct KillSwitchResponse {
    pub status: String,
    pub reason: String,
}

/// Response body for POST /api/v1/resume.
#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub status: String,
}

/// Request body for POST /api/v1/check-approval.
#[derive(Debug, Deserialize)]
pub struct ApprovalStatusRequest {
    pub approval_id: String,
}

/// Response body for POST /api/v1/check-approval.
#[derive(Debug, Serialize)]
pub struct ApprovalStatusResponse {
    pub approval_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
}

/// Request body for POST /api/v1/respond-approval.
#[derive(Debug, Deserialize)]
pub struct RespondApprovalRequest {
    pub approval_id: String,
    pub approved: bool,
    #[serde(default)]
    pub responder: String,
    #[serde(default)]
    pub comment: String,
}

/// Response body for POST /api/v1/respond-approval.
#[derive(Debug, Serialize)]
pub struct RespondApprovalResponse {
    pub status: String,
    pub approval_id: String,
}

/// A single pending approval in the list.
#[derive(Debug, Serialize)]
pub struct PendingApprovalItem {
    pub approval_id: String,
    pub tool_name: String,
    pub rule_id: String,
    pub message: String,
    pub session_id: String,
    pub args: Value,
}

/// Response body for GET /api/v1/pending-approvals.
#[derive(Debug, Serialize)]
pub struct PendingApprovalsResponse {
    pub approvals: Vec<PendingApprovalItem>,
}

/// Request body for POST /api/v1/clear-taint.
#[derive(Debug, Deserialize)]
pub struct ClearTaintRequest {
    pub session_id: String,
}

/// Response body for POST /api/v1/clear-taint.
#[derive(Debug, Serialize)]
pub struct ClearTaintResponse {
    pub status: String,
    pub session_id: String,
}

/// API error that renders as a JSON body. Error bodies carry a
/// `verdict` field wherever a caller might act on the response, so
/// clients never have to parse bare HTML errors.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: serde_json::json!({"error": "unauthorized", "detail": message}),
        }
    }

    pub fn forbidden(message: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            body: serde_json::json!({"error": "forbidden", "detail": message}),
        }
    }

    pub fn validation(detail: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: serde_json::json!({"error": "validation_error", "detail": detail}),
        }
    }

    pub fn overloaded() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: serde_json::json!({"verdict": "BLOCK", "error": "server_overloaded"}),
        }
    }

    pub fn not_ready(detail: &str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: serde_json::json!({"status": "not_ready", "detail": detail}),
        }
    }

    /// Internal failure; the verdict follows the fail-open policy.
    pub fn internal(fail_open: bool, detail: &str) -> Self {
        let verdict = if fail_open { "ALLOW" } else { "BLOCK" };
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: serde_json::json!({"verdict": verdict, "error": "internal_error", "detail": detail}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
