// Approval plane - backend abstraction for out-of-band human decisions

pub mod cache;
pub mod memory;
pub mod sanitizer;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// A request for human approval. `args` are sanitized before leaving
/// the process (secrets masked, values truncated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tool_name: String,
    pub args: Value,
    pub rule_id: String,
    pub message: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Create a new request with a generated id and sanitized args.
    pub fn create(
        tool_name: &str,
        args: &Value,
        rule_id: &str,
        message: &str,
        session_id: &str,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            args: sanitizer::sanitize_args(args),
            rule_id: rule_id.to_string(),
            message: message.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Human response to an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: String,
    pub approved: bool,
    pub responder: String,
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalResponse {
    pub fn new(request_id: &str, approved: bool, responder: &str, comment: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            approved,
            responder: responder.to_string(),
            comment: comment.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Backend health probe result.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendHealth {
    pub fn healthy(latency_ms: f64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: 0.0,
            error: Some(error.into()),
        }
    }
}

/// Capability set implemented by approval delivery backends.
///
/// The contract requires concurrent `submit` and `respond` to be safe;
/// after the first response for a request id, later ones are dropped.
pub trait ApprovalBackend: Send + Sync {
    /// Submit an approval request for out-of-band delivery.
    fn submit(&self, request: ApprovalRequest);

    /// Block until a response arrives or the timeout expires.
    fn wait_for_response(&self, request_id: &str, timeout: Duration) -> Option<ApprovalResponse>;

    /// Deliver a human decision. First response wins.
    fn respond(&self, request_id: &str, approved: bool, responder: &str, comment: &str);

    /// All pending (unanswered) requests.
    fn pending(&self) -> Vec<ApprovalRequest>;

    /// The stored response for a request, if any.
    fn response_for(&self, request_id: &str) -> Option<ApprovalResponse>;

    /// Drop requests older than `ttl` that never got a response.
    fn gc(&self, ttl: Duration) -> usize;

    /// Probe backend health.
    fn health(&self) -> BackendHealth {
        BackendHealth::healthy(0.0)
    }
}
