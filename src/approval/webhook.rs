// Webhook approval backend - HTTP delivery with HMAC-SHA256 signing
//
// Two modes:
// - sync: POST, expect an immediate {"approved": bool, "reason": "..."} reply
// - poll: POST, receive {"poll_url": "..."}, then GET-poll until a
//   terminal {"status": "approved"|"denied"} appears or the deadline passes

use crate::approval::{ApprovalBackend, ApprovalRequest, ApprovalResponse, BackendHealth};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Compute the `X-PolicyShield-Signature` value for a payload:
/// `sha256=<hex of HMAC-SHA256(secret, payload)>`.
pub fn compute_signature(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a signature header value.
pub fn verify_signature(payload: &[u8], secret: &str, signature: &str) -> bool {
    let expected = compute_signature(payload, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Delivery mode for the webhook backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMode {
    Sync,
    Poll,
}

/// Configuration for [`WebhookBackend`].
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub mode: WebhookMode,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl WebhookConfig {
    pub fn sync(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            mode: WebhookMode::Sync,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct Inner {
    requests: HashMap<String, ApprovalRequest>,
    submitted_at: HashMap<String, Instant>,
    responses: HashMap<String, ApprovalResponse>,
}

/// Send approval requests to an HTTP webhook. The request is resolved
/// during `submit`; `wait_for_response` returns the stored outcome.
pub struct WebhookBackend {
    config: WebhookConfig,
    client: reqwest::blocking::Client,
    inner: Mutex<Inner>,
}

impl WebhookBackend {
    pub fn new(config: WebhookConfig) -> Result<Self, crate::core::errors::ShieldError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                crate::core::errors::ShieldError::Configuration(format!(
                    "Failed to build webhook client: {}",
                    e
                ))
            })?;
        Ok(Self {
            config,
            client,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn build_payload(request: &ApprovalRequest) -> Value {
        json!({
            "request_id": request.request_id,
            "tool": request.tool_name,
            "args": request.args,
            "rule_id": request.rule_id,
            "message": request.message,
            "session_id": request.session_id,
            "timestamp": request.timestamp.to_rfc3339(),
        })
    }

    fn post_payload(&self, body: &[u8]) -> Result<Value, String> {
        let mut post = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        if let Some(secret) = &self.config.secret {
            post = post.header("X-PolicyShield-Signature", compute_signature(body, secret));
        }

        let response = post.send().map_err(|e| format!("webhook error: {}", e))?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(format!("webhook error: HTTP {}", status.as_u16()));
        }
        response
            .json::<Value>()
            .map_err(|e| format!("webhook error: invalid JSON: {}", e))
    }

    fn denial(request_id: &str, comment: String) -> ApprovalResponse {
        ApprovalResponse::new(request_id, false, "", &comment)
    }

    fn sync_request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let body = match serde_json::to_vec(&Self::build_payload(request)) {
            Ok(body) => body,
            Err(e) => return Self::denial(&request.request_id, format!("webhook error: {}", e)),
        };
        match self.post_payload(&body) {
            Ok(data) => ApprovalResponse::new(
                &request.request_id,
                data.get("approved").and_then(Value::as_bool).unwrap_or(false),
                "",
                data.get("reason").and_then(Value::as_str).unwrap_or(""),
            ),
            Err(comment) => {
                warn!(request_id = %request.request_id, error = %comment, "Webhook request failed");
                Self::denial(&request.request_id, comment)
            }
        }
    }

    fn poll_request(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let body = match serde_json::to_vec(&Self::build_payload(request)) {
            Ok(body) => body,
            Err(e) => return Self::denial(&request.request_id, format!("webhook error: {}", e)),
        };
        let poll_url = match self.post_payload(&body) {
            Ok(data) => match data.get("poll_url").and_then(Value::as_str) {
                Some(url) => url.to_string(),
                None => {
                    return Self::denial(
                        &request.request_id,
                        "webhook error: no poll_url in response".to_string(),
                    )
                }
            },
            Err(comment) => return Self::denial(&request.request_id, comment),
        };

        let deadline = Instant::now() + self.config.poll_timeout;
        while Instant::now() < deadline {
            match self
                .client
                .get(&poll_url)
                .send()
                .and_then(|r| r.json::<Value>())
            {
                Ok(data) => {
                    let reason = data
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    match data.get("status").and_then(Value::as_str) {
                        Some("approved") => {
                            return ApprovalResponse::new(&request.request_id, true, "", &reason)
                        }
                        Some("denied") => {
                            return ApprovalResponse::new(&request.request_id, false, "", &reason)
                        }
                        _ => {}
                    }
                }
                Err(e) => warn!(error = %e, "Poll request failed"),
            }
            std::thread::sleep(self.config.poll_interval);
        }

        Self::denial(&request.request_id, "poll timeout".to_string())
    }
}

impl ApprovalBackend for WebhookBackend {
    fn submit(&self, request: ApprovalRequest) {
        {
            let mut inner = self.lock();
            inner
                .submitted_at
                .insert(request.request_id.clone(), Instant::now());
            inner
                .requests
                .insert(request.request_id.clone(), request.clone());
        }

        let response = match self.config.mode {
            WebhookMode::Sync => self.sync_request(&request),
            WebhookMode::Poll => self.poll_request(&request),
        };

        let mut inner = self.lock();
        inner
            .responses
            .entry(request.request_id.clone())
            .or_insert(response);
    }

    fn wait_for_response(&self, request_id: &str, _timeout: Duration) -> Option<ApprovalResponse> {
        // Already resolved during submit
        self.lock().responses.get(request_id).cloned()
    }

    fn respond(&self, request_id: &str, approved: bool, responder: &str, comment: &str) {
        // External callback path; first response wins
        let mut inner = self.lock();
        if inner.responses.contains_key(request_id) {
            return;
        }
        inner.responses.insert(
            request_id.to_string(),
            ApprovalResponse::new(request_id, approved, responder, comment),
        );
        inner.requests.remove(request_id);
    }

    fn pending(&self) -> Vec<ApprovalRequest> {
        let inner = self.lock();
        inner
            .requests
            .values()
            .filter(|r| !inner.responses.contains_key(&r.request_id))
            .cloned()
            .collect()
    }

    fn response_for(&self, request_id: &str) -> Option<ApprovalResponse> {
        self.lock().responses.get(request_id).cloned()
    }

    fn gc(&self, ttl: Duration) -> usize {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .submitted_at
            .iter()
            .filter(|(_, at)| at.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.requests.remove(id);
            inner.submitted_at.remove(id);
        }
        stale.len()
    }

    fn health(&self) -> BackendHealth {
        let started = Instant::now();
        match self.client.head(&self.config.url).send() {
            Ok(_) => BackendHealth::healthy(started.elapsed().as_secs_f64() * 1000.0),
            Err(e) => BackendHealth::unhealthy(e.to_string()),
        }
    }
}
