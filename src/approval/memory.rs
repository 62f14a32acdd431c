// In-memory approval backend - ground truth for tests and embedded use

use crate::approval::{ApprovalBackend, ApprovalRequest, ApprovalResponse, BackendHealth};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    requests: HashMap<String, ApprovalRequest>,
    submitted_at: HashMap<String, Instant>,
    responses: HashMap<String, ApprovalResponse>,
}

/// In-memory approval backend using a condvar for blocking waits.
#[derive(Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    notify: Condvar,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl ApprovalBackend for InMemoryBackend {
    fn submit(&self, request: ApprovalRequest) {
        let mut inner = self.lock();
        inner
            .submitted_at
            .insert(request.request_id.clone(), Instant::now());
        inner.requests.insert(request.request_id.clone(), request);
    }

    fn wait_for_response(&self, request_id: &str, timeout: Duration) -> Option<ApprovalResponse> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(response) = inner.responses.get(request_id) {
                return Some(response.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self
                .notify
                .wait_timeout(inner, remaining)
                .unwrap_or_else(|p| p.into_inner());
            inner = guard;
            if result.timed_out() && !inner.responses.contains_key(request_id) {
                return None;
            }
        }
    }

    fn respond(&self, request_id: &str, approved: bool, responder: &str, comment: &str) {
        let mut inner = self.lock();
        // First response wins; later ones are silently dropped
        if inner.responses.contains_key(request_id) {
            return;
        }
        inner.responses.insert(
            request_id.to_string(),
            ApprovalResponse::new(request_id, approved, responder, comment),
        );
        inner.requests.remove(request_id);
        inner.submitted_at.remove(request_id);
        drop(inner);
        self.notify.notify_all();
    }

    fn pending(&self) -> Vec<ApprovalRequest> {
        self.lock().requests.values().cloned().collect()
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
        drop(self.lock());
        BackendHealth::healthy(started.elapsed().as_secs_f64() * 1000.0)
    }
}
