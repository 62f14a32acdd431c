// Session manager - per-session counters, taints and event buffers

use crate::core::models::{PIIType, Verdict};
use crate::state::events::{EventRingBuffer, ToolEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Mutable per-session state. Owned by the [`SessionManager`],
/// borrowed by checks under the session's own lock.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub tool_counts: HashMap<String, u64>,
    pub total_calls: u64,
    pub taints: HashSet<PIIType>,
    pub pii_tainted: bool,
    pub taint_details: Option<String>,
    pub events: EventRingBuffer,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            last_seen: Instant::now(),
            tool_counts: HashMap::new(),
            total_calls: 0,
            taints: HashSet::new(),
            pii_tainted: false,
            taint_details: None,
            events: EventRingBuffer::default(),
        }
    }

    /// Increment tool call counters.
    pub fn increment(&mut self, tool_name: &str) {
        *self.tool_counts.entry(tool_name.to_string()).or_insert(0) += 1;
        self.total_calls += 1;
    }

    /// Record a PII taint on the session.
    pub fn add_taint(&mut self, pii_type: PIIType) {
        self.taints.insert(pii_type);
        self.pii_tainted = true;
        self.taint_details = Some(format!("PII detected: {}", pii_type.as_str()));
    }

    /// Clear PII taint from the session.
    pub fn clear_taint(&mut self) {
        self.taints.clear();
        self.pii_tainted = false;
        self.taint_details = None;
    }
}

/// Read-copy of session state used for rule condition evaluation.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub total_calls: u64,
    pub tool_counts: HashMap<String, u64>,
    pub taints: Vec<PIIType>,
    pub pii_tainted: bool,
    pub taint_details: Option<String>,
    pub events: Vec<ToolEvent>,
}

impl SessionSnapshot {
    /// Resolve a `when.session` key. `total_calls` and
    /// `tool_count.<name>` are supported; a missing counter is 0.
    pub fn counter(&self, key: &str) -> f64 {
        if key == "total_calls" {
            return self.total_calls as f64;
        }
        if let Some(tool) = key.strip_prefix("tool_count.") {
            return self.tool_counts.get(tool).copied().unwrap_or(0) as f64;
        }
        0.0
    }
}

/// Concurrent map from session id to session state. The map itself is
/// sharded (dashmap); mutation goes through each session's own mutex.
pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
    idle_ttl: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl SessionManager {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::new(session_id))));
        Arc::clone(entry.value())
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    fn lock(state: &Arc<Mutex<SessionState>>) -> MutexGuard<'_, SessionState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read-copy of the session for condition evaluation.
    pub fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        let state = self.get_or_create(session_id);
        let mut guard = Self::lock(&state);
        guard.last_seen = Instant::now();
        SessionSnapshot {
            total_calls: guard.total_calls,
            tool_counts: guard.tool_counts.clone(),
            taints: guard.taints.iter().copied().collect(),
            pii_tainted: guard.pii_tainted,
            taint_details: guard.taint_details.clone(),
            events: guard.events.snapshot(),
        }
    }

    pub fn increment(&self, session_id: &str, tool_name: &str) {
        let state = self.get_or_create(session_id);
        let mut guard = Self::lock(&state);
        guard.last_seen = Instant::now();
        guard.increment(tool_name);
    }

    pub fn add_taint(&self, session_id: &str, pii_type: PIIType) {
        let state = self.get_or_create(session_id);
        Self::lock(&state).add_taint(pii_type);
    }

    /// Clear a session's taint. Returns false when the session is unknown.
    pub fn clear_taint(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(state) => {
                Self::lock(&state).clear_taint();
                true
            }
            None => false,
        }
    }

    pub fn record_event(&self, session_id: &str, tool_name: &str, verdict: Verdict) {
        let state = self.get_or_create(session_id);
        let mut guard = Self::lock(&state);
        guard.last_seen = Instant::now();
        guard.events.add(tool_name, verdict);
    }

    /// Evict sessions idle longer than the configured TTL.
    /// Returns the number of evicted sessions.
    pub fn sweep_idle(&self) -> usize {
        let ttl = self.idle_ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, state| {
            let guard = state.lock().unwrap_or_else(|p| p.into_inner());
            guard.last_seen.elapsed() < ttl
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
