// Bounded time-ordered event buffer, consulted by chain rules

use crate::core::models::Verdict;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default per-session event capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A single recorded tool call.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub timestamp: Instant,
    pub tool: String,
    pub verdict: Verdict,
}

/// Per-session bounded ring of tool events. Append-only; the oldest
/// events are dropped when the buffer is full.
#[derive(Debug)]
pub struct EventRingBuffer {
    events: VecDeque<ToolEvent>,
    capacity: usize,
}

impl Default for EventRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, dropping the oldest on overflow.
    pub fn add(&mut self, tool: &str, verdict: Verdict) {
        self.add_at(Instant::now(), tool, verdict);
    }

    /// Append with an explicit timestamp (tests pin the clock).
    pub fn add_at(&mut self, timestamp: Instant, tool: &str, verdict: Verdict) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(ToolEvent {
            timestamp,
            tool: tool.to_string(),
            verdict,
        });
    }

    /// Events for `tool` newer than `now - within`, optionally filtered by verdict.
    pub fn find_recent(
        &self,
        tool: &str,
        within: Duration,
        verdict: Option<Verdict>,
    ) -> Vec<&ToolEvent> {
        let now = Instant::now();
        self.events
            .iter()
            .filter(|e| event_matches(e, tool, within, verdict, now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Read-copy of the buffer for lock-free condition evaluation.
    pub fn snapshot(&self) -> Vec<ToolEvent> {
        self.events.iter().cloned().collect()
    }
}

fn event_matches(
    event: &ToolEvent,
    tool: &str,
    within: Duration,
    verdict: Option<Verdict>,
    now: Instant,
) -> bool {
    if event.tool != tool {
        return false;
    }
    if let Some(v) = verdict {
        if event.verdict != v {
            return false;
        }
    }
    now.duration_since(event.timestamp) <= within
}

/// Count matching events in a snapshot slice, with an explicit `now`
/// so the matcher evaluates every chain step against one instant.
pub fn count_recent(
    events: &[ToolEvent],
    tool: &str,
    within: Duration,
    verdict: Option<Verdict>,
    now: Instant,
) -> usize {
    events
        .iter()
        .filter(|e| event_matches(e, tool, within, verdict, now))
        .count()
}
