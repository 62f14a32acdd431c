// Sliding-window rate limiting per tool, per session or global

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn default_window_seconds() -> f64 {
    60.0
}

fn default_per_session() -> bool {
    true
}

fn default_message() -> String {
    "Rate limit exceeded".to_string()
}

/// Configuration for a single rate limit rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Tool name, or `*` for all tools
    pub tool: String,
    pub max_calls: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,
    #[serde(default = "default_per_session")]
    pub per_session: bool,
    #[serde(default = "default_message")]
    pub message: String,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Default)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub tool: String,
    pub limit: u32,
    pub window_seconds: f64,
    pub current_count: u32,
    pub message: String,
}

const GLOBAL_KEY: &str = "__global__";

/// Sliding-window rate limiter.
///
/// Windows are keyed `(tool, session_id)` for per-session limits and
/// `(tool, "__global__")` otherwise. `check` and `record` are split so
/// the engine only counts calls that actually proceed.
pub struct RateLimiter {
    configs: Vec<RateLimitConfig>,
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(configs: Vec<RateLimitConfig>) -> Self {
        Self {
            configs,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn key(config: &RateLimitConfig, session_id: &str) -> (String, String) {
        let scope = if config.per_session {
            session_id.to_string()
        } else {
            GLOBAL_KEY.to_string()
        };
        (config.tool.clone(), scope)
    }

    /// Check whether a tool call is within every applicable limit.
    pub fn check(&self, tool_name: &str, session_id: &str) -> RateLimitResult {
        let now = Instant::now();
        // Degrade to allow if the lock was poisoned
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for config in &self.configs {
            if config.tool != "*" && config.tool != tool_name {
                continue;
            }
            let window = windows.entry(Self::key(config, session_id)).or_default();
            prune(window, now, config.window_seconds);
            let count = window.len() as u32;
            if count >= config.max_calls {
                return RateLimitResult {
                    allowed: false,
                    tool: tool_name.to_string(),
                    limit: config.max_calls,
                    window_seconds: config.window_seconds,
                    current_count: count,
                    message: config.message.clone(),
                };
            }
        }

        RateLimitResult {
            allowed: true,
            tool: tool_name.to_string(),
            ..RateLimitResult::default()
        }
    }

    /// Record a tool call. Called only when the engine intends to count
    /// the call (the verdict is not BLOCK or APPROVE).
    pub fn record(&self, tool_name: &str, session_id: &str) {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for config in &self.configs {
            if config.tool != "*" && config.tool != tool_name {
                continue;
            }
            windows
                .entry(Self::key(config, session_id))
                .or_default()
                .push_back(now);
        }
    }

    /// Reset counters, for one session or all.
    pub fn reset(&self, session_id: Option<&str>) {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match session_id {
            None => windows.clear(),
            Some(sid) => windows.retain(|(_, scope), _| scope != sid),
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, window_seconds: f64) {
    let horizon = Duration::from_secs_f64(window_seconds.max(0.0));
    while let Some(front) = window.front() {
        if now.duration_since(*front) > horizon {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Adaptive variant: when a session's call rate bursts past
/// `base_limit * burst_threshold` inside the window, the effective limit
/// is tightened to `base_limit * tighten_factor` for `cooldown` seconds.
/// Each session adapts independently.
pub struct AdaptiveRateLimiter {
    base_limit: u32,
    window_seconds: f64,
    burst_threshold: f64,
    tighten_factor: f64,
    cooldown: f64,
    state: Mutex<AdaptiveState>,
}

#[derive(Default)]
struct AdaptiveState {
    histories: HashMap<String, VecDeque<Instant>>,
    last_tighten: HashMap<String, Instant>,
}

impl AdaptiveRateLimiter {
    pub fn new(
        base_limit: u32,
        window_seconds: f64,
        burst_threshold: f64,
        tighten_factor: f64,
        cooldown: f64,
    ) -> Self {
        Self {
            base_limit,
            window_seconds,
            burst_threshold,
            tighten_factor,
            cooldown,
            state: Mutex::new(AdaptiveState::default()),
        }
    }

    fn tightened_limit(&self) -> u32 {
        ((self.base_limit as f64) * self.tighten_factor).max(1.0) as u32
    }

    /// The session's current effective limit.
    pub fn session_limit(&self, session_id: &str) -> u32 {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.session_limit_locked(&state, session_id)
    }

    fn session_limit_locked(&self, state: &AdaptiveState, session_id: &str) -> u32 {
        match state.last_tighten.get(session_id) {
            Some(at) if at.elapsed().as_secs_f64() < self.cooldown => self.tightened_limit(),
            _ => self.base_limit,
        }
    }

    /// Record the call, detect bursts, and check the effective limit.
    pub fn check_and_adapt(&self, session_id: &str) -> (bool, String) {
        let now = Instant::now();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let history = state.histories.entry(session_id.to_string()).or_default();
        prune(history, now, self.window_seconds);
        history.push_back(now);
        let count = history.len() as u32;

        let burst_cutoff = ((self.base_limit as f64) * self.burst_threshold) as u32;
        if count > burst_cutoff {
            state.last_tighten.insert(session_id.to_string(), now);
        }

        let limit = self.session_limit_locked(&state, session_id);
        if count > limit {
            return (
                false,
                format!(
                    "Adaptive rate limit exceeded ({} calls, effective limit {})",
                    count, limit
                ),
            );
        }
        (true, String::new())
    }
}
