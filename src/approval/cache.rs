// Approval cache for batch approve strategies

use crate::approval::ApprovalResponse;
use crate::core::models::ApprovalStrategy;
use std::collections::HashMap;
use std::sync::Mutex;

const GLOBAL_PREFIX: &str = "__global__";

/// Cache for approval decisions to avoid repeated prompts.
///
/// Key scheme per strategy:
/// - `per_session` → `"<session_id>:<rule_id>"`
/// - `per_rule`    → `"__global__:<rule_id>"`
/// - `per_tool`    → `"<session_id>:<tool_name>"`
/// - `once`        → never cached
pub struct ApprovalCache {
    default_strategy: ApprovalStrategy,
    cache: Mutex<HashMap<String, ApprovalResponse>>,
}

impl Default for ApprovalCache {
    fn default() -> Self {
        Self::new(ApprovalStrategy::PerRule)
    }
}

impl ApprovalCache {
    pub fn new(default_strategy: ApprovalStrategy) -> Self {
        Self {
            default_strategy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_strategy(&self) -> ApprovalStrategy {
        self.default_strategy
    }

    fn make_key(
        &self,
        tool_name: &str,
        rule_id: &str,
        session_id: &str,
        strategy: ApprovalStrategy,
    ) -> String {
        match strategy {
            ApprovalStrategy::PerSession => format!("{}:{}", session_id, rule_id),
            ApprovalStrategy::PerRule => format!("{}:{}", GLOBAL_PREFIX, rule_id),
            ApprovalStrategy::PerTool => format!("{}:{}", session_id, tool_name),
            ApprovalStrategy::Once => format!("{}:{}:{}", session_id, rule_id, tool_name),
        }
    }

    /// Cached decision for this combination, if any.
    pub fn get(
        &self,
        tool_name: &str,
        rule_id: &str,
        session_id: &str,
        strategy: Option<ApprovalStrategy>,
    ) -> Option<ApprovalResponse> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        if strategy == ApprovalStrategy::Once {
            return None;
        }
        let key = self.make_key(tool_name, rule_id, session_id, strategy);
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(&key).cloned()
    }

    /// Cache a decision under the strategy's scope.
    pub fn put(
        &self,
        tool_name: &str,
        rule_id: &str,
        session_id: &str,
        response: ApprovalResponse,
        strategy: Option<ApprovalStrategy>,
    ) {
        let strategy = strategy.unwrap_or(self.default_strategy);
        if strategy == ApprovalStrategy::Once {
            return;
        }
        let key = self.make_key(tool_name, rule_id, session_id, strategy);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(key, response);
    }

    /// Clear cached decisions, optionally for one session only.
    /// Global (`per_rule`) entries survive a session-scoped clear.
    pub fn clear(&self, session_id: Option<&str>) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        match session_id {
            None => cache.clear(),
            Some(sid) => {
                let prefix = format!("{}:", sid);
                cache.retain(|key, _| {
                    key.starts_with(&format!("{}:", GLOBAL_PREFIX)) || !key.starts_with(&prefix)
                });
            }
        }
    }

    /// Clear all global (`per_rule`) cached approvals.
    pub fn clear_global(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let prefix = format!("{}:", GLOBAL_PREFIX);
        cache.retain(|key, _| !key.starts_with(&prefix));
    }
}
