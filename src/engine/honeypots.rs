// Honeypot tools - decoy tool names that signal prompt injection
//
// A honeypot is a fake tool that should never be called in normal
// operation. Any call to one is blocked and alerted, even in audit mode.

use crate::core::models::HoneypotConfig;
use std::collections::HashMap;
use tracing::error;

/// Result when a honeypot is triggered.
#[derive(Debug, Clone)]
pub struct HoneypotMatch {
    pub tool_name: String,
    pub message: String,
}

/// Checks tool calls against configured honeypots.
pub struct HoneypotChecker {
    lookup: HashMap<String, HoneypotConfig>,
}

impl HoneypotChecker {
    pub fn new(honeypots: &[HoneypotConfig]) -> Self {
        Self {
            lookup: honeypots
                .iter()
                .map(|h| (h.name.clone(), h.clone()))
                .collect(),
        }
    }

    /// Check if a tool name matches a honeypot.
    pub fn check(&self, tool_name: &str) -> Option<HoneypotMatch> {
        let config = self.lookup.get(tool_name)?;
        let message = config
            .alert
            .clone()
            .unwrap_or_else(|| format!("Honeypot triggered: {}", tool_name));
        error!(
            tool = tool_name,
            severity = config.severity.as_str(),
            alert = %message,
            "HONEYPOT TRIGGERED"
        );
        Some(HoneypotMatch {
            tool_name: tool_name.to_string(),
            message,
        })
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}
