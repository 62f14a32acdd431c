// Common test utilities shared by the unit and integration harnesses

#![allow(dead_code)]

use policyshield::core::models::{RuleConfig, RuleSet};
use policyshield::engine::shield::{ShieldEngine, ShieldEngineBuilder};

/// Parse a single rule from YAML, panicking on malformed test input.
pub fn rule(yaml: &str) -> RuleConfig {
    serde_yaml::from_str(yaml).expect("test rule should parse")
}

/// Rule set named `test-shield` v1 with default ALLOW.
pub fn rule_set(rules: Vec<RuleConfig>) -> RuleSet {
    RuleSet::new("test-shield", 1, rules)
}

/// Engine with default components over the given rules.
pub fn engine(rules: Vec<RuleConfig>) -> ShieldEngine {
    ShieldEngineBuilder::from_rule_set(rule_set(rules))
        .build()
        .expect("test engine should build")
}

/// A simple `when.tool` → verdict rule.
pub fn tool_rule(id: &str, tool: &str, then: &str) -> RuleConfig {
    rule(&format!(
        "{{id: {}, when: {{tool: {}}}, then: {}}}",
        id, tool, then
    ))
}
