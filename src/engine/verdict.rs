// Verdict builder - constructs ShieldResult with counterexample messages
//
// Counterexamples tell the calling agent what went wrong and how to fix
// it, so it can repair its call instead of retrying blindly.

use crate::core::models::{PIIMatch, RuleConfig, ShieldResult, Verdict};
use serde_json::Value;
use std::collections::BTreeSet;

fn default_suggestion(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Block => {
            "Consider using a safer alternative or requesting elevated permissions."
        }
        Verdict::Approve => "This action requires human approval before proceeding.",
        Verdict::Redact => "PII was detected and will be redacted from the arguments.",
        Verdict::Allow => "",
    }
}

/// Builds [`ShieldResult`] objects with structured counterexamples.
pub struct VerdictBuilder;

impl VerdictBuilder {
    pub fn allow(rule: Option<&RuleConfig>, args: Option<&Value>) -> ShieldResult {
        ShieldResult {
            verdict: Verdict::Allow,
            rule_id: rule.map(|r| r.id.clone()),
            message: "Tool call allowed.".to_string(),
            pii_matches: Vec::new(),
            original_args: args.cloned(),
            modified_args: None,
            approval_id: None,
        }
    }

    pub fn block(
        rule: &RuleConfig,
        tool_name: &str,
        args: Option<&Value>,
        pii_matches: Vec<PIIMatch>,
    ) -> ShieldResult {
        let message = Self::format_counterexample(Verdict::Block, rule, tool_name, &pii_matches);
        ShieldResult {
            verdict: Verdict::Block,
            rule_id: Some(rule.id.clone()),
            message,
            pii_matches,
            original_args: args.cloned(),
            modified_args: None,
            approval_id: None,
        }
    }

    pub fn redact(
        rule: &RuleConfig,
        tool_name: &str,
        args: Option<&Value>,
        modified_args: Value,
        pii_matches: Vec<PIIMatch>,
    ) -> ShieldResult {
        let message = Self::format_counterexample(Verdict::Redact, rule, tool_name, &pii_matches);
        ShieldResult {
            verdict: Verdict::Redact,
            rule_id: Some(rule.id.clone()),
            message,
            pii_matches,
            original_args: args.cloned(),
            modified_args: Some(modified_args),
            approval_id: None,
        }
    }

    pub fn approve(rule: &RuleConfig, tool_name: &str, args: Option<&Value>) -> ShieldResult {
        let message = Self::format_counterexample(Verdict::Approve, rule, tool_name, &[]);
        ShieldResult {
            verdict: Verdict::Approve,
            rule_id: Some(rule.id.clone()),
            message,
            pii_matches: Vec::new(),
            original_args: args.cloned(),
            modified_args: None,
            approval_id: None,
        }
    }

    /// Format a human-readable counterexample:
    ///
    /// ```text
    /// [VERDICT] tool_name — rule description
    /// Rule: rule_id
    /// Reason: rule message or default
    /// Suggestion: helpful guidance
    /// PII detected: types (if any)
    /// ```
    fn format_counterexample(
        verdict: Verdict,
        rule: &RuleConfig,
        tool_name: &str,
        pii_matches: &[PIIMatch],
    ) -> String {
        let mut parts = Vec::new();

        let desc = if rule.description.is_empty() {
            rule.id.as_str()
        } else {
            rule.description.as_str()
        };
        parts.push(format!("[{}] {} — {}", verdict, tool_name, desc));
        parts.push(format!("Rule: {}", rule.id));

        let reason = rule
            .message
            .clone()
            .unwrap_or_else(|| format!("Matched rule '{}'", rule.id));
        parts.push(format!("Reason: {}", reason));

        let suggestion = default_suggestion(verdict);
        if !suggestion.is_empty() {
            parts.push(format!("Suggestion: {}", suggestion));
        }

        if !pii_matches.is_empty() {
            let types: BTreeSet<&str> =
                pii_matches.iter().map(|m| m.pii_type.as_str()).collect();
            parts.push(format!(
                "PII detected: {}",
                types.into_iter().collect::<Vec<_>>().join(", ")
            ));
        }

        parts.join("\n")
    }
}
