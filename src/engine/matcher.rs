// Rule matcher - compiles rules and finds the highest-priority match for a call

use crate::core::errors::RuleLoadError;
use crate::core::models::{
    ArgPredicate, RuleConfig, RuleSet, SessionCondition, ToolSelector,
};
use crate::engine::context::ContextEvaluator;
use crate::state::events::{count_recent, ToolEvent};
use crate::state::session::SessionSnapshot;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum length for regex patterns to bound ReDoS risk.
pub const MAX_PATTERN_LENGTH: usize = 500;

/// One tool call being evaluated against the rule set.
pub struct MatchQuery<'a> {
    pub tool_name: &'a str,
    pub args: &'a Value,
    pub session: Option<&'a SessionSnapshot>,
    pub sender: Option<&'a str>,
    pub context: Option<&'a Map<String, Value>>,
}

enum CompiledPredicate {
    Regex(Regex),
    Eq(String),
    Contains(String),
    NotContains(String),
}

struct CompiledArgPattern {
    field: String,
    predicate: CompiledPredicate,
}

/// A rule with pre-compiled regex patterns for efficient matching.
pub struct CompiledRule {
    pub rule: RuleConfig,
    tool_regex: Option<Regex>,
    arg_patterns: Vec<CompiledArgPattern>,
    sender_regex: Option<Regex>,
}

fn compile_anchored(
    pattern: &str,
    rule_id: &str,
) -> Result<Regex, RuleLoadError> {
    check_length(pattern, rule_id)?;
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| RuleLoadError::InvalidRegex {
        rule_id: rule_id.to_string(),
        detail: e.to_string(),
    })
}

fn check_length(pattern: &str, rule_id: &str) -> Result<(), RuleLoadError> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(RuleLoadError::InvalidRegex {
            rule_id: rule_id.to_string(),
            detail: format!("pattern exceeds {} characters", MAX_PATTERN_LENGTH),
        });
    }
    Ok(())
}

impl CompiledRule {
    /// Compile a rule's patterns.
    ///
    /// Tool matching behaviour:
    /// - **list**: each entry is an exact tool name (escaped, joined with `|`)
    /// - **string**: a regex anchored with `^...$`; `file_.*` matches any
    ///   tool starting with `file_`
    pub fn from_rule(rule: &RuleConfig) -> Result<Self, RuleLoadError> {
        let tool_regex = match &rule.when.tool {
            Some(ToolSelector::Many(names)) => {
                let escaped: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
                Some(compile_anchored(&escaped.join("|"), &rule.id)?)
            }
            Some(ToolSelector::One(pattern)) => Some(compile_anchored(pattern, &rule.id)?),
            None => None,
        };

        let mut arg_patterns = Vec::new();
        if let Some(args) = &rule.when.args {
            for (field, predicate) in args {
                check_length(predicate.value(), &rule.id)?;
                let compiled = match predicate {
                    ArgPredicate::Regex(p) => CompiledPredicate::Regex(Regex::new(p).map_err(
                        |e| RuleLoadError::InvalidRegex {
                            rule_id: rule.id.clone(),
                            detail: e.to_string(),
                        },
                    )?),
                    ArgPredicate::Eq(v) => CompiledPredicate::Eq(v.clone()),
                    ArgPredicate::Contains(v) => CompiledPredicate::Contains(v.clone()),
                    ArgPredicate::NotContains(v) => CompiledPredicate::NotContains(v.clone()),
                };
                arg_patterns.push(CompiledArgPattern {
                    field: field.clone(),
                    predicate: compiled,
                });
            }
        }

        let sender_regex = match &rule.when.sender {
            Some(pattern) => Some(compile_anchored(pattern, &rule.id)?),
            None => None,
        };

        Ok(Self {
            rule: rule.clone(),
            tool_regex,
            arg_patterns,
            sender_regex,
        })
    }
}

/// Matches tool calls against a rule set.
///
/// Rules with a literal tool name (or a list of them) are indexed by
/// tool for O(1) candidate lookup; regex and tool-less rules live in a
/// wildcard slice applied to every call.
pub struct MatcherEngine {
    compiled: Vec<Arc<CompiledRule>>,
    tool_index: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
}

fn is_literal_tool(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|c| matches!(c, '*' | '.' | '+' | '?' | '[' | ']' | '|' | '(' | ')' | '^' | '$' | '\\' | '{' | '}'))
}

impl MatcherEngine {
    pub fn new(rule_set: &RuleSet) -> Result<Self, RuleLoadError> {
        let mut compiled = Vec::new();
        let mut tool_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard = Vec::new();

        for rule in rule_set.enabled_rules() {
            let idx = compiled.len();
            compiled.push(Arc::new(CompiledRule::from_rule(rule)?));

            match &rule.when.tool {
                Some(ToolSelector::Many(names)) => {
                    for name in names {
                        tool_index.entry(name.clone()).or_default().push(idx);
                    }
                }
                Some(ToolSelector::One(pattern)) if is_literal_tool(pattern) => {
                    tool_index.entry(pattern.clone()).or_default().push(idx);
                }
                _ => wildcard.push(idx),
            }
        }

        Ok(Self {
            compiled,
            tool_index,
            wildcard,
        })
    }

    /// All rules matching the call, most specific first:
    /// `(priority ASC, verdict restrictiveness DESC, severity DESC)`,
    /// stable across runs.
    pub fn find_matching_rules(
        &self,
        query: &MatchQuery<'_>,
        ctx_eval: &ContextEvaluator,
    ) -> Vec<Arc<CompiledRule>> {
        let mut candidates: Vec<usize> = self
            .tool_index
            .get(query.tool_name)
            .cloned()
            .unwrap_or_default();
        candidates.extend(&self.wildcard);

        let now = Instant::now();
        let mut matching: Vec<Arc<CompiledRule>> = candidates
            .into_iter()
            .map(|i| &self.compiled[i])
            .filter(|c| self.matches(c, query, ctx_eval, now))
            .cloned()
            .collect();

        matching.sort_by_key(|c| {
            (
                c.rule.priority,
                std::cmp::Reverse(c.rule.then.rank()),
                std::cmp::Reverse(c.rule.severity.rank()),
            )
        });
        matching
    }

    /// The highest-priority matching rule, or None.
    pub fn find_best_match(
        &self,
        query: &MatchQuery<'_>,
        ctx_eval: &ContextEvaluator,
    ) -> Option<Arc<CompiledRule>> {
        self.find_matching_rules(query, ctx_eval).into_iter().next()
    }

    fn matches(
        &self,
        compiled: &CompiledRule,
        query: &MatchQuery<'_>,
        ctx_eval: &ContextEvaluator,
        now: Instant,
    ) -> bool {
        // Tool pattern
        if let Some(re) = &compiled.tool_regex {
            if !re.is_match(query.tool_name) {
                return false;
            }
        }

        // Argument predicates, left to right; first failure short-circuits
        for pattern in &compiled.arg_patterns {
            if !Self::arg_matches(pattern, query.args) {
                return false;
            }
        }

        // Session conditions
        if let Some(conditions) = &compiled.rule.when.session {
            let Some(session) = query.session else {
                return false;
            };
            for (key, condition) in conditions {
                if !Self::session_matches(session.counter(key), condition) {
                    return false;
                }
            }
        }

        // Sender
        if let Some(re) = &compiled.sender_regex {
            match query.sender {
                Some(sender) if re.is_match(sender) => {}
                _ => return false,
            }
        }

        // Context
        if let Some(conditions) = &compiled.rule.when.context {
            if !ctx_eval.evaluate(conditions, query.context) {
                return false;
            }
        }

        // Chain prerequisites
        if let Some(chain) = &compiled.rule.chain {
            let events: &[ToolEvent] = match query.session {
                Some(session) => &session.events,
                None => return false,
            };
            for step in chain {
                let within = Duration::from_secs_f64(step.within_seconds.max(0.0));
                let count = count_recent(events, &step.tool, within, step.verdict, now);
                if count < step.min_count {
                    return false;
                }
            }
        }

        true
    }

    fn arg_matches(pattern: &CompiledArgPattern, args: &Value) -> bool {
        let value = args.get(&pattern.field);
        let arg_str = match value {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
        };

        match (&pattern.predicate, arg_str) {
            // A missing field never matches, except not_contains
            (CompiledPredicate::NotContains(_), None) => true,
            (_, None) => false,
            (CompiledPredicate::Regex(re), Some(s)) => re.is_match(&s),
            (CompiledPredicate::Eq(v), Some(s)) => s == *v,
            (CompiledPredicate::Contains(v), Some(s)) => s.contains(v.as_str()),
            (CompiledPredicate::NotContains(v), Some(s)) => !s.contains(v.as_str()),
        }
    }

    fn session_matches(actual: f64, condition: &SessionCondition) -> bool {
        match condition {
            SessionCondition::Equals(expected) => actual == *expected,
            SessionCondition::Compare(cmp) => {
                if let Some(v) = cmp.gt {
                    if actual <= v {
                        return false;
                    }
                }
                if let Some(v) = cmp.gte {
                    if actual < v {
                        return false;
                    }
                }
                if let Some(v) = cmp.lt {
                    if actual >= v {
                        return false;
                    }
                }
                if let Some(v) = cmp.lte {
                    if actual > v {
                        return false;
                    }
                }
                if let Some(v) = cmp.eq {
                    if actual != v {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Total number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.compiled.len()
    }
}
