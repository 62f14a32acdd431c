// Core data models for PolicyShield

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Verdict for a tool call check.
///
/// Variant order is restrictiveness order: `ALLOW < REDACT < APPROVE < BLOCK`.
/// The matcher uses this ordering as a tie-breaker between rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    #[serde(alias = "allow")]
    Allow,
    #[serde(alias = "redact")]
    Redact,
    #[serde(alias = "approve")]
    Approve,
    #[serde(alias = "block")]
    Block,
}

impl Verdict {
    /// Restrictiveness rank (higher = more restrictive)
    pub fn rank(&self) -> u8 {
        match self {
            Verdict::Allow => 0,
            Verdict::Redact => 1,
            Verdict::Approve => 2,
            Verdict::Block => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Redact => "REDACT",
            Verdict::Approve => "APPROVE",
            Verdict::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity level of a rule. Used only as a secondary sort key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Operating mode for the shield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShieldMode {
    #[default]
    #[serde(alias = "enforce")]
    Enforce,
    #[serde(alias = "audit")]
    Audit,
    #[serde(alias = "disabled")]
    Disabled,
}

impl ShieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShieldMode::Enforce => "ENFORCE",
            ShieldMode::Audit => "AUDIT",
            ShieldMode::Disabled => "DISABLED",
        }
    }
}

impl std::str::FromStr for ShieldMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ENFORCE" => Ok(ShieldMode::Enforce),
            "AUDIT" => Ok(ShieldMode::Audit),
            "DISABLED" => Ok(ShieldMode::Disabled),
            other => Err(format!(
                "Invalid mode: '{}'. Must be ENFORCE, AUDIT or DISABLED.",
                other
            )),
        }
    }
}

/// Types of personally identifiable information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PIIType {
    Email,
    Phone,
    CreditCard,
    Ssn,
    Iban,
    IpAddress,
    Passport,
    DateOfBirth,
    // RU-specific
    Inn,
    Snils,
    RuPassport,
    RuPhone,
    Custom,
}

impl PIIType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PIIType::Email => "EMAIL",
            PIIType::Phone => "PHONE",
            PIIType::CreditCard => "CREDIT_CARD",
            PIIType::Ssn => "SSN",
            PIIType::Iban => "IBAN",
            PIIType::IpAddress => "IP_ADDRESS",
            PIIType::Passport => "PASSPORT",
            PIIType::DateOfBirth => "DATE_OF_BIRTH",
            PIIType::Inn => "INN",
            PIIType::Snils => "SNILS",
            PIIType::RuPassport => "RU_PASSPORT",
            PIIType::RuPhone => "RU_PHONE",
            PIIType::Custom => "CUSTOM",
        }
    }
}

/// How approval decisions are cached across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStrategy {
    /// Approve only this exact call
    Once,
    /// Approve all calls matching this rule in this session
    PerSession,
    /// Approve all calls of this rule globally
    PerRule,
    /// Approve all calls of this tool in this session
    PerTool,
}

/// Tool selector in a `when` clause: a single pattern or a list of exact names.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ToolSelector {
    One(String),
    Many(Vec<String>),
}

/// A single argument predicate in a `when.args` clause.
///
/// Accepted YAML shapes:
/// - `{regex: "..."}` / `{eq: "..."}` / `{contains: "..."}` / `{not_contains: "..."}`
/// - `{predicate: "regex", value: "..."}`
/// - a bare scalar, treated as a regex
#[derive(Debug, Clone, PartialEq)]
pub enum ArgPredicate {
    Regex(String),
    Eq(String),
    Contains(String),
    NotContains(String),
}

impl ArgPredicate {
    pub fn value(&self) -> &str {
        match self {
            ArgPredicate::Regex(v)
            | ArgPredicate::Eq(v)
            | ArgPredicate::Contains(v)
            | ArgPredicate::NotContains(v) => v,
        }
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl<'de> Deserialize<'de> for ArgPredicate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = Value::deserialize(deserializer)?;
        match raw {
            Value::String(s) => Ok(ArgPredicate::Regex(s)),
            Value::Number(n) => Ok(ArgPredicate::Regex(n.to_string())),
            Value::Object(map) => {
                if let Some(p) = map.get("predicate").and_then(Value::as_str) {
                    let value = map.get("value").map(scalar_to_string).unwrap_or_default();
                    return match p {
                        "regex" => Ok(ArgPredicate::Regex(value)),
                        "eq" => Ok(ArgPredicate::Eq(value)),
                        "contains" => Ok(ArgPredicate::Contains(value)),
                        "not_contains" => Ok(ArgPredicate::NotContains(value)),
                        other => Err(D::Error::custom(format!(
                            "unknown argument predicate '{}'",
                            other
                        ))),
                    };
                }
                if let Some(v) = map.get("regex") {
                    Ok(ArgPredicate::Regex(scalar_to_string(v)))
                } else if let Some(v) = map.get("eq") {
                    Ok(ArgPredicate::Eq(scalar_to_string(v)))
                } else if let Some(v) = map.get("contains") {
                    Ok(ArgPredicate::Contains(scalar_to_string(v)))
                } else if let Some(v) = map.get("not_contains") {
                    Ok(ArgPredicate::NotContains(scalar_to_string(v)))
                } else {
                    Err(D::Error::custom(
                        "argument predicate must be one of regex/eq/contains/not_contains",
                    ))
                }
            }
            _ => Err(D::Error::custom("invalid argument predicate")),
        }
    }
}

/// Comparison against a session counter in a `when.session` clause.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SessionCondition {
    Compare(SessionComparison),
    Equals(f64),
}

/// Comparison operators; any subset may be present and all must hold.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionComparison {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
    pub eq: Option<f64>,
}

/// The `when` clause of a rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenClause {
    #[serde(default)]
    pub tool: Option<ToolSelector>,
    #[serde(default, alias = "args_match")]
    pub args: Option<BTreeMap<String, ArgPredicate>>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub session: Option<BTreeMap<String, SessionCondition>>,
    #[serde(default)]
    pub context: Option<BTreeMap<String, Value>>,
}

fn default_within_seconds() -> f64 {
    300.0
}

fn default_min_count() -> usize {
    1
}

/// A single step in a chain rule — requires a tool to have been called recently.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainStep {
    pub tool: String,
    #[serde(default = "default_within_seconds")]
    pub within_seconds: f64,
    #[serde(default = "default_min_count")]
    pub min_count: usize,
    #[serde(default)]
    pub verdict: Option<Verdict>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    1
}

fn default_verdict() -> Verdict {
    Verdict::Allow
}

/// A single rule from YAML configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub when: WhenClause,
    #[serde(default = "default_verdict")]
    pub then: Verdict,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower = more specific; evaluated first when ranking matches
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub approval_strategy: Option<ApprovalStrategy>,
    #[serde(default)]
    pub chain: Option<Vec<ChainStep>>,
}

fn default_honeypot_severity() -> Severity {
    Severity::Critical
}

/// A configured honeypot tool — a decoy that should never be called.
#[derive(Debug, Clone, Deserialize)]
pub struct HoneypotConfig {
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default)]
    pub alert: Option<String>,
    #[serde(default = "default_honeypot_severity")]
    pub severity: Severity,
}

/// Custom PII pattern from the rule file, compiled as `PIIType::Custom`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomPiiPattern {
    pub name: String,
    pub pattern: String,
}

/// Configuration for PII taint chain enforcement.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaintChainConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub outgoing_tools: Vec<String>,
}

/// A set of rules loaded from YAML files. Immutable after load;
/// reload swaps the whole set atomically.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub shield_name: String,
    pub version: i64,
    pub rules: Vec<RuleConfig>,
    pub default_verdict: Verdict,
    pub honeypots: Vec<HoneypotConfig>,
    pub pii_patterns: Vec<CustomPiiPattern>,
    pub taint_chain: TaintChainConfig,
}

impl RuleSet {
    /// Minimal rule set for embedding and tests.
    pub fn new(shield_name: impl Into<String>, version: i64, rules: Vec<RuleConfig>) -> Self {
        Self {
            shield_name: shield_name.into(),
            version,
            rules,
            default_verdict: Verdict::Allow,
            honeypots: Vec::new(),
            pii_patterns: Vec::new(),
            taint_chain: TaintChainConfig::default(),
        }
    }

    /// Return only rules with `enabled = true`.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &RuleConfig> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

/// A detected PII match. `span` is half-open byte offsets into the
/// field's string form; `field` is a dotted path with `[i]` list indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PIIMatch {
    pub pii_type: PIIType,
    pub field: String,
    pub span: (usize, usize),
    pub masked_value: String,
}

/// Result of checking a single tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ShieldResult {
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pii_matches: Vec<PIIMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl ShieldResult {
    /// Bare result with a verdict and message, no rule attribution.
    pub fn bare(verdict: Verdict, message: impl Into<String>) -> Self {
        Self {
            verdict,
            rule_id: None,
            message: message.into(),
            pii_matches: Vec::new(),
            original_args: None,
            modified_args: None,
            approval_id: None,
        }
    }

    /// Result attributed to a synthetic rule id (`__kill_switch__` etc).
    pub fn synthetic(
        verdict: Verdict,
        rule_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: Some(rule_id.into()),
            ..Self::bare(verdict, message)
        }
    }
}

/// A single audit log record, serialized as one JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub session_id: String,
    pub tool: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pii_types: Vec<String>,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<Value>,
}
