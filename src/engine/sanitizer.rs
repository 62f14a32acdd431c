// Input sanitizer for tool-call arguments
//
// Normalizes and bound-checks argument trees, then rejects calls whose
// flattened text matches a built-in attack detector or a blocked pattern.

use crate::core::errors::ShieldError;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;

/// Configuration for [`InputSanitizer`].
#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    pub max_string_length: usize,
    pub max_args_depth: usize,
    pub max_total_keys: usize,
    pub strip_whitespace: bool,
    pub strip_null_bytes: bool,
    pub normalize_unicode: bool,
    pub strip_control_chars: bool,
    /// Names of built-in detectors to enable, e.g. `["ssrf", "path_traversal"]`
    pub builtin_detectors: Vec<String>,
    /// Arbitrary regexes rejected after the detectors
    pub blocked_patterns: Vec<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_string_length: 10_000,
            max_args_depth: 10,
            max_total_keys: 100,
            strip_whitespace: true,
            strip_null_bytes: true,
            normalize_unicode: true,
            strip_control_chars: true,
            builtin_detectors: Vec::new(),
            blocked_patterns: Vec::new(),
        }
    }
}

/// Result of sanitizing an argument tree.
#[derive(Debug, Clone)]
pub struct SanitizeResult {
    pub sanitized_args: Value,
    pub warnings: Vec<String>,
    pub was_modified: bool,
    pub rejected: bool,
    pub rejection_reason: String,
}

impl SanitizeResult {
    fn rejected(args: &Value, reason: String) -> Self {
        Self {
            sanitized_args: args.clone(),
            warnings: Vec::new(),
            was_modified: false,
            rejected: true,
            rejection_reason: reason,
        }
    }
}

fn builtin_detector_pattern(name: &str) -> Option<&'static str> {
    match name {
        "path_traversal" => Some(r"(\.\.[/\\]|%2e%2e(?:%2f|%5c|/|\\))"),
        "shell_injection" => {
            Some(r"([;&|]\s*(?:rm|curl|wget|nc|sh|bash|zsh|python|perl|chmod|chown|mkfs|dd)\b|\$\([^)]*\)|`[^`]*`)")
        }
        "sql_injection" => {
            Some(r"('\s*(?:or|and)\s*'?[^']*'?\s*=|union\s+select|;\s*(?:drop|delete|truncate|insert|update)\b)")
        }
        "ssrf" => {
            Some(r"\b(?:169\.254\.\d{1,3}\.\d{1,3}|127\.\d{1,3}\.\d{1,3}\.\d{1,3}|0\.0\.0\.0|10\.\d{1,3}\.\d{1,3}\.\d{1,3}|192\.168\.\d{1,3}\.\d{1,3}|172\.(?:1[6-9]|2\d|3[01])\.\d{1,3}\.\d{1,3}|localhost|metadata\.google\.internal)\b")
        }
        "url_schemes" => Some(r"(file://|javascript:|data:text/html|gopher://|dict://)"),
        _ => None,
    }
}

/// Sanitize tool-call arguments before policy checks.
///
/// Never errors at check time; the worst case is `rejected = true`.
pub struct InputSanitizer {
    config: SanitizerConfig,
    detectors: Vec<(String, Regex)>,
    blocked: Vec<Regex>,
}

impl InputSanitizer {
    pub fn new(config: SanitizerConfig) -> Result<Self, ShieldError> {
        let mut detectors = Vec::new();
        for name in &config.builtin_detectors {
            let pattern = builtin_detector_pattern(name).ok_or_else(|| {
                ShieldError::Configuration(format!("Unknown built-in detector '{}'", name))
            })?;
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ShieldError::Internal(format!("detector '{}' failed to compile: {}", name, e))
                })?;
            detectors.push((name.clone(), regex));
        }

        let mut blocked = Vec::new();
        for pattern in &config.blocked_patterns {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ShieldError::Configuration(format!(
                        "Invalid blocked pattern '{}': {}",
                        pattern, e
                    ))
                })?;
            blocked.push(regex);
        }

        Ok(Self {
            config,
            detectors,
            blocked,
        })
    }

    /// Sanitize `args` according to the current config.
    pub fn sanitize(&self, args: &Value) -> SanitizeResult {
        // Detectors first, then blocked patterns, both on the raw flattened view
        let flat = flatten_to_string(args);

        for (name, regex) in &self.detectors {
            if let Some(m) = regex.find(&flat) {
                return SanitizeResult::rejected(
                    args,
                    format!(
                        "Built-in detector '{}' matched: '{}'",
                        name,
                        snippet(m.as_str())
                    ),
                );
            }
        }

        for regex in &self.blocked {
            if regex.is_match(&flat) {
                return SanitizeResult::rejected(
                    args,
                    format!("Blocked pattern matched: '{}'", regex.as_str()),
                );
            }
        }

        let mut walker = Walker {
            config: &self.config,
            key_count: 0,
            warnings: Vec::new(),
            modified: false,
        };
        let sanitized = walker.walk(args, 0);

        SanitizeResult {
            sanitized_args: sanitized,
            warnings: walker.warnings,
            was_modified: walker.modified,
            rejected: false,
            rejection_reason: String::new(),
        }
    }
}

struct Walker<'a> {
    config: &'a SanitizerConfig,
    key_count: usize,
    warnings: Vec<String>,
    modified: bool,
}

impl Walker<'_> {
    fn walk(&mut self, value: &Value, depth: usize) -> Value {
        match value {
            Value::Object(map) => {
                if depth >= self.config.max_args_depth {
                    self.warnings.push(format!(
                        "Max depth ({}) exceeded — truncated",
                        self.config.max_args_depth
                    ));
                    self.modified = true;
                    return Value::Object(Map::new());
                }
                let mut result = Map::new();
                for (k, v) in map {
                    if self.key_count >= self.config.max_total_keys {
                        self.warnings.push(format!(
                            "Max keys ({}) exceeded — truncated",
                            self.config.max_total_keys
                        ));
                        self.modified = true;
                        break;
                    }
                    self.key_count += 1;
                    let walked = self.walk(v, depth + 1);
                    result.insert(k.clone(), walked);
                }
                Value::Object(result)
            }
            Value::Array(items) => {
                if depth >= self.config.max_args_depth {
                    self.warnings.push(format!(
                        "Max depth ({}) exceeded — truncated",
                        self.config.max_args_depth
                    ));
                    self.modified = true;
                    return Value::Array(Vec::new());
                }
                Value::Array(items.iter().map(|v| self.walk(v, depth + 1)).collect())
            }
            Value::String(s) => Value::String(self.sanitize_string(s)),
            other => other.clone(),
        }
    }

    fn sanitize_string(&mut self, s: &str) -> String {
        let cfg = self.config;
        let mut out = s.to_string();

        if cfg.strip_null_bytes && out.contains('\0') {
            out = out.replace('\0', "");
            self.modified = true;
        }

        if cfg.strip_control_chars {
            // C0/C1 controls except \n \r \t
            let stripped: String = out
                .chars()
                .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
                .collect();
            if stripped != out {
                out = stripped;
                self.modified = true;
            }
        }

        if cfg.strip_whitespace {
            let trimmed = out.trim();
            if trimmed != out {
                out = trimmed.to_string();
                self.modified = true;
            }
        }

        if cfg.normalize_unicode {
            let normed: String = out.nfc().collect();
            if normed != out {
                out = normed;
                self.modified = true;
            }
        }

        if out.chars().count() > cfg.max_string_length {
            out = out.chars().take(cfg.max_string_length).collect();
            self.modified = true;
            self.warnings
                .push(format!("String truncated to {} chars", cfg.max_string_length));
        }

        out
    }
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(80) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Flatten a nested structure to a single string for pattern matching.
fn flatten_to_string(value: &Value) -> String {
    let mut parts = Vec::new();
    flatten_recurse(value, &mut parts);
    parts.join(" ")
}

fn flatten_recurse(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for v in map.values() {
                flatten_recurse(v, parts);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_recurse(item, parts);
            }
        }
        Value::String(s) => parts.push(s.clone()),
        Value::Null => {}
        other => parts.push(other.to_string()),
    }
}
