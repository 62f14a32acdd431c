// YAML rule loading - parse rule files into a validated, immutable RuleSet

use crate::core::errors::RuleLoadError;
use crate::core::models::{
    CustomPiiPattern, HoneypotConfig, RuleConfig, RuleSet, TaintChainConfig, ToolSelector, Verdict,
};
use crate::engine::matcher::{CompiledRule, MAX_PATTERN_LENGTH};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Root document of a rule YAML file. Unknown top-level keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSetDoc {
    shield_name: String,
    version: i64,
    #[serde(default)]
    rules: Vec<RuleConfig>,
    #[serde(default)]
    default_verdict: Option<Verdict>,
    #[serde(default)]
    honeypots: Option<Vec<HoneypotConfig>>,
    #[serde(default)]
    pii_patterns: Option<Vec<CustomPiiPattern>>,
    #[serde(default)]
    taint_chain: Option<TaintChainConfig>,
}

/// Load a rule set from a YAML file or a directory.
///
/// A directory concatenates all `*.yaml` / `*.yml` files in lexical
/// order: the first file's `shield_name`, `version`, `default_verdict`
/// and `taint_chain` win; every file contributes rules, honeypots and
/// PII patterns. Rule ids must be unique across the whole set.
pub fn load_rules(path: impl AsRef<Path>) -> Result<RuleSet, RuleLoadError> {
    let path = path.as_ref();
    let files = collect_rule_files(path)?;

    let mut merged: Option<RuleSet> = None;
    for file in &files {
        let doc = load_file(file)?;
        match merged.as_mut() {
            None => {
                merged = Some(RuleSet {
                    shield_name: doc.shield_name,
                    version: doc.version,
                    rules: doc.rules,
                    default_verdict: doc.default_verdict.unwrap_or(Verdict::Allow),
                    honeypots: doc.honeypots.unwrap_or_default(),
                    pii_patterns: doc.pii_patterns.unwrap_or_default(),
                    taint_chain: doc.taint_chain.unwrap_or_default(),
                });
            }
            Some(merged) => {
                merged.rules.extend(doc.rules);
                merged.honeypots.extend(doc.honeypots.unwrap_or_default());
                merged
                    .pii_patterns
                    .extend(doc.pii_patterns.unwrap_or_default());
            }
        }
    }

    let rule_set = merged.ok_or_else(|| RuleLoadError::SchemaViolation {
        path: path.display().to_string(),
        detail: "no rule files found".to_string(),
    })?;

    validate(&rule_set)?;
    info!(
        shield = %rule_set.shield_name,
        rules = rule_set.rules.len(),
        "Rules loaded"
    );
    Ok(rule_set)
}

fn collect_rule_files(path: &Path) -> Result<Vec<PathBuf>, RuleLoadError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(RuleLoadError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("rules path not found: {}", path.display()),
        )));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_file(path: &Path) -> Result<RuleSetDoc, RuleLoadError> {
    let content = fs::read_to_string(path)?;

    // Distinguish syntax errors from schema violations: raw YAML first
    let raw: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| RuleLoadError::YamlSyntax {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;

    serde_yaml::from_value(raw).map_err(|e| RuleLoadError::SchemaViolation {
        path: path.display().to_string(),
        detail: e.to_string(),
    })
}

/// Structural validation: non-empty unique ids, compilable length-capped
/// patterns, valid honeypot and custom PII configs.
fn validate(rule_set: &RuleSet) -> Result<(), RuleLoadError> {
    let mut seen = HashSet::new();
    for rule in &rule_set.rules {
        if rule.id.is_empty() {
            return Err(RuleLoadError::SchemaViolation {
                path: String::new(),
                detail: "rule id must be non-empty".to_string(),
            });
        }
        if !seen.insert(rule.id.clone()) {
            return Err(RuleLoadError::DuplicateId(rule.id.clone()));
        }
        // Compiling exercises every regex in the rule, with length caps
        CompiledRule::from_rule(rule)?;

        if let Some(ToolSelector::Many(names)) = &rule.when.tool {
            if names.is_empty() {
                return Err(RuleLoadError::SchemaViolation {
                    path: String::new(),
                    detail: format!("rule '{}' has an empty tool list", rule.id),
                });
            }
        }
    }

    for pattern in &rule_set.pii_patterns {
        if pattern.pattern.len() > MAX_PATTERN_LENGTH {
            return Err(RuleLoadError::InvalidRegex {
                rule_id: pattern.name.clone(),
                detail: format!("pattern exceeds {} characters", MAX_PATTERN_LENGTH),
            });
        }
        Regex::new(&pattern.pattern).map_err(|e| RuleLoadError::InvalidRegex {
            rule_id: pattern.name.clone(),
            detail: e.to_string(),
        })?;
    }

    for honeypot in &rule_set.honeypots {
        if honeypot.name.is_empty() {
            return Err(RuleLoadError::SchemaViolation {
                path: String::new(),
                detail: "honeypot name must be non-empty".to_string(),
            });
        }
    }

    Ok(())
}
