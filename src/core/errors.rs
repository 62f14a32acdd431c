// Domain error types - Secure error handling with no information disclosure

use thiserror::Error;

/// Errors raised while loading or reloading a rule set
#[derive(Error, Debug)]
pub enum RuleLoadError {
    /// YAML could not be parsed
    #[error("YAML syntax error in {path}: {detail}")]
    YamlSyntax { path: String, detail: String },

    /// Document parsed but violates the rule schema
    #[error("Schema violation in {path}: {detail}")]
    SchemaViolation { path: String, detail: String },

    /// Two rules share the same id
    #[error("Duplicate rule id '{0}'")]
    DuplicateId(String),

    /// A regex pattern failed to compile or exceeds the length cap
    #[error("Invalid regex in rule '{rule_id}': {detail}")]
    InvalidRegex { rule_id: String, detail: String },

    /// Filesystem error while reading rule files
    #[error("I/O error reading rules: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for the shield
#[derive(Error, Debug)]
pub enum ShieldError {
    /// Rule set failed to load (HTTP 500 on reload)
    #[error("Rule load error: {0}")]
    RuleLoad(#[from] RuleLoadError),

    /// Configuration error (HTTP 500)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Matcher internals failed (HTTP 500)
    #[error("Matcher error: {0}")]
    Matcher(String),

    /// Approval backend failure or outage (HTTP 502)
    #[error("Approval error: {0}")]
    Approval(String),

    /// Trace recorder failure (HTTP 500; never blocks a check)
    #[error("Trace error: {0}")]
    Trace(String),

    /// Request validation failure (HTTP 422)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal invariant broken (HTTP 500)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShieldError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ShieldError::Approval(_) => 502,
            ShieldError::Validation(_) => 422,
            _ => 500,
        }
    }

    /// Get user-friendly error message (no sensitive information)
    pub fn user_message(&self) -> String {
        match self {
            ShieldError::RuleLoad(e) => format!("Rule load error: {}", e),
            ShieldError::Validation(msg) => msg.clone(),
            ShieldError::Approval(_) => "Approval backend unavailable".to_string(),
            _ => "Internal error".to_string(),
        }
    }
}
