// Configuration management
//
// Loads `policyshield.yaml` (with `${VAR}` env expansion), applies
// POLICYSHIELD_* environment overrides, validates, and can build a
// fully wired engine instance.

use crate::approval::cache::ApprovalCache;
use crate::approval::memory::InMemoryBackend;
use crate::approval::webhook::{WebhookBackend, WebhookConfig, WebhookMode};
use crate::core::errors::ShieldError;
use crate::core::models::ShieldMode;
use crate::engine::pii::PiiDetectorConfig;
use crate::engine::rate_limiter::{AdaptiveRateLimiter, RateLimitConfig, RateLimiter};
use crate::engine::sanitizer::{InputSanitizer, SanitizerConfig};
use crate::engine::shield::{ShieldEngine, ShieldEngineBuilder, TimeoutPolicy};
use crate::trace::recorder::{RotationMode, TraceConfig, TraceRecorder};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENV_PREFIX: &str = "POLICYSHIELD_";

fn default_rules_path() -> PathBuf {
    PathBuf::from("./policies/")
}

/// PII detection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PiiSection {
    pub enabled: bool,
    pub luhn_check: bool,
}

impl Default for PiiSection {
    fn default() -> Self {
        Self {
            enabled: true,
            luhn_check: true,
        }
    }
}

/// Sanitizer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SanitizerSection {
    pub enabled: bool,
    pub max_string_length: usize,
    pub max_args_depth: usize,
    pub max_total_keys: usize,
    pub builtin_detectors: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

impl Default for SanitizerSection {
    fn default() -> Self {
        let defaults = SanitizerConfig::default();
        Self {
            enabled: false,
            max_string_length: defaults.max_string_length,
            max_args_depth: defaults.max_args_depth,
            max_total_keys: defaults.max_total_keys,
            builtin_detectors: Vec::new(),
            blocked_patterns: Vec::new(),
        }
    }
}

/// Adaptive rate limit settings: when a session's call rate bursts past
/// `base_limit * burst_threshold` inside the window, its effective limit
/// is multiplied by `tighten_factor` for `cooldown` seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveRateLimitSection {
    pub enabled: bool,
    pub base_limit: u32,
    pub window_seconds: f64,
    pub burst_threshold: f64,
    pub tighten_factor: f64,
    pub cooldown: f64,
}

impl Default for AdaptiveRateLimitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_limit: 100,
            window_seconds: 60.0,
            burst_threshold: 2.0,
            tighten_factor: 0.5,
            cooldown: 300.0,
        }
    }
}

/// Trace recorder settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceSection {
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub privacy_mode: bool,
    pub rotation: String,
    pub max_file_size: u64,
    pub retention_days: u32,
}

impl Default for TraceSection {
    fn default() -> Self {
        let defaults = TraceConfig::default();
        Self {
            enabled: true,
            output_dir: defaults.output_dir,
            batch_size: defaults.batch_size,
            privacy_mode: false,
            rotation: "size".to_string(),
            max_file_size: defaults.max_file_size,
            retention_days: defaults.retention_days,
        }
    }
}

/// Approval plane settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalSection {
    /// "inmemory" or "webhook"
    pub backend: String,
    pub timeout: f64,
    pub on_timeout: TimeoutPolicy,
    /// When false, checks return pending APPROVE results immediately
    pub wait: bool,
    pub gc_ttl: f64,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    /// "sync" or "poll"
    pub webhook_mode: String,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            backend: "inmemory".to_string(),
            timeout: 300.0,
            on_timeout: TimeoutPolicy::Block,
            wait: false,
            gc_ttl: 3600.0,
            webhook_url: None,
            webhook_secret: None,
            webhook_mode: "sync".to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind_address: String,
    pub port: u16,
    pub max_request_size: usize,
    pub max_concurrent_checks: usize,
    pub request_timeout_secs: u64,
    pub session_ttl: u64,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8100,
            max_request_size: 2 * 1024 * 1024,
            max_concurrent_checks: 64,
            request_timeout_secs: 30,
            session_ttl: 3600,
            cors_origins: Vec::new(),
        }
    }
}

/// Resolved configuration for the shield engine and server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShieldConfig {
    pub mode: ShieldMode,
    pub fail_open: bool,
    pub rules_path: PathBuf,
    pub pii: PiiSection,
    pub sanitizer: SanitizerSection,
    pub rate_limits: Vec<RateLimitConfig>,
    pub adaptive_rate_limit: AdaptiveRateLimitSection,
    pub trace: TraceSection,
    pub approval: ApprovalSection,
    pub server: ServerSection,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            mode: ShieldMode::Enforce,
            fail_open: true,
            rules_path: default_rules_path(),
            pii: PiiSection::default(),
            sanitizer: SanitizerSection::default(),
            rate_limits: Vec::new(),
            adaptive_rate_limit: AdaptiveRateLimitSection::default(),
            trace: TraceSection::default(),
            approval: ApprovalSection::default(),
            server: ServerSection::default(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}


impl ShieldConfig {
    /// Load configuration.
    ///
    /// Search order: explicit `path` → `POLICYSHIELD_CONFIG` env var →
    /// `./policyshield.yaml` → defaults. Environment overrides are
    /// applied on top in every case.
    pub fn load(path: Option<&Path>) -> Result<Self, ShieldError> {
        let resolved: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match env::var(format!("{}CONFIG", ENV_PREFIX)) {
                Ok(p) if !p.is_empty() => Some(PathBuf::from(p)),
                _ => {
                    let candidate = PathBuf::from("policyshield.yaml");
                    candidate.exists().then_some(candidate)
                }
            },
        };

        let mut config = match resolved {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ShieldError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShieldError::Configuration(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let expanded = expand_env(&raw);

        // Settings may live under a top-level `policyshield:` key
        let value: serde_yaml::Value = serde_yaml::from_str(&expanded).map_err(|e| {
            ShieldError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })?;
        let value = match value.get("policyshield") {
            Some(inner) => inner.clone(),
            None => value,
        };
        serde_yaml::from_value(value).map_err(|e| {
            ShieldError::Configuration(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ShieldError> {
        if let Ok(mode) = env::var(format!("{}MODE", ENV_PREFIX)) {
            self.mode = mode
                .parse()
                .map_err(ShieldError::Configuration)?;
        }
        if let Ok(fail_open) = env::var(format!("{}FAIL_OPEN", ENV_PREFIX)) {
            self.fail_open = matches!(fail_open.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(dir) = env::var(format!("{}TRACE_DIR", ENV_PREFIX)) {
            if !dir.is_empty() {
                self.trace.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(origins) = env::var(format!("{}CORS_ORIGINS", ENV_PREFIX)) {
            self.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(size) = env::var(format!("{}MAX_REQUEST_SIZE", ENV_PREFIX)) {
            self.server.max_request_size = size.parse().map_err(|e| {
                ShieldError::Configuration(format!("Invalid {}MAX_REQUEST_SIZE: {}", ENV_PREFIX, e))
            })?;
        }
        if let Ok(limit) = env::var(format!("{}MAX_CONCURRENT_CHECKS", ENV_PREFIX)) {
            self.server.max_concurrent_checks = limit.parse().map_err(|e| {
                ShieldError::Configuration(format!(
                    "Invalid {}MAX_CONCURRENT_CHECKS: {}",
                    ENV_PREFIX, e
                ))
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ShieldError> {
        if self.server.port == 0 {
            return Err(ShieldError::Configuration(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }
        if self.server.max_concurrent_checks == 0 {
            return Err(ShieldError::Configuration(
                "server.max_concurrent_checks must be greater than 0".to_string(),
            ));
        }
        if self.adaptive_rate_limit.enabled {
            let adaptive = &self.adaptive_rate_limit;
            if adaptive.base_limit == 0 {
                return Err(ShieldError::Configuration(
                    "adaptive_rate_limit.base_limit must be greater than 0".to_string(),
                ));
            }
            if !(adaptive.tighten_factor > 0.0 && adaptive.tighten_factor <= 1.0) {
                return Err(ShieldError::Configuration(
                    "adaptive_rate_limit.tighten_factor must be in (0, 1]".to_string(),
                ));
            }
            if adaptive.burst_threshold < 1.0 {
                return Err(ShieldError::Configuration(
                    "adaptive_rate_limit.burst_threshold must be at least 1".to_string(),
                ));
            }
        }
        if !matches!(self.trace.rotation.as_str(), "size" | "none") {
            return Err(ShieldError::Configuration(format!(
                "Invalid trace.rotation '{}': must be 'size' or 'none'",
                self.trace.rotation
            )));
        }
        if !matches!(self.approval.backend.as_str(), "inmemory" | "webhook") {
            return Err(ShieldError::Configuration(format!(
                "Invalid approval.backend '{}': must be 'inmemory' or 'webhook'",
                self.approval.backend
            )));
        }
        if self.approval.backend == "webhook" && self.approval.webhook_url.is_none() {
            return Err(ShieldError::Configuration(
                "approval.webhook_url is required for the webhook backend".to_string(),
            ));
        }
        if !matches!(self.approval.webhook_mode.as_str(), "sync" | "poll") {
            return Err(ShieldError::Configuration(format!(
                "Invalid approval.webhook_mode '{}': must be 'sync' or 'poll'",
                self.approval.webhook_mode
            )));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ShieldError::Configuration(format!(
                "Invalid log_level '{}': must be one of {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.log_format != "json" && self.log_format != "text" {
            return Err(ShieldError::Configuration(format!(
                "Invalid log_format '{}': must be 'json' or 'text'",
                self.log_format
            )));
        }
        Ok(())
    }

    /// Build a fully configured engine from this config.
    pub fn build_engine(&self) -> Result<ShieldEngine, ShieldError> {
        let mut builder = ShieldEngineBuilder::from_path(&self.rules_path)
            .mode(self.mode)
            .fail_open(self.fail_open)
            .pii_enabled(self.pii.enabled)
            .pii_config(PiiDetectorConfig {
                luhn_check: self.pii.luhn_check,
            })
            .approval_timeout(Duration::from_secs_f64(self.approval.timeout.max(0.0)))
            .approval_wait(self.approval.wait)
            .on_timeout(self.approval.on_timeout)
            .approval_cache(ApprovalCache::default())
            .session_ttl(Duration::from_secs(self.server.session_ttl));

        if self.sanitizer.enabled {
            builder = builder.sanitizer(InputSanitizer::new(SanitizerConfig {
                max_string_length: self.sanitizer.max_string_length,
                max_args_depth: self.sanitizer.max_args_depth,
                max_total_keys: self.sanitizer.max_total_keys,
                builtin_detectors: self.sanitizer.builtin_detectors.clone(),
                blocked_patterns: self.sanitizer.blocked_patterns.clone(),
                ..SanitizerConfig::default()
            })?);
        }

        if !self.rate_limits.is_empty() {
            builder = builder.rate_limiter(RateLimiter::new(self.rate_limits.clone()));
        }

        if self.adaptive_rate_limit.enabled {
            let adaptive = &self.adaptive_rate_limit;
            builder = builder.adaptive_rate_limiter(AdaptiveRateLimiter::new(
                adaptive.base_limit,
                adaptive.window_seconds,
                adaptive.burst_threshold,
                adaptive.tighten_factor,
                adaptive.cooldown,
            ));
        }

        if self.trace.enabled {
            let tracer = TraceRecorder::new(TraceConfig {
                output_dir: self.trace.output_dir.clone(),
                batch_size: self.trace.batch_size,
                privacy_mode: self.trace.privacy_mode,
                rotation: if self.trace.rotation == "none" {
                    RotationMode::None
                } else {
                    RotationMode::Size
                },
                max_file_size: self.trace.max_file_size,
                retention_days: self.trace.retention_days,
            })
            .map_err(|e| {
                ShieldError::Configuration(format!("Cannot initialize trace recorder: {}", e))
            })?;
            builder = builder.trace_recorder(tracer);
        }

        builder = match self.approval.backend.as_str() {
            "webhook" => {
                let url = self.approval.webhook_url.clone().unwrap_or_default();
                let backend = WebhookBackend::new(WebhookConfig {
                    url,
                    secret: self.approval.webhook_secret.clone(),
                    mode: if self.approval.webhook_mode == "poll" {
                        WebhookMode::Poll
                    } else {
                        WebhookMode::Sync
                    },
                    request_timeout: Duration::from_secs(30),
                    poll_interval: Duration::from_secs(2),
                    poll_timeout: Duration::from_secs_f64(self.approval.timeout.max(0.0)),
                })?;
                builder.approval_backend(Arc::new(backend))
            }
            _ => builder.approval_backend(Arc::new(InMemoryBackend::new())),
        };

        builder.build()
    }

    /// API token from the environment, if configured.
    pub fn api_token() -> Option<String> {
        env::var(format!("{}API_TOKEN", ENV_PREFIX))
            .ok()
            .filter(|t| !t.is_empty())
    }

    /// Create a test configuration that skips file loading.
    pub fn test_config() -> Self {
        Self {
            trace: TraceSection {
                enabled: false,
                ..TraceSection::default()
            },
            ..Self::default()
        }
    }
}

/// Replace `${VAR}` references with environment values; unknown
/// variables are left as-is.
fn expand_env(raw: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|e| panic!("env pattern invalid: {}", e));
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
