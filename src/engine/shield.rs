// Shield engine - orchestrates the full check pipeline
//
// Pipeline per check: kill switch → sanitizer → rate limiter → honeypots
// → taint chain → matcher → PII → verdict dispatch → audit coercion →
// session update → trace. Control flow is strictly linear per call;
// concurrency lives between calls.

use crate::approval::{ApprovalBackend, ApprovalRequest};
use crate::approval::cache::ApprovalCache;
use crate::core::errors::ShieldError;
use crate::core::models::{
    ApprovalStrategy, PIIMatch, RuleConfig, RuleSet, Severity, ShieldMode, ShieldResult, Verdict,
    WhenClause,
};
use crate::engine::context::ContextEvaluator;
use crate::engine::honeypots::HoneypotChecker;
use crate::engine::matcher::{MatchQuery, MatcherEngine};
use crate::engine::pii::{PIIDetector, PiiDetectorConfig};
use crate::engine::rate_limiter::{AdaptiveRateLimiter, RateLimiter};
use crate::engine::sanitizer::InputSanitizer;
use crate::engine::verdict::VerdictBuilder;
use crate::loader::rule_loader::load_rules;
use crate::state::session::SessionManager;
use crate::trace::recorder::TraceRecorder;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const KILL_SWITCH_RULE_ID: &str = "__kill_switch__";
pub const SANITIZER_RULE_ID: &str = "__sanitizer__";
pub const RATE_LIMIT_RULE_ID: &str = "__rate_limit__";
pub const HONEYPOT_RULE_PREFIX: &str = "__honeypot__";
pub const TAINT_CHAIN_RULE_ID: &str = "__taint_chain__";
pub const INTERNAL_ERROR_RULE_ID: &str = "__internal_error__";
pub const DEFAULT_RULE_ID: &str = "__default__";

/// What to do when an approval wait expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeoutPolicy {
    #[default]
    #[serde(alias = "block")]
    Block,
    #[serde(alias = "allow")]
    Allow,
}

/// Status of an approval request as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved { responder: String },
    Denied { responder: String },
    Unknown,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved { .. } => "approved",
            ApprovalStatus::Denied { .. } => "denied",
            ApprovalStatus::Unknown => "unknown",
        }
    }
}

/// A rule set compiled for matching; swapped atomically on reload.
struct CompiledPolicy {
    rule_set: RuleSet,
    matcher: MatcherEngine,
    honeypots: HoneypotChecker,
    pii: Option<PIIDetector>,
}

impl CompiledPolicy {
    fn build(
        rule_set: RuleSet,
        pii_enabled: bool,
        pii_config: &PiiDetectorConfig,
    ) -> Result<Self, ShieldError> {
        let matcher = MatcherEngine::new(&rule_set).map_err(ShieldError::RuleLoad)?;
        let honeypots = HoneypotChecker::new(&rule_set.honeypots);
        let pii = if pii_enabled {
            Some(
                PIIDetector::new(pii_config.clone())
                    .with_custom_patterns(&rule_set.pii_patterns)?,
            )
        } else {
            None
        };
        Ok(Self {
            rule_set,
            matcher,
            honeypots,
            pii,
        })
    }
}

struct PendingApproval {
    tool_name: String,
    rule_id: String,
    session_id: String,
    strategy: Option<ApprovalStrategy>,
}

/// Builder for [`ShieldEngine`].
pub struct ShieldEngineBuilder {
    rule_set: Option<RuleSet>,
    rules_path: Option<PathBuf>,
    mode: ShieldMode,
    fail_open: bool,
    pii_enabled: bool,
    pii_config: PiiDetectorConfig,
    sanitizer: Option<InputSanitizer>,
    rate_limiter: Option<RateLimiter>,
    adaptive_limiter: Option<AdaptiveRateLimiter>,
    tracer: Option<TraceRecorder>,
    approval_backend: Option<Arc<dyn ApprovalBackend>>,
    approval_cache: ApprovalCache,
    approval_timeout: Duration,
    approval_wait: bool,
    on_timeout: TimeoutPolicy,
    session_ttl: Duration,
    context_eval: ContextEvaluator,
}

impl ShieldEngineBuilder {
    pub fn from_rule_set(rule_set: RuleSet) -> Self {
        Self {
            rule_set: Some(rule_set),
            rules_path: None,
            ..Self::defaults()
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            rule_set: None,
            rules_path: Some(path.into()),
            ..Self::defaults()
        }
    }

    fn defaults() -> Self {
        Self {
            rule_set: None,
            rules_path: None,
            mode: ShieldMode::Enforce,
            fail_open: true,
            pii_enabled: true,
            pii_config: PiiDetectorConfig::default(),
            sanitizer: None,
            rate_limiter: None,
            adaptive_limiter: None,
            tracer: None,
            approval_backend: None,
            approval_cache: ApprovalCache::default(),
            approval_timeout: Duration::from_secs(300),
            approval_wait: true,
            on_timeout: TimeoutPolicy::Block,
            session_ttl: Duration::from_secs(3600),
            context_eval: ContextEvaluator::new(),
        }
    }

    pub fn mode(mut self, mode: ShieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn pii_enabled(mut self, enabled: bool) -> Self {
        self.pii_enabled = enabled;
        self
    }

    pub fn pii_config(mut self, config: PiiDetectorConfig) -> Self {
        self.pii_config = config;
        self
    }

    pub fn sanitizer(mut self, sanitizer: InputSanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Per-session burst damping on top of the windowed limits.
    pub fn adaptive_rate_limiter(mut self, limiter: AdaptiveRateLimiter) -> Self {
        self.adaptive_limiter = Some(limiter);
        self
    }

    pub fn trace_recorder(mut self, tracer: TraceRecorder) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn approval_backend(mut self, backend: Arc<dyn ApprovalBackend>) -> Self {
        self.approval_backend = Some(backend);
        self
    }

    pub fn approval_cache(mut self, cache: ApprovalCache) -> Self {
        self.approval_cache = cache;
        self
    }

    pub fn approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// When false, APPROVE verdicts return immediately with a pending
    /// `approval_id` instead of blocking for the response.
    pub fn approval_wait(mut self, wait: bool) -> Self {
        self.approval_wait = wait;
        self
    }

    pub fn on_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn context_evaluator(mut self, context_eval: ContextEvaluator) -> Self {
        self.context_eval = context_eval;
        self
    }

    pub fn build(self) -> Result<ShieldEngine, ShieldError> {
        let rule_set = match (self.rule_set, &self.rules_path) {
            (Some(rs), _) => rs,
            (None, Some(path)) => load_rules(path)?,
            (None, None) => {
                return Err(ShieldError::Configuration(
                    "engine needs a rule set or a rules path".to_string(),
                ))
            }
        };
        let policy = CompiledPolicy::build(rule_set, self.pii_enabled, &self.pii_config)?;

        Ok(ShieldEngine {
            inner: Arc::new(EngineInner {
                policy: RwLock::new(Arc::new(policy)),
                shadow: RwLock::new(None),
                rules_path: self.rules_path,
                mode: RwLock::new(self.mode),
                kill_reason: RwLock::new(None),
                fail_open: self.fail_open,
                pii_enabled: self.pii_enabled,
                pii_config: self.pii_config,
                sanitizer: self.sanitizer,
                rate_limiter: self.rate_limiter,
                adaptive_limiter: self.adaptive_limiter,
                tracer: self.tracer,
                sessions: SessionManager::new(self.session_ttl),
                approval_backend: self.approval_backend,
                approval_cache: self.approval_cache,
                approval_timeout: self.approval_timeout,
                approval_wait: self.approval_wait,
                on_timeout: self.on_timeout,
                context_eval: self.context_eval,
                pending_approvals: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct EngineInner {
    policy: RwLock<Arc<CompiledPolicy>>,
    shadow: RwLock<Option<Arc<CompiledPolicy>>>,
    rules_path: Option<PathBuf>,
    mode: RwLock<ShieldMode>,
    kill_reason: RwLock<Option<String>>,
    fail_open: bool,
    pii_enabled: bool,
    pii_config: PiiDetectorConfig,
    sanitizer: Option<InputSanitizer>,
    rate_limiter: Option<RateLimiter>,
    adaptive_limiter: Option<AdaptiveRateLimiter>,
    tracer: Option<TraceRecorder>,
    sessions: SessionManager,
    approval_backend: Option<Arc<dyn ApprovalBackend>>,
    approval_cache: ApprovalCache,
    approval_timeout: Duration,
    approval_wait: bool,
    on_timeout: TimeoutPolicy,
    context_eval: ContextEvaluator,
    pending_approvals: Mutex<HashMap<String, PendingApproval>>,
}

/// The engine. Cheap to clone; all state is shared behind an `Arc`.
#[derive(Clone)]
pub struct ShieldEngine {
    inner: Arc<EngineInner>,
}

impl ShieldEngine {
    /// Engine with default components over an in-memory rule set.
    pub fn new(rule_set: RuleSet) -> Result<Self, ShieldError> {
        ShieldEngineBuilder::from_rule_set(rule_set).build()
    }

    pub fn builder(rule_set: RuleSet) -> ShieldEngineBuilder {
        ShieldEngineBuilder::from_rule_set(rule_set)
    }

    fn policy(&self) -> Arc<CompiledPolicy> {
        self.inner
            .policy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // ------------------------------------------------------------------
    //  Check entry points
    // ------------------------------------------------------------------

    /// Pre-call check with the default session.
    pub fn check(&self, tool_name: &str, args: Value) -> ShieldResult {
        self.check_with(tool_name, args, "default", None, None)
    }

    /// Full pre-call check: sanitize → rate-limit → match → PII → verdict.
    pub fn check_with(
        &self,
        tool_name: &str,
        args: Value,
        session_id: &str,
        sender: Option<&str>,
        context: Option<Map<String, Value>>,
    ) -> ShieldResult {
        let mode = *self.inner.mode.read().unwrap_or_else(|p| p.into_inner());
        if mode == ShieldMode::Disabled {
            return VerdictBuilder::allow(None, None);
        }

        let started = Instant::now();

        // Kill switch overrides everything, including AUDIT mode
        if let Some(reason) = self.kill_reason() {
            let result = ShieldResult::synthetic(
                Verdict::Block,
                KILL_SWITCH_RULE_ID,
                format!("Kill switch active: {}", reason),
            );
            self.trace(&result, session_id, tool_name, started, Some(&args));
            return result;
        }

        let policy = self.policy();
        let outcome = self.do_check(&policy, tool_name, &args, session_id, sender, context.as_ref());
        let result = match outcome {
            Ok(result) => result,
            Err(e) if self.inner.fail_open => {
                warn!(error = %e, tool = tool_name, "Shield error (fail-open)");
                VerdictBuilder::allow(None, Some(&args))
            }
            Err(e) => {
                warn!(error = %e, tool = tool_name, "Shield error (fail-closed)");
                ShieldResult::synthetic(
                    Verdict::Block,
                    INTERNAL_ERROR_RULE_ID,
                    "Internal shield error",
                )
            }
        };

        let result = self.apply_post(result, mode, session_id, tool_name, started, &args);
        self.shadow_evaluate(&result, tool_name, &args, session_id, sender, context.as_ref());
        result
    }

    fn do_check(
        &self,
        policy: &CompiledPolicy,
        tool_name: &str,
        args: &Value,
        session_id: &str,
        sender: Option<&str>,
        context: Option<&Map<String, Value>>,
    ) -> Result<ShieldResult, ShieldError> {
        let inner = &self.inner;

        // Sanitize args
        let mut effective_args = args.clone();
        if let Some(sanitizer) = &inner.sanitizer {
            let sanitized = sanitizer.sanitize(args);
            if sanitized.rejected {
                return Ok(ShieldResult::synthetic(
                    Verdict::Block,
                    SANITIZER_RULE_ID,
                    sanitized.rejection_reason,
                ));
            }
            effective_args = sanitized.sanitized_args;
        }
        let args = &effective_args;

        // Rate limit check
        if let Some(rate_limiter) = &inner.rate_limiter {
            let rl = rate_limiter.check(tool_name, session_id);
            if !rl.allowed {
                return Ok(ShieldResult::synthetic(
                    Verdict::Block,
                    RATE_LIMIT_RULE_ID,
                    rl.message,
                ));
            }
        }

        // Adaptive burst damping. Counts attempts, not outcomes: a
        // session hammering the shield tightens its own limit even when
        // the calls are denied.
        if let Some(adaptive) = &inner.adaptive_limiter {
            let (allowed, message) = adaptive.check_and_adapt(session_id);
            if !allowed {
                return Ok(ShieldResult::synthetic(
                    Verdict::Block,
                    RATE_LIMIT_RULE_ID,
                    message,
                ));
            }
        }

        // Honeypots short-circuit before matching
        if let Some(hit) = policy.honeypots.check(tool_name) {
            return Ok(ShieldResult::synthetic(
                Verdict::Block,
                format!("{}:{}", HONEYPOT_RULE_PREFIX, tool_name),
                format!("[CRITICAL] {}", hit.message),
            ));
        }

        // Session snapshot for condition matching
        let session = inner.sessions.snapshot(session_id);

        // Taint chain: block outgoing tools while the session is tainted
        let taint_chain = &policy.rule_set.taint_chain;
        if taint_chain.enabled
            && session.pii_tainted
            && taint_chain.outgoing_tools.iter().any(|t| t == tool_name)
        {
            let detail = session
                .taint_details
                .clone()
                .unwrap_or_else(|| "session is PII-tainted".to_string());
            return Ok(ShieldResult::synthetic(
                Verdict::Block,
                TAINT_CHAIN_RULE_ID,
                format!("Outgoing call blocked: {}", detail),
            ));
        }

        let query = MatchQuery {
            tool_name,
            args,
            session: Some(&session),
            sender,
            context,
        };
        let best = policy.matcher.find_best_match(&query, &inner.context_eval);

        // PII scan on args (best-effort; never fails the check). Runs for
        // every verdict path, including no-match allows, so taints always
        // reflect what flowed through the session.
        let pii_matches = match &policy.pii {
            Some(pii) => pii.scan_value(args),
            None => Vec::new(),
        };
        for m in &pii_matches {
            inner.sessions.add_taint(session_id, m.pii_type);
        }

        let rule = match best {
            Some(compiled) => compiled.rule.clone(),
            None => {
                if policy.rule_set.default_verdict == Verdict::Allow {
                    let mut result = VerdictBuilder::allow(None, Some(args));
                    result.pii_matches = pii_matches;
                    return Ok(result);
                }
                default_verdict_rule(policy.rule_set.default_verdict)
            }
        };

        Ok(self.dispatch(policy, &rule, tool_name, args, session_id, pii_matches))
    }

    fn dispatch(
        &self,
        policy: &CompiledPolicy,
        rule: &RuleConfig,
        tool_name: &str,
        args: &Value,
        session_id: &str,
        pii_matches: Vec<PIIMatch>,
    ) -> ShieldResult {
        match rule.then {
            Verdict::Block => VerdictBuilder::block(rule, tool_name, Some(args), pii_matches),
            Verdict::Redact => {
                let (modified, scan_matches) = match &policy.pii {
                    Some(pii) => pii.redact_value(args),
                    None => (args.clone(), Vec::new()),
                };
                let all_pii = if pii_matches.is_empty() {
                    scan_matches
                } else {
                    pii_matches
                };
                VerdictBuilder::redact(rule, tool_name, Some(args), modified, all_pii)
            }
            Verdict::Approve => self.handle_approval(rule, tool_name, args, session_id),
            Verdict::Allow => VerdictBuilder::allow(Some(rule), Some(args)),
        }
    }

    // ------------------------------------------------------------------
    //  Approval plane
    // ------------------------------------------------------------------

    fn handle_approval(
        &self,
        rule: &RuleConfig,
        tool_name: &str,
        args: &Value,
        session_id: &str,
    ) -> ShieldResult {
        let inner = &self.inner;
        let Some(backend) = &inner.approval_backend else {
            return ShieldResult {
                verdict: Verdict::Block,
                rule_id: Some(rule.id.clone()),
                message: "No approval backend configured".to_string(),
                pii_matches: Vec::new(),
                original_args: Some(args.clone()),
                modified_args: None,
                approval_id: None,
            };
        };

        let strategy = rule.approval_strategy;

        // Cached decision resolves instantly
        if let Some(cached) = inner
            .approval_cache
            .get(tool_name, &rule.id, session_id, strategy)
        {
            if cached.approved {
                return VerdictBuilder::allow(Some(rule), Some(args));
            }
            return ShieldResult {
                verdict: Verdict::Block,
                rule_id: Some(rule.id.clone()),
                message: "cached denial".to_string(),
                pii_matches: Vec::new(),
                original_args: Some(args.clone()),
                modified_args: None,
                approval_id: None,
            };
        }

        let message = rule
            .message
            .clone()
            .unwrap_or_else(|| "Approval required".to_string());
        let request = ApprovalRequest::create(tool_name, args, &rule.id, &message, session_id);
        let request_id = request.request_id.clone();

        {
            let mut pending = inner
                .pending_approvals
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            pending.insert(
                request_id.clone(),
                PendingApproval {
                    tool_name: tool_name.to_string(),
                    rule_id: rule.id.clone(),
                    session_id: session_id.to_string(),
                    strategy,
                },
            );
        }

        backend.submit(request);

        if !inner.approval_wait {
            let mut result = VerdictBuilder::approve(rule, tool_name, Some(args));
            result.approval_id = Some(request_id);
            return result;
        }

        match backend.wait_for_response(&request_id, inner.approval_timeout) {
            Some(response) => {
                inner.approval_cache.put(
                    tool_name,
                    &rule.id,
                    session_id,
                    response.clone(),
                    strategy,
                );
                self.forget_pending(&request_id);
                if response.approved {
                    VerdictBuilder::allow(Some(rule), Some(args))
                } else {
                    let message = if response.responder.is_empty() {
                        "Approval denied".to_string()
                    } else {
                        format!("Approval denied by {}", response.responder)
                    };
                    ShieldResult {
                        verdict: Verdict::Block,
                        rule_id: Some(rule.id.clone()),
                        message,
                        pii_matches: Vec::new(),
                        original_args: Some(args.clone()),
                        modified_args: None,
                        approval_id: None,
                    }
                }
            }
            // Timeout: the pending request stays in the backend for the GC
            None => match inner.on_timeout {
                TimeoutPolicy::Block => ShieldResult {
                    verdict: Verdict::Block,
                    rule_id: Some(rule.id.clone()),
                    message: "Approval timed out".to_string(),
                    pii_matches: Vec::new(),
                    original_args: Some(args.clone()),
                    modified_args: None,
                    approval_id: None,
                },
                TimeoutPolicy::Allow => {
                    let mut result = VerdictBuilder::allow(Some(rule), Some(args));
                    result.message = "Approval timed out; allowed by policy".to_string();
                    result
                }
            },
        }
    }

    fn forget_pending(&self, request_id: &str) {
        self.inner
            .pending_approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(request_id);
    }

    /// Deliver an operator decision and populate the strategy cache so
    /// later checks resolve without re-queuing.
    pub fn respond_approval(
        &self,
        approval_id: &str,
        approved: bool,
        responder: &str,
        comment: &str,
    ) -> Result<(), ShieldError> {
        let backend = self
            .inner
            .approval_backend
            .as_ref()
            .ok_or_else(|| ShieldError::Approval("no approval backend configured".into()))?;
        backend.respond(approval_id, approved, responder, comment);

        let meta = {
            let mut pending = self
                .inner
                .pending_approvals
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            pending.remove(approval_id)
        };
        if let (Some(meta), Some(response)) = (meta, backend.response_for(approval_id)) {
            self.inner.approval_cache.put(
                &meta.tool_name,
                &meta.rule_id,
                &meta.session_id,
                response,
                meta.strategy,
            );
        }
        Ok(())
    }

    /// Current status of an approval request.
    pub fn approval_status(&self, approval_id: &str) -> ApprovalStatus {
        let Some(backend) = &self.inner.approval_backend else {
            return ApprovalStatus::Unknown;
        };
        if let Some(response) = backend.response_for(approval_id) {
            return if response.approved {
                ApprovalStatus::Approved {
                    responder: response.responder,
                }
            } else {
                ApprovalStatus::Denied {
                    responder: response.responder,
                }
            };
        }
        if backend
            .pending()
            .iter()
            .any(|r| r.request_id == approval_id)
        {
            return ApprovalStatus::Pending;
        }
        ApprovalStatus::Unknown
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        match &self.inner.approval_backend {
            Some(backend) => backend.pending(),
            None => Vec::new(),
        }
    }

    /// Reap approval requests older than `ttl`.
    pub fn approval_gc(&self, ttl: Duration) -> usize {
        let Some(backend) = &self.inner.approval_backend else {
            return 0;
        };
        let reaped = backend.gc(ttl);
        if reaped > 0 {
            // Drop metadata for requests the backend no longer tracks
            let live: std::collections::HashSet<String> = backend
                .pending()
                .into_iter()
                .map(|r| r.request_id)
                .collect();
            let mut pending = self
                .inner
                .pending_approvals
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            pending.retain(|id, _| live.contains(id) || backend.response_for(id).is_some());
        }
        reaped
    }

    pub fn approval_backend_health(&self) -> Option<crate::approval::BackendHealth> {
        self.inner.approval_backend.as_ref().map(|b| b.health())
    }

    // ------------------------------------------------------------------
    //  Post-pipeline bookkeeping
    // ------------------------------------------------------------------

    fn apply_post(
        &self,
        result: ShieldResult,
        mode: ShieldMode,
        session_id: &str,
        tool_name: &str,
        started: Instant,
        args: &Value,
    ) -> ShieldResult {
        let inner = &self.inner;

        // In AUDIT mode, always allow but keep the would-be attribution
        let result = if mode == ShieldMode::Audit && result.verdict != Verdict::Allow {
            info!(
                tool = tool_name,
                would_be = result.verdict.as_str(),
                rule_id = result.rule_id.as_deref().unwrap_or(""),
                "AUDIT override"
            );
            ShieldResult {
                verdict: Verdict::Allow,
                message: format!("[AUDIT] {}", result.message),
                ..result
            }
        } else {
            result
        };

        // Count the call only when the tool will actually execute
        if !matches!(result.verdict, Verdict::Block | Verdict::Approve) {
            inner.sessions.increment(session_id, tool_name);
            inner
                .sessions
                .record_event(session_id, tool_name, result.verdict);
            if let Some(rate_limiter) = &inner.rate_limiter {
                rate_limiter.record(tool_name, session_id);
            }
        }

        self.trace(&result, session_id, tool_name, started, Some(args));
        result
    }

    fn trace(
        &self,
        result: &ShieldResult,
        session_id: &str,
        tool_name: &str,
        started: Instant,
        args: Option<&Value>,
    ) {
        let Some(tracer) = &self.inner.tracer else {
            return;
        };
        let pii_types = result
            .pii_matches
            .iter()
            .map(|m| m.pii_type.as_str().to_string())
            .collect();
        let approval = result
            .approval_id
            .as_ref()
            .map(|id| serde_json::json!({ "approval_id": id }));
        tracer.record(
            session_id,
            tool_name,
            result.verdict,
            result.rule_id.as_deref(),
            pii_types,
            started.elapsed().as_secs_f64() * 1000.0,
            args,
            approval,
        );
    }

    fn shadow_evaluate(
        &self,
        live: &ShieldResult,
        tool_name: &str,
        args: &Value,
        session_id: &str,
        sender: Option<&str>,
        context: Option<&Map<String, Value>>,
    ) {
        let shadow = self
            .inner
            .shadow
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(shadow) = shadow else { return };

        let session = self.inner.sessions.snapshot(session_id);
        let query = MatchQuery {
            tool_name,
            args,
            session: Some(&session),
            sender,
            context,
        };
        let shadow_verdict = shadow
            .matcher
            .find_best_match(&query, &self.inner.context_eval)
            .map(|c| c.rule.then)
            .unwrap_or(shadow.rule_set.default_verdict);

        if shadow_verdict != live.verdict {
            warn!(
                tool = tool_name,
                session_id,
                live = live.verdict.as_str(),
                shadow = shadow_verdict.as_str(),
                "Shadow rule set disagrees with live verdict"
            );
        }
    }

    // ------------------------------------------------------------------
    //  Post-check (tool output scanning)
    // ------------------------------------------------------------------

    /// Scan the tool's output for PII; detected types taint the session.
    pub fn post_check(&self, _tool_name: &str, output: &Value, session_id: &str) -> ShieldResult {
        let mode = *self.inner.mode.read().unwrap_or_else(|p| p.into_inner());
        if mode == ShieldMode::Disabled {
            return VerdictBuilder::allow(None, None);
        }

        let policy = self.policy();
        let (pii_matches, redacted_output) = match (&policy.pii, output) {
            (Some(pii), Value::String(s)) => {
                let (redacted, matches) = pii.redact(s);
                let redacted = (!matches.is_empty()).then(|| Value::String(redacted));
                (matches, redacted)
            }
            (Some(pii), value) => (pii.scan_value(value), None),
            (None, _) => (Vec::new(), None),
        };
        for m in &pii_matches {
            self.inner.sessions.add_taint(session_id, m.pii_type);
        }

        let mut result = VerdictBuilder::allow(None, None);
        result.pii_matches = pii_matches;
        result.modified_args = redacted_output;
        result
    }

    // ------------------------------------------------------------------
    //  Kill switch
    // ------------------------------------------------------------------

    pub fn kill(&self, reason: &str) {
        let mut kill = self
            .inner
            .kill_reason
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *kill = Some(reason.to_string());
        warn!(reason, "Kill switch activated");
    }

    pub fn resume(&self) {
        let mut kill = self
            .inner
            .kill_reason
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *kill = None;
        info!("Kill switch cleared");
    }

    pub fn is_killed(&self) -> bool {
        self.kill_reason().is_some()
    }

    fn kill_reason(&self) -> Option<String> {
        self.inner
            .kill_reason
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // ------------------------------------------------------------------
    //  Rule management
    // ------------------------------------------------------------------

    /// Reload rules from disk (or swap in the given set) atomically.
    /// In-flight checks continue on their pre-swap snapshot; on failure
    /// the previous rule set stays active.
    pub fn reload_rules(&self, rule_set: Option<RuleSet>) -> Result<usize, ShieldError> {
        let rule_set = match (rule_set, &self.inner.rules_path) {
            (Some(rs), _) => rs,
            (None, Some(path)) => load_rules(path)?,
            (None, None) => {
                return Err(ShieldError::Configuration(
                    "reload requested but engine has no rules path".to_string(),
                ))
            }
        };
        let count = rule_set.rules.len();
        let policy =
            CompiledPolicy::build(rule_set, self.inner.pii_enabled, &self.inner.pii_config)?;
        let mut live = self.inner.policy.write().unwrap_or_else(|p| p.into_inner());
        *live = Arc::new(policy);
        info!(rules = count, "Rules reloaded");
        Ok(count)
    }

    /// Install a shadow rule set evaluated alongside the live one,
    /// purely to log verdict differences.
    pub fn set_shadow_rules(&self, rule_set: RuleSet) -> Result<(), ShieldError> {
        let policy =
            CompiledPolicy::build(rule_set, self.inner.pii_enabled, &self.inner.pii_config)?;
        let mut shadow = self.inner.shadow.write().unwrap_or_else(|p| p.into_inner());
        *shadow = Some(Arc::new(policy));
        Ok(())
    }

    pub fn clear_shadow_rules(&self) {
        let mut shadow = self.inner.shadow.write().unwrap_or_else(|p| p.into_inner());
        *shadow = None;
    }

    pub fn rule_count(&self) -> usize {
        self.policy().matcher.rule_count()
    }

    pub fn shield_name(&self) -> String {
        self.policy().rule_set.shield_name.clone()
    }

    pub fn rules_version(&self) -> i64 {
        self.policy().rule_set.version
    }

    /// A stable short hash of the active rule set for change detection.
    pub fn rules_hash(&self) -> String {
        let policy = self.policy();
        let rs = &policy.rule_set;
        let mut raw = format!("{}:{}:{}", rs.shield_name, rs.version, rs.rules.len());
        for rule in &rs.rules {
            raw.push_str(&format!("|{}:{}", rule.id, rule.then));
        }
        hex::encode(Sha256::digest(raw.as_bytes()))[..16].to_string()
    }

    /// Human-readable summary of the active policy.
    pub fn policy_summary(&self) -> String {
        let policy = self.policy();
        let rs = &policy.rule_set;
        let mut lines = vec![format!(
            "Shield '{}' v{} — {} rules, default {}",
            rs.shield_name,
            rs.version,
            rs.rules.len(),
            rs.default_verdict
        )];
        for rule in rs.enabled_rules() {
            let desc = if rule.description.is_empty() {
                rule.message.clone().unwrap_or_default()
            } else {
                rule.description.clone()
            };
            lines.push(format!("- [{}] {}: {}", rule.then, rule.id, desc));
        }
        if !rs.honeypots.is_empty() {
            let names: Vec<&str> = rs.honeypots.iter().map(|h| h.name.as_str()).collect();
            lines.push(format!("Honeypots: {}", names.join(", ")));
        }
        lines.join("\n")
    }

    // ------------------------------------------------------------------
    //  Mode, sessions, traces
    // ------------------------------------------------------------------

    pub fn mode(&self) -> ShieldMode {
        *self.inner.mode.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_mode(&self, mode: ShieldMode) {
        *self.inner.mode.write().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn flush_traces(&self) {
        if let Some(tracer) = &self.inner.tracer {
            tracer.flush();
        }
    }

    pub fn sweep_traces(&self) -> usize {
        match &self.inner.tracer {
            Some(tracer) => tracer.sweep_retention(),
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    //  Async facade
    // ------------------------------------------------------------------

    /// Async pre-call check. The blocking pipeline (regex matching, PII
    /// scans, approval waits) runs on the blocking-thread pool.
    pub async fn check_async(
        &self,
        tool_name: String,
        args: Value,
        session_id: String,
        sender: Option<String>,
        context: Option<Map<String, Value>>,
    ) -> ShieldResult {
        let engine = self.clone();
        let fail_open = self.inner.fail_open;
        tokio::task::spawn_blocking(move || {
            engine.check_with(&tool_name, args, &session_id, sender.as_deref(), context)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "check task panicked");
            if fail_open {
                VerdictBuilder::allow(None, None)
            } else {
                ShieldResult::synthetic(
                    Verdict::Block,
                    INTERNAL_ERROR_RULE_ID,
                    "Internal shield error",
                )
            }
        })
    }

    /// Async post-call check over the tool's output.
    pub async fn post_check_async(
        &self,
        tool_name: String,
        output: Value,
        session_id: String,
    ) -> ShieldResult {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.post_check(&tool_name, &output, &session_id))
            .await
            .unwrap_or_else(|_| VerdictBuilder::allow(None, None))
    }

    pub fn fail_open(&self) -> bool {
        self.inner.fail_open
    }
}

fn default_verdict_rule(verdict: Verdict) -> RuleConfig {
    RuleConfig {
        id: DEFAULT_RULE_ID.to_string(),
        description: "Default verdict".to_string(),
        when: WhenClause::default(),
        then: verdict,
        message: Some("No rule matched; applying default verdict".to_string()),
        severity: Severity::Low,
        enabled: true,
        priority: i32::MAX,
        approval_strategy: None,
        chain: None,
    }
}
