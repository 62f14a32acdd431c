// Unit tests for the engine orchestrator pipeline

use super::common::{engine, rule, rule_set, tool_rule};
use policyshield::core::models::{PIIType, RuleSet, ShieldMode, Verdict};
use policyshield::engine::rate_limiter::{RateLimitConfig, RateLimiter};
use policyshield::engine::sanitizer::{InputSanitizer, SanitizerConfig};
use policyshield::engine::shield::ShieldEngineBuilder;
use serde_json::json;

#[test]
fn blocking_rule_blocks_and_leaves_counters_untouched() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    let result = eng.check_with("exec", json!({"cmd": "rm -rf /"}), "s1", None, None);

    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("block-exec"));
    assert_eq!(eng.sessions().snapshot("s1").total_calls, 0);
}

#[test]
fn allowed_calls_increment_counters() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    eng.check_with("read_file", json!({}), "s1", None, None);
    eng.check_with("read_file", json!({}), "s1", None, None);

    let snapshot = eng.sessions().snapshot("s1");
    assert_eq!(snapshot.total_calls, 2);
    assert_eq!(snapshot.counter("tool_count.read_file"), 2.0);
}

#[test]
fn redaction_masks_args_and_counts_the_call() {
    let eng = engine(vec![tool_rule("redact-email", "send_email", "REDACT")]);
    let result = eng.check_with(
        "send_email",
        json!({"body": "Contact: john@example.com"}),
        "s1",
        None,
        None,
    );

    assert_eq!(result.verdict, Verdict::Redact);
    let modified = result.modified_args.expect("redaction sets modified_args");
    let body = modified["body"].as_str().unwrap();
    assert!(!body.contains("john@example.com"));
    assert!(body.contains("j***@e***.com"));
    assert!(result
        .pii_matches
        .iter()
        .any(|m| m.pii_type == PIIType::Email));

    // The call proceeds, so the session counts it
    assert_eq!(eng.sessions().snapshot("s1").total_calls, 1);
}

#[test]
fn no_match_allow_still_scans_and_taints() {
    // Empty rule set, default ALLOW: the PII step must still run
    let eng = engine(vec![]);
    let result = eng.check_with(
        "chat",
        json!({"msg": "ssn 123-45-6789"}),
        "s1",
        None,
        None,
    );

    assert_eq!(result.verdict, Verdict::Allow);
    assert!(result
        .pii_matches
        .iter()
        .any(|m| m.pii_type == PIIType::Ssn));

    let snapshot = eng.sessions().snapshot("s1");
    assert!(snapshot.pii_tainted);
    assert!(snapshot.taints.contains(&PIIType::Ssn));
}

#[test]
fn redaction_taints_the_session() {
    let eng = engine(vec![tool_rule("redact-email", "send_email", "REDACT")]);
    eng.check_with(
        "send_email",
        json!({"body": "john@example.com"}),
        "s1",
        None,
        None,
    );
    let snapshot = eng.sessions().snapshot("s1");
    assert!(snapshot.pii_tainted);
    assert!(snapshot.taints.contains(&PIIType::Email));
}

#[test]
fn chain_rule_fires_after_prerequisite_calls() {
    let eng = engine(vec![rule(
        "{id: exfil, when: {tool: send_email}, then: BLOCK, chain: [{tool: read_file, within_seconds: 300}]}",
    )]);

    // Before any read_file: no chain, send allowed
    let first = eng.check_with("send_email", json!({}), "s1", None, None);
    assert_eq!(first.verdict, Verdict::Allow);

    let read = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(read.verdict, Verdict::Allow);

    let second = eng.check_with("send_email", json!({}), "s1", None, None);
    assert_eq!(second.verdict, Verdict::Block);
    assert_eq!(second.rule_id.as_deref(), Some("exfil"));

    // A different session has its own buffer
    let other = eng.check_with("send_email", json!({}), "s2", None, None);
    assert_eq!(other.verdict, Verdict::Allow);
}

#[test]
fn rate_limit_blocks_fourth_call() {
    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![]))
        .rate_limiter(RateLimiter::new(vec![RateLimitConfig {
            tool: "api".to_string(),
            max_calls: 3,
            window_seconds: 60.0,
            per_session: true,
            message: "Rate limit exceeded".to_string(),
        }]))
        .build()
        .unwrap();

    for _ in 0..3 {
        let result = eng.check_with("api", json!({}), "s1", None, None);
        assert_eq!(result.verdict, Verdict::Allow);
    }
    let fourth = eng.check_with("api", json!({}), "s1", None, None);
    assert_eq!(fourth.verdict, Verdict::Block);
    assert_eq!(fourth.rule_id.as_deref(), Some("__rate_limit__"));

    // The blocked call is not counted against the session
    assert_eq!(eng.sessions().snapshot("s1").total_calls, 3);
}

#[test]
fn adaptive_limiter_blocks_bursting_sessions() {
    use policyshield::engine::rate_limiter::AdaptiveRateLimiter;

    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![]))
        .adaptive_rate_limiter(AdaptiveRateLimiter::new(2, 60.0, 2.0, 0.5, 600.0))
        .build()
        .unwrap();

    assert_eq!(
        eng.check_with("api", json!({}), "s1", None, None).verdict,
        Verdict::Allow
    );
    assert_eq!(
        eng.check_with("api", json!({}), "s1", None, None).verdict,
        Verdict::Allow
    );
    let third = eng.check_with("api", json!({}), "s1", None, None);
    assert_eq!(third.verdict, Verdict::Block);
    assert_eq!(third.rule_id.as_deref(), Some("__rate_limit__"));
    assert!(third.message.contains("Adaptive"));

    // Sessions adapt independently
    let other = eng.check_with("api", json!({}), "s2", None, None);
    assert_eq!(other.verdict, Verdict::Allow);
}

#[test]
fn sanitizer_rejection_blocks_before_matching() {
    let sanitizer = InputSanitizer::new(SanitizerConfig {
        builtin_detectors: vec!["path_traversal".to_string()],
        ..SanitizerConfig::default()
    })
    .unwrap();
    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![]))
        .sanitizer(sanitizer)
        .build()
        .unwrap();

    let result = eng.check_with("read_file", json!({"path": "../../etc/passwd"}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("__sanitizer__"));
    assert!(result.message.contains("path_traversal"));
}

#[test]
fn honeypot_blocks_with_synthetic_rule_id() {
    let mut rs = rule_set(vec![]);
    rs.honeypots = serde_yaml::from_str("[{name: admin_backdoor, alert: intrusion}]").unwrap();
    let eng = ShieldEngineBuilder::from_rule_set(rs).build().unwrap();

    let result = eng.check_with("admin_backdoor", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("__honeypot__:admin_backdoor"));
    assert!(result.message.contains("intrusion"));
}

#[test]
fn audit_mode_allows_but_keeps_attribution() {
    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![tool_rule(
        "block-exec",
        "exec",
        "BLOCK",
    )]))
    .mode(ShieldMode::Audit)
    .build()
    .unwrap();

    let result = eng.check_with("exec", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Allow);
    assert_eq!(result.rule_id.as_deref(), Some("block-exec"));
    assert!(result.message.starts_with("[AUDIT]"));
}

#[test]
fn kill_switch_blocks_everything_even_in_audit() {
    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![]))
        .mode(ShieldMode::Audit)
        .build()
        .unwrap();
    assert!(!eng.is_killed());

    eng.kill("Active exploit detected");
    assert!(eng.is_killed());

    let result = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("__kill_switch__"));
    assert!(result.message.contains("Active exploit"));
    assert_eq!(eng.sessions().snapshot("s1").total_calls, 0);

    eng.resume();
    assert!(!eng.is_killed());
    let result = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Allow);
}

#[test]
fn disabled_mode_allows_without_bookkeeping() {
    let eng = ShieldEngineBuilder::from_rule_set(rule_set(vec![tool_rule(
        "block-all",
        ".*",
        "BLOCK",
    )]))
    .mode(ShieldMode::Disabled)
    .build()
    .unwrap();

    let result = eng.check_with("anything", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Allow);
    assert_eq!(eng.sessions().snapshot("s1").total_calls, 0);
}

#[test]
fn default_verdict_applies_when_no_rule_matches() {
    let mut rs = rule_set(vec![]);
    rs.default_verdict = Verdict::Block;
    let eng = ShieldEngineBuilder::from_rule_set(rs).build().unwrap();

    let result = eng.check_with("anything", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("__default__"));
}

#[test]
fn post_check_taints_session_with_output_pii() {
    let eng = engine(vec![]);
    let result = eng.post_check(
        "web_fetch",
        &json!("the user's card is 4111 1111 1111 1111"),
        "s1",
    );
    assert_eq!(result.verdict, Verdict::Allow);
    assert!(result
        .pii_matches
        .iter()
        .any(|m| m.pii_type == PIIType::CreditCard));
    let redacted = result.modified_args.expect("string output is redacted");
    assert!(!redacted.as_str().unwrap().contains("4111 1111 1111 1111"));

    let snapshot = eng.sessions().snapshot("s1");
    assert!(snapshot.taints.contains(&PIIType::CreditCard));
}

#[test]
fn taint_chain_blocks_outgoing_tools_until_cleared() {
    let mut rs = rule_set(vec![]);
    rs.taint_chain =
        serde_yaml::from_str("{enabled: true, outgoing_tools: [send_email]}").unwrap();
    let eng = ShieldEngineBuilder::from_rule_set(rs).build().unwrap();

    // Taint the session via tool output
    eng.post_check("read_file", &json!("ssn 123-45-6789"), "s1");

    let blocked = eng.check_with("send_email", json!({}), "s1", None, None);
    assert_eq!(blocked.verdict, Verdict::Block);
    assert_eq!(blocked.rule_id.as_deref(), Some("__taint_chain__"));

    // Non-outgoing tools still work
    let ok = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(ok.verdict, Verdict::Allow);

    // Clearing the taint re-enables outgoing calls
    eng.sessions().clear_taint("s1");
    let after = eng.check_with("send_email", json!({}), "s1", None, None);
    assert_eq!(after.verdict, Verdict::Allow);
}

#[test]
fn reload_swaps_rules_atomically() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    assert_eq!(
        eng.check_with("exec", json!({}), "s1", None, None).verdict,
        Verdict::Block
    );
    let old_hash = eng.rules_hash();

    let replacement = RuleSet::new("test-shield", 2, vec![]);
    eng.reload_rules(Some(replacement)).unwrap();
    assert_ne!(eng.rules_hash(), old_hash);
    assert_eq!(
        eng.check_with("exec", json!({}), "s1", None, None).verdict,
        Verdict::Allow
    );
}

#[test]
fn reload_without_path_or_set_fails_and_keeps_rules() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    assert!(eng.reload_rules(None).is_err());
    assert_eq!(eng.rule_count(), 1);
}

#[test]
fn shadow_rules_never_change_the_live_verdict() {
    let eng = engine(vec![]);
    eng.set_shadow_rules(RuleSet::new(
        "shadow",
        1,
        vec![tool_rule("shadow-block", "read_file", "BLOCK")],
    ))
    .unwrap();

    let result = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Allow);

    eng.clear_shadow_rules();
    let result = eng.check_with("read_file", json!({}), "s1", None, None);
    assert_eq!(result.verdict, Verdict::Allow);
}

#[test]
fn rules_hash_is_stable_and_short() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    let h1 = eng.rules_hash();
    let h2 = eng.rules_hash();
    assert_eq!(h1, h2);
    assert_eq!(h1.len(), 16);
}

#[test]
fn policy_summary_names_rules_and_honeypots() {
    let mut rs = rule_set(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    rs.honeypots = serde_yaml::from_str("[{name: decoy}]").unwrap();
    let eng = ShieldEngineBuilder::from_rule_set(rs).build().unwrap();

    let summary = eng.policy_summary();
    assert!(summary.contains("block-exec"));
    assert!(summary.contains("decoy"));
}

#[tokio::test]
async fn async_check_matches_sync_semantics() {
    let eng = engine(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    let result = eng
        .check_async(
            "exec".to_string(),
            json!({"cmd": "rm"}),
            "s1".to_string(),
            None,
            None,
        )
        .await;
    assert_eq!(result.verdict, Verdict::Block);
    assert_eq!(result.rule_id.as_deref(), Some("block-exec"));
}
