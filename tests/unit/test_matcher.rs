// Unit tests for the rule matcher

use super::common::{rule, rule_set, tool_rule};
use policyshield::core::models::Verdict;
use policyshield::engine::context::ContextEvaluator;
use policyshield::engine::matcher::{MatchQuery, MatcherEngine};
use policyshield::state::events::EventRingBuffer;
use policyshield::state::session::SessionSnapshot;
use serde_json::{json, Map, Value};

fn matcher(rules: Vec<policyshield::core::models::RuleConfig>) -> MatcherEngine {
    MatcherEngine::new(&rule_set(rules)).expect("matcher should compile")
}

fn query<'a>(tool_name: &'a str, args: &'a Value) -> MatchQuery<'a> {
    MatchQuery {
        tool_name,
        args,
        session: None,
        sender: None,
        context: None,
    }
}

fn best_id(m: &MatcherEngine, q: &MatchQuery<'_>) -> Option<String> {
    m.find_best_match(q, &ContextEvaluator::new())
        .map(|c| c.rule.id.clone())
}

#[test]
fn exact_tool_name_matches() {
    let m = matcher(vec![tool_rule("block-exec", "exec", "BLOCK")]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("exec", &args)), Some("block-exec".into()));
    assert_eq!(best_id(&m, &query("read_file", &args)), None);
}

#[test]
fn regex_tool_pattern_is_anchored() {
    let m = matcher(vec![tool_rule("files", "file_.*", "BLOCK")]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("file_read", &args)), Some("files".into()));
    // Anchored: must match the whole name
    assert_eq!(best_id(&m, &query("my_file_read", &args)), None);
}

#[test]
fn tool_list_entries_are_exact_names() {
    let m = matcher(vec![rule(
        "{id: pair, when: {tool: [read_file, write_file]}, then: BLOCK}",
    )]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("read_file", &args)), Some("pair".into()));
    assert_eq!(best_id(&m, &query("write_file", &args)), Some("pair".into()));
    assert_eq!(best_id(&m, &query("read_files", &args)), None);
}

#[test]
fn rule_without_tool_applies_to_every_call() {
    let m = matcher(vec![rule("{id: everything, when: {}, then: BLOCK}")]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("anything", &args)), Some("everything".into()));
}

#[test]
fn disabled_rules_are_skipped() {
    let m = matcher(vec![rule(
        "{id: off, when: {tool: exec}, then: BLOCK, enabled: false}",
    )]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("exec", &args)), None);
}

#[test]
fn arg_regex_uses_search_not_full_match() {
    let m = matcher(vec![rule(
        r#"{id: rm, when: {tool: exec, args: {cmd: {regex: "rm -rf"}}}, then: BLOCK}"#,
    )]);
    let args = json!({"cmd": "sudo rm -rf / please"});
    assert_eq!(best_id(&m, &query("exec", &args)), Some("rm".into()));
}

#[test]
fn arg_predicates_eq_contains_not_contains() {
    let m = matcher(vec![
        rule(r#"{id: eq, when: {tool: a, args: {env: {eq: prod}}}, then: BLOCK}"#),
        rule(r#"{id: contains, when: {tool: b, args: {path: {contains: secret}}}, then: BLOCK}"#),
        rule(r#"{id: not-contains, when: {tool: c, args: {path: {not_contains: allowed}}}, then: BLOCK}"#),
    ]);

    assert_eq!(best_id(&m, &query("a", &json!({"env": "prod"}))), Some("eq".into()));
    assert_eq!(best_id(&m, &query("a", &json!({"env": "production"}))), None);

    assert_eq!(
        best_id(&m, &query("b", &json!({"path": "/etc/secrets/key"}))),
        Some("contains".into())
    );
    assert_eq!(best_id(&m, &query("b", &json!({"path": "/tmp/x"}))), None);

    assert_eq!(
        best_id(&m, &query("c", &json!({"path": "/etc/passwd"}))),
        Some("not-contains".into())
    );
    assert_eq!(best_id(&m, &query("c", &json!({"path": "/allowed/x"}))), None);
}

#[test]
fn missing_arg_field_never_matches_except_not_contains() {
    let m = matcher(vec![
        rule(r#"{id: re, when: {tool: a, args: {cmd: {regex: ".*"}}}, then: BLOCK}"#),
        rule(r#"{id: nc, when: {tool: b, args: {cmd: {not_contains: rm}}}, then: BLOCK}"#),
    ]);
    let empty = json!({});
    assert_eq!(best_id(&m, &query("a", &empty)), None);
    assert_eq!(best_id(&m, &query("b", &empty)), Some("nc".into()));
}

#[test]
fn non_string_args_match_on_string_form() {
    let m = matcher(vec![rule(
        r#"{id: num, when: {tool: a, args: {count: {eq: "42"}}}, then: BLOCK}"#,
    )]);
    assert_eq!(best_id(&m, &query("a", &json!({"count": 42}))), Some("num".into()));
}

#[test]
fn ranking_priority_then_verdict_then_severity() {
    // Lower priority wins regardless of verdict
    let m = matcher(vec![
        rule("{id: loose, when: {tool: t}, then: BLOCK, priority: 10}"),
        rule("{id: specific, when: {tool: t}, then: ALLOW, priority: 1}"),
    ]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("t", &args)), Some("specific".into()));

    // Same priority: more restrictive verdict wins
    let m = matcher(vec![
        rule("{id: allow, when: {tool: t}, then: ALLOW}"),
        rule("{id: block, when: {tool: t}, then: BLOCK}"),
    ]);
    assert_eq!(best_id(&m, &query("t", &args)), Some("block".into()));

    // Same priority and verdict: higher severity wins
    let m = matcher(vec![
        rule("{id: low, when: {tool: t}, then: BLOCK, severity: low}"),
        rule("{id: crit, when: {tool: t}, then: BLOCK, severity: critical}"),
    ]);
    assert_eq!(best_id(&m, &query("t", &args)), Some("crit".into()));
}

#[test]
fn ranking_is_stable_for_equal_keys() {
    let m = matcher(vec![
        rule("{id: first, when: {tool: t}, then: BLOCK}"),
        rule("{id: second, when: {tool: t}, then: BLOCK}"),
    ]);
    let args = json!({});
    for _ in 0..10 {
        assert_eq!(best_id(&m, &query("t", &args)), Some("first".into()));
    }
}

#[test]
fn session_conditions_compare_counters() {
    let m = matcher(vec![rule(
        "{id: chatty, when: {tool: t, session: {total_calls: {gte: 5}}}, then: BLOCK}",
    )]);
    let args = json!({});

    let mut snapshot = SessionSnapshot {
        total_calls: 4,
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("t", &args)
    };
    assert_eq!(best_id(&m, &q), None);

    snapshot.total_calls = 5;
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("t", &args)
    };
    assert_eq!(best_id(&m, &q), Some("chatty".into()));
}

#[test]
fn session_tool_count_defaults_to_zero() {
    let m = matcher(vec![rule(
        "{id: fresh, when: {tool: t, session: {tool_count.exec: {lt: 1}}}, then: BLOCK}",
    )]);
    let args = json!({});
    let snapshot = SessionSnapshot::default();
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("t", &args)
    };
    // Missing counter is 0, which is < 1
    assert_eq!(best_id(&m, &q), Some("fresh".into()));
}

#[test]
fn session_conditions_require_a_session() {
    let m = matcher(vec![rule(
        "{id: needy, when: {tool: t, session: {total_calls: {gte: 0}}}, then: BLOCK}",
    )]);
    let args = json!({});
    assert_eq!(best_id(&m, &query("t", &args)), None);
}

#[test]
fn sender_pattern_is_anchored() {
    let m = matcher(vec![rule(
        r#"{id: bots, when: {tool: t, sender: "bot-.*"}, then: BLOCK}"#,
    )]);
    let args = json!({});
    let q = MatchQuery {
        sender: Some("bot-7"),
        ..query("t", &args)
    };
    assert_eq!(best_id(&m, &q), Some("bots".into()));

    let q = MatchQuery {
        sender: Some("human"),
        ..query("t", &args)
    };
    assert_eq!(best_id(&m, &q), None);

    // Sender clause with no sender supplied fails the rule
    assert_eq!(best_id(&m, &query("t", &args)), None);
}

#[test]
fn context_conditions_consult_the_query_context() {
    let m = matcher(vec![rule(
        "{id: prod-block, when: {tool: deploy, context: {env: production}}, then: BLOCK}",
    )]);
    let args = json!({});

    let ctx: Map<String, Value> = json!({"env": "production"})
        .as_object()
        .cloned()
        .unwrap();
    let q = MatchQuery {
        context: Some(&ctx),
        ..query("deploy", &args)
    };
    assert_eq!(best_id(&m, &q), Some("prod-block".into()));

    let ctx: Map<String, Value> = json!({"env": "staging"}).as_object().cloned().unwrap();
    let q = MatchQuery {
        context: Some(&ctx),
        ..query("deploy", &args)
    };
    assert_eq!(best_id(&m, &q), None);

    // No context at all: positive condition fails
    assert_eq!(best_id(&m, &query("deploy", &args)), None);
}

#[test]
fn chain_requires_events_in_the_buffer() {
    let m = matcher(vec![rule(
        "{id: exfil, when: {tool: send_email}, then: BLOCK, chain: [{tool: read_file, within_seconds: 300}]}",
    )]);
    let args = json!({});

    // No session at all: chain fails
    assert_eq!(best_id(&m, &query("send_email", &args)), None);

    // Empty buffer: chain fails
    let snapshot = SessionSnapshot::default();
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("send_email", &args)
    };
    assert_eq!(best_id(&m, &q), None);

    // A recent read_file event satisfies the step
    let mut buffer = EventRingBuffer::default();
    buffer.add("read_file", Verdict::Allow);
    let snapshot = SessionSnapshot {
        events: buffer.snapshot(),
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("send_email", &args)
    };
    assert_eq!(best_id(&m, &q), Some("exfil".into()));
}

#[test]
fn chain_min_count_and_verdict_filter() {
    let m = matcher(vec![rule(
        "{id: bulk, when: {tool: send_email}, then: BLOCK, chain: [{tool: read_file, min_count: 2, verdict: ALLOW}]}",
    )]);
    let args = json!({});

    let mut buffer = EventRingBuffer::default();
    buffer.add("read_file", Verdict::Allow);
    buffer.add("read_file", Verdict::Redact);
    let snapshot = SessionSnapshot {
        events: buffer.snapshot(),
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("send_email", &args)
    };
    // Only one ALLOW event; min_count 2 not met
    assert_eq!(best_id(&m, &q), None);

    buffer.add("read_file", Verdict::Allow);
    let snapshot = SessionSnapshot {
        events: buffer.snapshot(),
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("send_email", &args)
    };
    assert_eq!(best_id(&m, &q), Some("bulk".into()));
}

#[test]
fn every_chain_step_must_be_satisfied() {
    let m = matcher(vec![rule(
        "{id: two-step, when: {tool: upload}, then: BLOCK, chain: [{tool: read_file}, {tool: zip_files}]}",
    )]);
    let args = json!({});

    let mut buffer = EventRingBuffer::default();
    buffer.add("read_file", Verdict::Allow);
    let snapshot = SessionSnapshot {
        events: buffer.snapshot(),
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("upload", &args)
    };
    assert_eq!(best_id(&m, &q), None);

    buffer.add("zip_files", Verdict::Allow);
    let snapshot = SessionSnapshot {
        events: buffer.snapshot(),
        ..SessionSnapshot::default()
    };
    let q = MatchQuery {
        session: Some(&snapshot),
        ..query("upload", &args)
    };
    assert_eq!(best_id(&m, &q), Some("two-step".into()));
}
