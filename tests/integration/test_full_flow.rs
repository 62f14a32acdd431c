// End-to-end flows: config-driven engines, traces on disk, webhook approvals

use policyshield::approval::webhook::{
    compute_signature, verify_signature, WebhookBackend, WebhookConfig, WebhookMode,
};
use policyshield::approval::{ApprovalBackend, ApprovalRequest};
use policyshield::config::ShieldConfig;
use policyshield::core::models::Verdict;
use serde_json::json;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn config_driven_engine_enforces_rules_and_traces() {
    let dir = TempDir::new().unwrap();
    let rules = write(
        &dir,
        "rules.yaml",
        r#"
shield_name: flow-shield
version: 3
default_verdict: ALLOW
rules:
  - id: block-exec
    when:
      tool: exec
    then: BLOCK
    severity: high
  - id: redact-mail
    when:
      tool: send_email
    then: REDACT
"#,
    );
    let trace_dir = dir.path().join("traces");
    let config_file = write(
        &dir,
        "policyshield.yaml",
        &format!(
            r#"
policyshield:
  mode: ENFORCE
  rules_path: {}
  rate_limits:
    - tool: api
      max_calls: 2
      window_seconds: 60
  trace:
    enabled: true
    output_dir: {}
    batch_size: 1
"#,
            rules.display(),
            trace_dir.display()
        ),
    );

    let config = ShieldConfig::load(Some(&config_file)).unwrap();
    let engine = config.build_engine().unwrap();

    assert_eq!(engine.shield_name(), "flow-shield");
    assert_eq!(engine.rule_count(), 2);

    // Blocking rule
    let blocked = engine.check_with("exec", json!({"cmd": "rm"}), "s1", None, None);
    assert_eq!(blocked.verdict, Verdict::Block);

    // Redaction proceeds with masked args
    let redacted = engine.check_with(
        "send_email",
        json!({"body": "mail john@example.com"}),
        "s1",
        None,
        None,
    );
    assert_eq!(redacted.verdict, Verdict::Redact);
    assert!(redacted.modified_args.is_some());

    // Rate limit from config: third api call blocks
    assert_eq!(
        engine.check_with("api", json!({}), "s1", None, None).verdict,
        Verdict::Allow
    );
    assert_eq!(
        engine.check_with("api", json!({}), "s1", None, None).verdict,
        Verdict::Allow
    );
    let third = engine.check_with("api", json!({}), "s1", None, None);
    assert_eq!(third.verdict, Verdict::Block);
    assert_eq!(third.rule_id.as_deref(), Some("__rate_limit__"));

    // Traces land on disk as JSONL
    engine.flush_traces();
    let trace_files: Vec<_> = fs::read_dir(&trace_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(trace_files.len(), 1);
    let content = fs::read_to_string(trace_files[0].path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.len() >= 5);
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["tool"], "exec");
    assert_eq!(first["verdict"], "BLOCK");
    assert_eq!(first["rule_id"], "block-exec");
    // RFC 3339 UTC timestamps
    assert!(first["timestamp"].as_str().unwrap().contains('T'));
}

#[test]
fn engine_reloads_rules_from_directory() {
    let dir = TempDir::new().unwrap();
    let rules_dir = dir.path().join("policies");
    fs::create_dir(&rules_dir).unwrap();
    fs::write(
        rules_dir.join("base.yaml"),
        "shield_name: s\nversion: 1\nrules: []\n",
    )
    .unwrap();

    let config_file = write(
        &dir,
        "config.yaml",
        &format!(
            "policyshield:\n  rules_path: {}\n  trace:\n    enabled: false\n",
            rules_dir.display()
        ),
    );
    let config = ShieldConfig::load(Some(&config_file)).unwrap();
    let engine = config.build_engine().unwrap();
    assert_eq!(engine.rule_count(), 0);

    let before = engine.check_with("exec", json!({}), "s1", None, None);
    assert_eq!(before.verdict, Verdict::Allow);

    // Drop a new rule file and reload
    fs::write(
        rules_dir.join("extra.yaml"),
        "shield_name: s\nversion: 2\nrules:\n  - id: block-exec\n    when:\n      tool: exec\n    then: BLOCK\n",
    )
    .unwrap();
    assert_eq!(engine.reload_rules(None).unwrap(), 1);

    let after = engine.check_with("exec", json!({}), "s1", None, None);
    assert_eq!(after.verdict, Verdict::Block);
}

#[test]
fn sync_webhook_approval_round_trip() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/approve")
        .match_header("content-type", "application/json")
        .with_status(200)
        .with_body(r#"{"approved": true, "reason": "looks fine"}"#)
        .create();

    let backend = WebhookBackend::new(WebhookConfig {
        url: format!("{}/approve", server.url()),
        secret: Some("shared-secret".to_string()),
        mode: WebhookMode::Sync,
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_secs(5),
    })
    .unwrap();

    let request = ApprovalRequest::create("delete", &json!({"path": "/x"}), "r1", "", "s1");
    let id = request.request_id.clone();
    backend.submit(request);

    let response = backend
        .wait_for_response(&id, Duration::from_secs(1))
        .expect("sync webhook resolves during submit");
    assert!(response.approved);
    assert_eq!(response.comment, "looks fine");
    mock.assert();
}

#[test]
fn sync_webhook_denies_on_http_error() {
    let mut server = mockito::Server::new();
    server
        .mock("POST", "/approve")
        .with_status(500)
        .create();

    let backend = WebhookBackend::new(WebhookConfig {
        url: format!("{}/approve", server.url()),
        secret: None,
        mode: WebhookMode::Sync,
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_secs(5),
    })
    .unwrap();

    let request = ApprovalRequest::create("delete", &json!({}), "r1", "", "s1");
    let id = request.request_id.clone();
    backend.submit(request);

    let response = backend.wait_for_response(&id, Duration::from_secs(1)).unwrap();
    assert!(!response.approved);
    assert!(response.comment.contains("HTTP 500"));
}

#[test]
fn poll_webhook_follows_poll_url_until_resolved() {
    let mut server = mockito::Server::new();
    let poll_path = "/poll/abc";
    server
        .mock("POST", "/approve")
        .with_body(format!(r#"{{"poll_url": "{}{}"}}"#, server.url(), poll_path))
        .create();
    server
        .mock("GET", poll_path)
        .with_body(r#"{"status": "approved", "reason": "ok"}"#)
        .create();

    let backend = WebhookBackend::new(WebhookConfig {
        url: format!("{}/approve", server.url()),
        secret: None,
        mode: WebhookMode::Poll,
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_secs(5),
    })
    .unwrap();

    let request = ApprovalRequest::create("delete", &json!({}), "r1", "", "s1");
    let id = request.request_id.clone();
    backend.submit(request);

    let response = backend.wait_for_response(&id, Duration::from_secs(1)).unwrap();
    assert!(response.approved);
}

#[test]
fn webhook_payload_signature_matches_wire_format() {
    // The signature the backend sends must verify against the raw body
    let body = br#"{"request_id":"x","tool":"t"}"#;
    let signature = compute_signature(body, "s3cret");
    assert!(signature.starts_with("sha256="));
    assert!(verify_signature(body, "s3cret", &signature));
    assert!(!verify_signature(b"tampered", "s3cret", &signature));
}
