//! End-to-end integration tests for the Blockrun pipeline engine.
//!
//! Each test exercises the full path: JSON description -> validate -> build ->
//! execute -> inspect the result, summary, and context.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use blockrun_pipeline::{
    default_registry, validate, Block, BlockRegistry, EventEmitter, InputContract,
    PipelineBuilder, PipelineDocument, PipelineEvent, Severity, SuiteRunner,
};
use blockrun_types::{BlockrunError, Context, Record, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rec(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

/// Stands in for `http_request`: echoes the request it was given and answers
/// with a canned JSON body.
struct FakeHttpBlock;

#[async_trait]
impl Block for FakeHttpBlock {
    fn block_type(&self) -> &str {
        "fake_http"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["url"], ["method", "headers", "body"])
    }

    async fn process(&self, inputs: &Record, _ctx: &Context) -> Result<Record> {
        Ok(rec(json!({
            "status": 200,
            "ok": true,
            "request": {
                "url": inputs.get("url"),
                "method": inputs.get("method").cloned().unwrap_or(json!("GET")),
                "headers": inputs.get("headers"),
            },
            "body": "{\"users\": [{\"name\": \"ada\", \"role\": \"admin\"}, {\"name\": \"bob\", \"role\": \"user\"}]}"
        })))
    }
}

/// Reports `pending` until it has been called `ready_after` times. Counts
/// attempts in the shared context.
struct PollBlock {
    ready_after: u64,
}

#[async_trait]
impl Block for PollBlock {
    fn block_type(&self) -> &str {
        "poll"
    }

    async fn process(&self, _inputs: &Record, ctx: &Context) -> Result<Record> {
        let attempts = ctx.get("attempts").await.and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        ctx.set("attempts", json!(attempts)).await;
        let status = if attempts >= self.ready_after { "ready" } else { "pending" };
        Ok(rec(json!({ "status": status, "attempts": attempts })))
    }
}

struct FlakyBlock;

#[async_trait]
impl Block for FlakyBlock {
    fn block_type(&self) -> &str {
        "flaky"
    }

    async fn process(&self, _inputs: &Record, _ctx: &Context) -> Result<Record> {
        Err(BlockrunError::Http("connection reset by peer".into()))
    }
}

/// Counts how often it runs.
struct MarkerBlock {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Block for MarkerBlock {
    fn block_type(&self) -> &str {
        "marker"
    }

    async fn process(&self, _inputs: &Record, _ctx: &Context) -> Result<Record> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(rec(json!({ "reached": n })))
    }
}

fn registry(marker_calls: &Arc<AtomicUsize>) -> BlockRegistry {
    let mut reg = default_registry();
    reg.register("fake_http", |_| Ok(Box::new(FakeHttpBlock)));
    reg.register("poll", |config| {
        let ready_after = config.get("readyAfter").and_then(Value::as_u64).unwrap_or(1);
        Ok(Box::new(PollBlock { ready_after }))
    });
    reg.register("flaky", |_| Ok(Box::new(FlakyBlock)));
    let calls = marker_calls.clone();
    reg.register("marker", move |_| {
        Ok(Box::new(MarkerBlock {
            calls: calls.clone(),
        }))
    });
    reg
}

fn builder(marker_calls: &Arc<AtomicUsize>) -> PipelineBuilder {
    PipelineBuilder::new(registry(marker_calls)).with_env(|name| match name {
        "API_BASE" => Some("http://api.test".into()),
        "API_TOKEN" => Some("s3cret".into()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Data flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_parse_assert_pipeline_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{
                "name": "list users",
                "context": {"baseUrl": "${env.API_BASE}", "token": "${env.API_TOKEN}"},
                "pipeline": [
                    {"block": "fake_http", "id": "fetch",
                     "input": {
                        "url": "${baseUrl}/users/${input.page}",
                        "headers": {"Authorization": "Bearer ${token}"}
                     },
                     "output": "response"},
                    {"block": "json_parser", "id": "parse",
                     "input": {"from": "response.body", "as": "body"},
                     "output": {"parsed": "users"}},
                    {"block": "assert", "id": "check",
                     "input": {"data": "${users}"},
                     "config": {"conditions": [
                        {"path": "users", "operator": "minLength", "value": 2},
                        {"path": "users[0].role", "operator": "equals", "value": "admin"}
                     ]}}
                ]
            }"#,
        )
        .unwrap();

    let result = pipeline.execute(rec(json!({"page": 2})), Record::new()).await;

    assert!(result.success, "run failed: {:?}", result.error);
    let request = result.data.get("response").and_then(|r| r.get("request")).unwrap();
    assert_eq!(request.get("url"), Some(&json!("http://api.test/users/2")));
    assert_eq!(
        request.get("headers"),
        Some(&json!({"Authorization": "Bearer s3cret"}))
    );
    assert_eq!(result.data.get("users").and_then(|u| u.get("users")).map(|u| u.as_array().map(Vec::len)), Some(Some(2)));
    assert_eq!(result.data.get("check").and_then(|c| c.get("passed")), Some(&json!(true)));
    assert_eq!(result.context.get("_test").and_then(|t| t.get("name")), Some(&json!("list users")));

    let summary = pipeline.summary();
    assert_eq!((summary.executed, summary.succeeded, summary.failed), (3, 3, 0));
}

#[tokio::test]
async fn failed_assertion_halts_and_keeps_its_output() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "json_parser", "input": {"body": "${input.raw}"}, "output": {"parsed": "doc"}},
                {"block": "assert", "id": "check",
                 "input": {"data": "${doc}"},
                 "config": {"conditions": [{"path": "count", "operator": "gt", "value": 10}]}},
                {"block": "marker"}
            ]}"#,
        )
        .unwrap();

    let result = pipeline
        .execute(rec(json!({"raw": "{\"count\": 3}"})), Record::new())
        .await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Assertion failed: 1 of 1 conditions did not hold")
    );
    let failures = result.data.get("check").and_then(|c| c.get("failures")).unwrap();
    assert_eq!(failures[0].get("actual"), Some(&json!(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        result.data.get("_meta").and_then(|m| m.get("check")).and_then(|m| m.get("success")),
        Some(&json!(false))
    );
}

#[tokio::test]
async fn malformed_json_is_a_soft_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "json_parser", "id": "parse", "input": "${input.raw}"},
                {"block": "marker"}
            ]}"#,
        )
        .unwrap();

    let result = pipeline
        .execute(rec(json!({"raw": "{oops"})), Record::new())
        .await;

    assert!(!result.success);
    assert!(result.error.as_deref().is_some_and(|e| e.starts_with("Failed to parse JSON")));
    assert_eq!(result.data.get("parse").and_then(|p| p.get("parsed")), Some(&Value::Null));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_required_input_names_step_and_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "fake_http", "id": "fetch", "input": {"method": "GET"}},
                {"block": "marker"}
            ]}"#,
        )
        .unwrap();

    let result = pipeline.execute(Record::new(), Record::new()).await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Block 'fetch' is missing required inputs: url")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_parser_assembles_content() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "stream_parser", "id": "sse", "input": "${input.stream}"},
                {"block": "assert",
                 "input": {"data": "${sse}"},
                 "config": {"conditions": [
                    {"path": "content", "operator": "equals", "value": "Hello world"},
                    {"path": "done", "operator": "isTrue"},
                    {"path": "eventCount", "operator": "equals", "value": 2}
                 ]}}
            ]}"#,
        )
        .unwrap();

    let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
                  data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n\
                  data: [DONE]\n";
    let result = pipeline
        .execute(rec(json!({"stream": stream})), Record::new())
        .await;

    assert!(result.success, "run failed: {:?}", result.error);
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn polling_loop_runs_until_ready() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "poll", "id": "check_status", "config": {"readyAfter": 3}},
                {"block": "loop", "id": "retry",
                 "input": {"data": "${check_status}"},
                 "config": {"target": "check_status", "maxIterations": 10, "conditions": [
                    {"path": "status", "operator": "notEquals", "value": "ready"}
                 ]}},
                {"block": "marker", "id": "after"}
            ]}"#,
        )
        .unwrap();

    let result = pipeline.execute(Record::new(), Record::new()).await;

    assert!(result.success);
    assert_eq!(result.context.get("attempts"), Some(&json!(3)));
    assert_eq!(result.context.get("_loopCount:check_status"), Some(&json!(2)));
    assert_eq!(result.data.get("retry").and_then(|r| r.get("looping")), Some(&json!(false)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn loop_gives_up_after_max_iterations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let events = EventEmitter::new(256);
    let mut rx = events.subscribe();
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "poll", "id": "check_status", "config": {"readyAfter": 100}},
                {"block": "loop",
                 "input": {"data": "${check_status}"},
                 "config": {"target": "check_status", "maxIterations": 3, "conditions": [
                    {"path": "status", "operator": "equals", "value": "pending"}
                 ]}},
                {"block": "marker"}
            ]}"#,
        )
        .unwrap()
        .with_events(events);

    let result = pipeline.execute(Record::new(), Record::new()).await;

    assert!(result.success);
    assert_eq!(result.context.get("attempts"), Some(&json!(4)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut loop_backs = 0;
    let mut limits = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::LoopBack { to_block, .. } => {
                assert_eq!(to_block, "check_status");
                loop_backs += 1;
            }
            PipelineEvent::LoopLimitReached { max_loops, .. } => {
                assert_eq!(max_loops, 3);
                limits += 1;
            }
            _ => {}
        }
    }
    assert_eq!((loop_backs, limits), (3, 1));
}

#[tokio::test]
async fn loop_cap_from_environment_string_is_honoured() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = PipelineBuilder::new(registry(&calls))
        .with_env(|name| (name == "MAX_RETRIES").then(|| "3".to_string()))
        .from_json_str(
            r#"{
                "context": {"maxRetries": "${env.MAX_RETRIES}"},
                "pipeline": [
                    {"block": "poll", "id": "poll", "config": {"readyAfter": 100}},
                    {"block": "loop",
                     "input": {"maxIterations": "${maxRetries}", "delay": "${maxRetries}"},
                     "config": {"target": "poll"}},
                    {"block": "marker"}
                ]
            }"#,
        )
        .unwrap();

    let result = pipeline.execute(Record::new(), Record::new()).await;

    assert!(result.success);
    assert_eq!(result.context.get("maxRetries"), Some(&json!("3")));
    assert_eq!(result.context.get("attempts"), Some(&json!(4)));
    assert_eq!(result.context.get("_loopCount:poll"), Some(&json!(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn terminate_ends_run_successfully() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{"pipeline": [
                {"block": "terminate", "id": "guard",
                 "input": {"data": "${input}"},
                 "config": {"conditions": [{"path": "skip", "operator": "isTrue"}]}},
                {"block": "marker"}
            ]}"#,
        )
        .unwrap();

    let result = pipeline
        .execute(rec(json!({"skip": true})), Record::new())
        .await;
    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let result = pipeline
        .execute(rec(json!({"skip": false})), Record::new())
        .await;
    assert!(result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn continue_on_error_from_description_context() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{
                "context": {"continueOnError": true},
                "pipeline": [{"block": "flaky", "id": "net"}, {"block": "marker"}]
            }"#,
        )
        .unwrap();

    let result = pipeline.execute(Record::new(), Record::new()).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("HTTP error: connection reset by peer"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.summary().failed, 1);
    assert_eq!(pipeline.summary().succeeded, 1);
}

#[tokio::test]
async fn execute_context_overrides_description_context() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = builder(&calls)
        .from_json_str(
            r#"{
                "context": {"baseUrl": "http://from-file"},
                "pipeline": [{"block": "fake_http", "input": {"url": "${baseUrl}/ping"}, "output": "resp"}]
            }"#,
        )
        .unwrap();

    let result = pipeline
        .execute(Record::new(), rec(json!({"baseUrl": "http://override"})))
        .await;

    assert_eq!(
        result.data.get("resp").and_then(|r| r.get("request")).and_then(|r| r.get("url")),
        Some(&json!("http://override/ping"))
    );
}

// ---------------------------------------------------------------------------
// Validation and suites
// ---------------------------------------------------------------------------

#[test]
fn validation_reports_every_problem() {
    let doc = PipelineDocument::from_json_str(
        r#"{"pipeline": [
            {"block": "loop", "config": {"target": "later"}},
            {"block": "warp_drive", "id": "later"},
            {"block": "delay", "id": "later"}
        ]}"#,
    )
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let diags = validate(&doc, &registry(&calls));
    let mut rules: Vec<_> = diags.iter().map(|d| (d.rule.as_str(), d.severity)).collect();
    rules.sort_by_key(|(rule, _)| *rule);
    assert_eq!(
        rules,
        vec![
            ("duplicate_id", Severity::Warning),
            ("known_block_type", Severity::Error),
            ("loop_target", Severity::Warning),
        ]
    );
}

#[tokio::test]
async fn suite_file_runs_setup_tests_and_teardown() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        json!({
            "name": "status suite",
            "context": {"baseUrl": "http://api.test"},
            "setup": [{"block": "poll", "config": {"readyAfter": 1}}],
            "tests": [
                {
                    "name": "attempt counter carried from setup",
                    "pipeline": [
                        {"block": "poll", "id": "p", "config": {"readyAfter": 1}},
                        {"block": "assert", "input": {"data": "${p}"},
                         "config": {"conditions": [{"path": "attempts", "operator": "equals", "value": 2}]}}
                    ]
                },
                {
                    "name": "fails on purpose",
                    "pipeline": [{"block": "flaky"}]
                }
            ],
            "teardown": [{"block": "marker"}]
        })
    )
    .unwrap();

    let runner = SuiteRunner::new(builder(&calls));
    let report = runner.run_file(file.path()).await.unwrap();

    assert_eq!(report.name.as_deref(), Some("status suite"));
    assert!(!report.success);
    assert_eq!((report.passed, report.failed), (1, 1));
    assert!(report.tests[0].success, "{:?}", report.tests[0].error);
    assert_eq!(
        report.tests[1].error.as_deref(),
        Some("HTTP error: connection reset by peer")
    );
    assert!(report.teardown.as_ref().is_some_and(|t| t.success));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
