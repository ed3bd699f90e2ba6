//! Suite runner: setup, a list of test pipelines, teardown.
//!
//! Setup runs once with the suite context. Every test then runs as its own
//! pipeline seeded with the context setup finished with, plus the test's own
//! context. Teardown always runs last.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use blockrun_types::{Record, Result, LOOP_COUNT_PREFIX, TEST_META_KEY};

use crate::builder::{PipelineBuilder, PipelineDocument, StepSpec};
use crate::engine::{ExecutionResult, ExecutionSummary};
use crate::events::EventEmitter;

// ---------------------------------------------------------------------------
// Suite description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub context: Record,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<StepSpec>,
    #[serde(default)]
    pub tests: Vec<SuiteTest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<StepSpec>,
}

impl SuiteDocument {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteTest {
    pub name: String,
    #[serde(default)]
    pub input: Record,
    #[serde(default)]
    pub context: Record,
    pub pipeline: Vec<StepSpec>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one phase (setup, a test, or teardown).
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Absent when the pipeline could not be built or never ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
}

impl TestReport {
    fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            error: Some(error.into()),
            summary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `true` when setup, every test, and teardown succeeded.
    pub success: bool,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<TestReport>,
    pub tests: Vec<TestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown: Option<TestReport>,
}

// ---------------------------------------------------------------------------
// SuiteRunner
// ---------------------------------------------------------------------------

pub struct SuiteRunner {
    builder: PipelineBuilder,
    events: Option<EventEmitter>,
}

impl SuiteRunner {
    pub fn new(builder: PipelineBuilder) -> Self {
        Self {
            builder,
            events: None,
        }
    }

    /// Forward every pipeline's events to `events`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<SuiteReport> {
        Ok(self.run(&SuiteDocument::from_file(path)?).await)
    }

    pub async fn run(&self, suite: &SuiteDocument) -> SuiteReport {
        let started = Instant::now();
        let suite_name = suite.name.as_deref().unwrap_or("<unnamed>");
        tracing::info!(suite = %suite_name, tests = suite.tests.len(), "Suite started");

        let mut shared = suite.context.clone();
        let mut setup_report = None;
        let mut setup_error = None;

        if !suite.setup.is_empty() {
            let (report, context) = self
                .run_phase("setup", &suite.setup, Record::new(), shared.clone())
                .await;
            if let Some(context) = context {
                shared = context;
            }
            if !report.success {
                let reason = report.error.clone().unwrap_or_else(|| "unknown error".into());
                tracing::error!(suite = %suite_name, error = %reason, "Setup failed, skipping tests");
                setup_error = Some(reason);
            }
            setup_report = Some(report);
        }

        let mut tests = Vec::with_capacity(suite.tests.len());
        for test in &suite.tests {
            let report = match &setup_error {
                Some(reason) => TestReport::failed(&test.name, format!("Setup failed: {reason}")),
                None => {
                    let mut context = shared.clone();
                    context.extend(test.context.clone());
                    self.run_phase(&test.name, &test.pipeline, test.input.clone(), context)
                        .await
                        .0
                }
            };
            if report.success {
                tracing::info!(test = %report.name, "Test passed");
            } else {
                tracing::warn!(test = %report.name, error = ?report.error, "Test failed");
            }
            tests.push(report);
        }

        let teardown_report = if suite.teardown.is_empty() {
            None
        } else {
            Some(
                self.run_phase("teardown", &suite.teardown, Record::new(), shared)
                    .await
                    .0,
            )
        };

        let passed = tests.iter().filter(|t| t.success).count();
        let failed = tests.len() - passed;
        let success = failed == 0
            && setup_report.as_ref().map_or(true, |r| r.success)
            && teardown_report.as_ref().map_or(true, |r| r.success);
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(suite = %suite_name, passed, failed, duration_ms, "Suite finished");
        SuiteReport {
            name: suite.name.clone(),
            success,
            passed,
            failed,
            duration_ms,
            setup: setup_report,
            tests,
            teardown: teardown_report,
        }
    }

    /// Build and execute one step list. Returns the report and, when the
    /// pipeline ran, its final context with engine bookkeeping removed.
    async fn run_phase(
        &self,
        name: &str,
        steps: &[StepSpec],
        input: Record,
        context: Record,
    ) -> (TestReport, Option<Record>) {
        let doc = PipelineDocument {
            name: Some(name.to_string()),
            context,
            pipeline: steps.to_vec(),
            ..PipelineDocument::default()
        };
        let mut pipeline = match self.builder.build(&doc) {
            Ok(pipeline) => pipeline,
            Err(e) => return (TestReport::failed(name, e.to_string()), None),
        };
        if let Some(ref events) = self.events {
            pipeline = pipeline.with_events(events.clone());
        }

        let ExecutionResult {
            context,
            success,
            error,
            ..
        } = pipeline.execute(input, Record::new()).await;
        let report = TestReport {
            name: name.to_string(),
            success,
            error,
            summary: Some(pipeline.summary().clone()),
        };
        (report, Some(strip_bookkeeping(context)))
    }
}

fn strip_bookkeeping(mut context: Record) -> Record {
    context.retain(|key, _| key != TEST_META_KEY && !key.starts_with(LOOP_COUNT_PREFIX));
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use blockrun_types::{BlockrunError, Context};
    use serde_json::{json, Value};

    use crate::block::{default_registry, Block};

    /// Stores `token` in the context, like a login step would.
    struct LoginBlock;

    #[async_trait]
    impl Block for LoginBlock {
        fn block_type(&self) -> &str {
            "login"
        }

        async fn process(&self, _inputs: &Record, ctx: &Context) -> blockrun_types::Result<Record> {
            ctx.set("token", json!("tok-123")).await;
            Ok(Record::new())
        }
    }

    /// Reports what the context holds under `token` and `extra`.
    struct ContextReaderBlock;

    #[async_trait]
    impl Block for ContextReaderBlock {
        fn block_type(&self) -> &str {
            "ctx_reader"
        }

        async fn process(&self, _inputs: &Record, ctx: &Context) -> blockrun_types::Result<Record> {
            let token = ctx.get("token").await.unwrap_or(Value::Null);
            let extra = ctx.get("extra").await.unwrap_or(Value::Null);
            if token.is_null() {
                let mut out = Record::new();
                out.insert("error".into(), json!("no token"));
                return Ok(out);
            }
            let mut out = Record::new();
            out.insert("token".into(), token);
            out.insert("extra".into(), extra);
            Ok(out)
        }
    }

    struct BrokenBlock;

    #[async_trait]
    impl Block for BrokenBlock {
        fn block_type(&self) -> &str {
            "broken"
        }

        async fn process(&self, _inputs: &Record, _ctx: &Context) -> blockrun_types::Result<Record> {
            Err(BlockrunError::Other("auth server down".into()))
        }
    }

    fn runner(teardown_calls: &Arc<AtomicUsize>) -> SuiteRunner {
        let mut registry = default_registry();
        registry.register("login", |_| Ok(Box::new(LoginBlock)));
        registry.register("ctx_reader", |_| Ok(Box::new(ContextReaderBlock)));
        registry.register("broken", |_| Ok(Box::new(BrokenBlock)));
        let calls = teardown_calls.clone();
        registry.register("cleanup", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(LoginBlock))
        });
        SuiteRunner::new(PipelineBuilder::new(registry))
    }

    fn suite(json: Value) -> SuiteDocument {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn setup_context_flows_into_tests() {
        let teardown = Arc::new(AtomicUsize::new(0));
        let report = runner(&teardown)
            .run(&suite(json!({
                "name": "auth",
                "context": {"baseUrl": "http://x"},
                "setup": [{"block": "login"}],
                "tests": [
                    {"name": "uses token", "context": {"extra": 1}, "pipeline": [{"block": "ctx_reader"}]},
                    {"name": "second", "pipeline": [{"block": "ctx_reader"}]}
                ],
                "teardown": [{"block": "cleanup"}]
            })))
            .await;

        assert!(report.success, "{report:?}");
        assert_eq!((report.passed, report.failed), (2, 0));
        assert_eq!(teardown.load(Ordering::SeqCst), 1);
        assert!(report.setup.as_ref().is_some_and(|s| s.success));
        let first = report.tests[0].summary.as_ref().unwrap();
        assert_eq!(first.executed, 1);
    }

    #[tokio::test]
    async fn tests_do_not_leak_context_into_each_other() {
        let teardown = Arc::new(AtomicUsize::new(0));
        let report = runner(&teardown)
            .run(&suite(json!({
                "tests": [
                    {"name": "logs in", "pipeline": [{"block": "login"}]},
                    {"name": "expects no token", "pipeline": [{"block": "ctx_reader"}]}
                ]
            })))
            .await;

        assert!(report.tests[0].success);
        assert!(!report.tests[1].success);
        assert_eq!(report.tests[1].error.as_deref(), Some("no token"));
        assert!(!report.success);
    }

    #[tokio::test]
    async fn setup_failure_fails_every_test_but_runs_teardown() {
        let teardown = Arc::new(AtomicUsize::new(0));
        let report = runner(&teardown)
            .run(&suite(json!({
                "setup": [{"block": "broken"}],
                "tests": [
                    {"name": "a", "pipeline": [{"block": "ctx_reader"}]},
                    {"name": "b", "pipeline": [{"block": "ctx_reader"}]}
                ],
                "teardown": [{"block": "cleanup"}]
            })))
            .await;

        assert!(!report.success);
        assert_eq!(report.failed, 2);
        for test in &report.tests {
            assert!(test.summary.is_none());
            assert_eq!(test.error.as_deref(), Some("Setup failed: auth server down"));
        }
        assert_eq!(teardown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unbuildable_test_is_reported_not_fatal() {
        let teardown = Arc::new(AtomicUsize::new(0));
        let report = runner(&teardown)
            .run(&suite(json!({
                "tests": [
                    {"name": "bad", "pipeline": [{"block": "nonexistent"}]},
                    {"name": "good", "pipeline": [{"block": "login"}]}
                ]
            })))
            .await;

        assert_eq!((report.passed, report.failed), (1, 1));
        assert!(report.tests[0].error.as_deref().is_some_and(|e| e.contains("nonexistent")));
    }

    #[test]
    fn strip_bookkeeping_drops_engine_keys() {
        let mut ctx = Record::new();
        ctx.insert("token".into(), json!("t"));
        ctx.insert("_loopCount:poll".into(), json!(2));
        ctx.insert("_test".into(), json!({"name": "x"}));
        let stripped = strip_bookkeeping(ctx);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("token"));
    }

    #[tokio::test]
    async fn run_file_reads_suite() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name": "file suite", "tests": [{{"name": "t", "pipeline": [{{"block": "login"}}]}}]}}"#
        )
        .unwrap();
        let teardown = Arc::new(AtomicUsize::new(0));
        let report = runner(&teardown).run_file(file.path()).await.unwrap();
        assert_eq!(report.name.as_deref(), Some("file suite"));
        assert!(report.success);
    }
}
