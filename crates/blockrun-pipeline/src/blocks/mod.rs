//! Built-in blocks: HTTP, JSON and stream parsing, assertions, and flow control.

pub mod flow;
pub mod http;

pub use flow::{DelayBlock, LoopBlock, TerminateBlock};
pub use http::HttpRequestBlock;

use async_trait::async_trait;
use serde_json::{json, Value};

use blockrun_types::{BlockrunError, Context, Record, Result};

use crate::block::{Block, InputContract, OutputContract};
use crate::condition::{evaluate_condition, parse_conditions};
use crate::path::get_path;

/// Wrap a `json!({...})` literal as a [`Record`].
fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn required<'a>(block: &str, inputs: &'a Record, name: &str) -> Result<&'a Value> {
    inputs.get(name).ok_or_else(|| BlockrunError::MissingInputs {
        block: block.to_string(),
        missing: vec![name.to_string()],
    })
}

// ---------------------------------------------------------------------------
// JsonParserBlock: parse a JSON text body
// ---------------------------------------------------------------------------

/// Parses `body` as JSON. With `path`, only the value at that path is kept.
/// A malformed body is a soft error.
pub struct JsonParserBlock;

#[async_trait]
impl Block for JsonParserBlock {
    fn block_type(&self) -> &str {
        "json_parser"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["body"], ["path"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["parsed", "error"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        let body = required(self.block_type(), inputs, "body")?;
        let parsed = match body {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(error = %e, "Body is not valid JSON");
                    return Ok(record(json!({
                        "parsed": null,
                        "error": format!("Failed to parse JSON: {e}"),
                    })));
                }
            },
            other => other.clone(),
        };

        let parsed = match inputs.get("path").and_then(Value::as_str) {
            Some(path) => get_path(&parsed, path).cloned().unwrap_or(Value::Null),
            None => parsed,
        };
        Ok(record(json!({ "parsed": parsed, "error": null })))
    }
}

// ---------------------------------------------------------------------------
// StreamParserBlock: parse server-sent events
// ---------------------------------------------------------------------------

/// Parses a server-sent-events body into its JSON events and the text
/// assembled from streamed content deltas.
pub struct StreamParserBlock;

#[async_trait]
impl Block for StreamParserBlock {
    fn block_type(&self) -> &str {
        "stream_parser"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["body"], [])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["events", "content", "eventCount", "done", "error"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        let Some(body) = required(self.block_type(), inputs, "body")?.as_str() else {
            return Ok(record(json!({
                "events": [],
                "content": "",
                "eventCount": 0,
                "done": false,
                "error": "Stream body must be a string",
            })));
        };

        let parsed = parse_sse(body);
        Ok(record(json!({
            "events": parsed.events,
            "content": parsed.content,
            "eventCount": parsed.events.len(),
            "done": parsed.done,
            "error": null,
        })))
    }
}

#[derive(Debug, Default)]
struct SseStream {
    events: Vec<Value>,
    content: String,
    done: bool,
}

fn parse_sse(body: &str) -> SseStream {
    let mut stream = SseStream::default();
    for line in body.lines() {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        if payload == "[DONE]" {
            stream.done = true;
            continue;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(event) => {
                if let Some(fragment) = delta_text(&event) {
                    stream.content.push_str(fragment);
                }
                stream.events.push(event);
            }
            Err(_) => stream.events.push(Value::String(payload.to_string())),
        }
    }
    stream
}

/// Text fragment carried by a streamed event, in either the
/// `choices[0].delta.content` or the `delta.text` convention.
fn delta_text(event: &Value) -> Option<&str> {
    ["choices[0].delta.content", "delta.text", "choices[0].text"]
        .iter()
        .find_map(|path| get_path(event, path).and_then(Value::as_str))
}

// ---------------------------------------------------------------------------
// AssertBlock: evaluate conditions, fail softly when any do not hold
// ---------------------------------------------------------------------------

/// Checks `conditions` against `data`. Any failing condition produces a soft
/// error naming the failures; malformed conditions are faults.
pub struct AssertBlock;

#[async_trait]
impl Block for AssertBlock {
    fn block_type(&self) -> &str {
        "assert"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["data", "conditions"], ["message"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["passed", "failures", "error"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        let data = required(self.block_type(), inputs, "data")?;
        let conditions = parse_conditions(required(self.block_type(), inputs, "conditions")?)?;

        let mut failures = Vec::new();
        for condition in &conditions {
            if !evaluate_condition(data, condition)? {
                failures.push(json!({
                    "path": condition.path,
                    "operator": condition.operator,
                    "expected": condition.value,
                    "actual": get_path(data, &condition.path),
                }));
            }
        }

        let mut out = record(json!({
            "passed": failures.is_empty(),
            "failures": failures,
        }));
        if !failures.is_empty() {
            let message = inputs
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| {
                    format!(
                        "Assertion failed: {} of {} conditions did not hold",
                        failures.len(),
                        conditions.len()
                    )
                });
            out.insert("error".into(), Value::String(message));
        }
        Ok(out)
    }
}
