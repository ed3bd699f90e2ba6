//! HTTP request block backed by `reqwest`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use blockrun_types::{BlockrunError, Context, Record, Result};

use super::{record, required};
use crate::block::{Block, InputContract, OutputContract};
use crate::condition::whole_number;

/// Request timeout when neither the step nor the block config sets one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// HttpRequestBlock
// ---------------------------------------------------------------------------

/// Sends one HTTP request. Transport failures (refused connection, timeout)
/// are faults; any HTTP status is a normal output, with `ok` reporting 2xx.
#[derive(Debug)]
pub struct HttpRequestBlock {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpRequestBlock {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Build from a step's `config`; honours a `timeout` in ms given as a
    /// number or a numeric string.
    pub fn from_config(config: &Record) -> Result<Self> {
        let mut block = Self::new();
        if let Some(timeout) = config.get("timeout") {
            let ms = whole_number(timeout).ok_or_else(|| {
                BlockrunError::InvalidPipeline(format!(
                    "http_request timeout must be a number of milliseconds, got {timeout}"
                ))
            })?;
            block.default_timeout = Duration::from_millis(ms);
        }
        Ok(block)
    }

    fn fail(&self, message: impl Into<String>) -> BlockrunError {
        BlockrunError::BlockFailed {
            block: self.block_type().to_string(),
            message: message.into(),
        }
    }
}

impl Default for HttpRequestBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for HttpRequestBlock {
    fn block_type(&self) -> &str {
        "http_request"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["url"], ["method", "headers", "body", "query", "timeout"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["status", "ok", "headers", "body", "duration"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        let url = required(self.block_type(), inputs, "url")?
            .as_str()
            .ok_or_else(|| self.fail("url must be a string"))?;
        let method = parse_method(inputs.get("method")).map_err(|m| self.fail(m))?;
        let timeout = inputs
            .get("timeout")
            .and_then(whole_number)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut request = self.client.request(method.clone(), url).timeout(timeout);
        for (name, value) in string_pairs(inputs.get("headers")) {
            request = request.header(name, value);
        }
        let query = string_pairs(inputs.get("query"));
        if !query.is_empty() {
            request = request.query(&query);
        }
        match inputs.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(other),
        }

        tracing::info!(method = %method, url = %url, timeout_ms = timeout.as_millis() as u64, "Sending HTTP request");
        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| BlockrunError::Http(e.to_string()))?;

        let status = response.status();
        let headers: Record = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let is_json = headers
            .get("content-type")
            .and_then(Value::as_str)
            .is_some_and(|ct| ct.contains("json"));
        let text = response
            .text()
            .await
            .map_err(|e| BlockrunError::Http(e.to_string()))?;
        let duration = started.elapsed().as_millis() as u64;

        tracing::info!(status = status.as_u16(), duration_ms = duration, body_len = text.len(), "HTTP response received");

        Ok(record(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "headers": headers,
            "body": decode_body(text, is_json),
            "duration": duration,
        })))
    }
}

fn parse_method(raw: Option<&Value>) -> std::result::Result<reqwest::Method, String> {
    match raw {
        None | Some(Value::Null) => Ok(reqwest::Method::GET),
        Some(Value::String(name)) => reqwest::Method::from_bytes(name.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method '{name}'")),
        Some(other) => Err(format!("HTTP method must be a string, got {other}")),
    }
}

/// Flatten a JSON object into string pairs; non-string values are rendered
/// as JSON text.
fn string_pairs(raw: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = raw else {
        return Vec::new();
    };
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

fn decode_body(text: String, is_json: bool) -> Value {
    if is_json {
        if let Ok(value) = serde_json::from_str(&text) {
            return value;
        }
    }
    Value::String(text)
}
