//! Shared types, errors, and the execution context for the Blockrun pipeline engine.
//!
//! This crate provides the foundational types used across the other Blockrun crates:
//! - `BlockrunError`: unified error taxonomy
//! - `Record`: the flat JSON object every block consumes and produces
//! - `Context`: shared key-value store consulted before the data bus
//! - `TestMeta`: suite-level metadata carried alongside the context values

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON object: the shape of block inputs, block outputs, and context seeds.
pub type Record = serde_json::Map<String, Value>;

/// Unified error type for all Blockrun subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BlockrunError {
    // === Engine Errors ===
    #[error("Block '{block}' is missing required inputs: {}", missing.join(", "))]
    MissingInputs { block: String, missing: Vec<String> },

    #[error("Block '{block}' failed: {message}")]
    BlockFailed { block: String, message: String },

    // === Condition Errors ===
    #[error("Unknown condition operator: {0}")]
    UnknownOperator(String),

    #[error("Condition operator '{operator}' requires a value")]
    MissingOperand { operator: String },

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    // === Builder Errors ===
    #[error("Unknown block type: {0}")]
    UnknownBlockType(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    // === Block I/O Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BlockrunError {
    /// Returns `true` for errors raised before a block ran (bad wiring or
    /// description), as opposed to failures inside the block's own work.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BlockrunError::MissingInputs { .. }
                | BlockrunError::UnknownBlockType(_)
                | BlockrunError::InvalidPipeline(_)
        )
    }
}

/// A convenience alias for `Result<T, BlockrunError>`.
pub type Result<T> = std::result::Result<T, BlockrunError>;

/// JavaScript-style truthiness for JSON values, used for the reserved
/// `error`, `_terminate`, and `continueOnError` flags.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// TestMeta: suite-level metadata for the running pipeline
// ---------------------------------------------------------------------------

/// Descriptive metadata about the test a pipeline implements. Rendered as the
/// `_test` key of [`Context::to_record`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Context: shared key-value store for a pipeline run
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

/// Key prefix used when loop counters are flattened into a record.
pub const LOOP_COUNT_PREFIX: &str = "_loopCount:";

/// Key under which [`TestMeta`] is flattened into a record.
pub const TEST_META_KEY: &str = "_test";

/// Key-value store shared between the engine and every block of a pipeline.
///
/// Clones are handles onto one shared state: a write made by a block is seen
/// by the engine and by every later block.
///
/// Loop counters and test metadata are kept in typed fields rather than as
/// reserved string keys; [`to_record`](Context::to_record) renders them back
/// under `_loopCount:<target>` and `_test` for reporting.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Default)]
struct ContextInner {
    values: HashMap<String, Value>,
    loop_counts: HashMap<String, u32>,
    test: Option<TestMeta>,
}

impl Context {
    pub fn new() -> Self {
        Self::from_inner(ContextInner::default())
    }

    /// Create a context seeded with the keys of `record`.
    pub fn from_record(record: Record) -> Self {
        Self::seeded(record, None)
    }

    /// Create a context seeded with `record` and, optionally, the metadata of
    /// the test the pipeline implements.
    pub fn seeded(record: Record, test: Option<TestMeta>) -> Self {
        Self::from_inner(ContextInner {
            values: record.into_iter().collect(),
            test,
            ..ContextInner::default()
        })
    }

    fn from_inner(inner: ContextInner) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(inner)),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// `true` when `key` holds a truthy value.
    pub async fn is_truthy(&self, key: &str) -> bool {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .map(is_truthy)
            .unwrap_or(false)
    }

    /// Remove a key, returning its previous value.
    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().await.values.remove(key)
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        self.inner.read().await.values.contains_key(key)
    }

    /// Shallow-merge `record` into the context. Existing keys not present in
    /// `record` are preserved; nested values are replaced, not merged.
    pub async fn merge(&self, record: Record) {
        let mut guard = self.inner.write().await;
        guard.values.extend(record);
    }

    /// Shallow-merge another context: its values, loop counters, and test
    /// metadata (when set) overwrite ours.
    pub async fn merge_context(&self, other: &Context) {
        let theirs = other.inner.read().await.clone();
        let mut guard = self.inner.write().await;
        guard.values.extend(theirs.values);
        guard.loop_counts.extend(theirs.loop_counts);
        if theirs.test.is_some() {
            guard.test = theirs.test;
        }
    }

    /// Shallow copy of the current values map (typed side-channel excluded).
    pub async fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().await.values.clone()
    }

    /// Flatten the whole context, including loop counters and test metadata,
    /// into a single record.
    pub async fn to_record(&self) -> Record {
        let guard = self.inner.read().await;
        let mut record: Record = guard
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (target, count) in &guard.loop_counts {
            record.insert(format!("{LOOP_COUNT_PREFIX}{target}"), Value::from(*count));
        }
        if let Some(ref test) = guard.test {
            if let Ok(value) = serde_json::to_value(test) {
                record.insert(TEST_META_KEY.to_string(), value);
            }
        }
        record
    }

    /// Drop every value, loop counter, and the test metadata.
    pub async fn clear(&self) {
        let mut guard = self.inner.write().await;
        *guard = ContextInner::default();
    }

    /// Number of backward jumps already taken toward `target` this run.
    pub async fn loop_count(&self, target: &str) -> u32 {
        self.inner
            .read()
            .await
            .loop_counts
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    /// Increment the loop counter for `target`, returning the new count.
    pub async fn increment_loop(&self, target: &str) -> u32 {
        let mut guard = self.inner.write().await;
        let count = guard.loop_counts.entry(target.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn test_meta(&self) -> Option<TestMeta> {
        self.inner.read().await.test.clone()
    }

    pub async fn set_test_meta(&self, meta: TestMeta) {
        self.inner.write().await.test = Some(meta);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}
