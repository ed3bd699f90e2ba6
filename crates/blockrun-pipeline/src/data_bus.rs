//! The data bus: keyed storage for block outputs.
//!
//! Slots are plain JSON values keyed by name, last write wins. Per-block
//! execution metadata and the most recent error message are held in typed
//! fields and only rendered as the reserved `_meta` and `_error` keys when
//! the bus is flattened or read by path.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use blockrun_types::Record;

use crate::path::{get_segments, parse_path, Segment};

/// Slot holding the caller-supplied input of a run.
pub const INPUT_SLOT: &str = "input";
/// Reserved key for per-block metadata in flattened views.
pub const META_KEY: &str = "_meta";
/// Reserved key for the latest error message in flattened views.
pub const ERROR_KEY: &str = "_error";

/// Execution metadata recorded for a block after each invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepMeta {
    pub fn success(duration: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            success: true,
            duration,
            error: None,
        }
    }

    pub fn failure(duration: u64, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            success: false,
            duration,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataBus {
    slots: Record,
    meta: BTreeMap<String, StepMeta>,
    last_error: Option<String>,
}

impl DataBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.slots.insert(key.into(), value);
    }

    /// Read a slot by its exact name. The reserved `_meta` and `_error` names
    /// read the typed side-channel.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            META_KEY if !self.meta.is_empty() => Some(self.meta_value()),
            ERROR_KEY => self.last_error.clone().map(Value::String),
            _ => self.slots.get(key).cloned(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.slots.remove(key)
    }

    /// Resolve a dotted path. A slot whose exact name matches `path` wins;
    /// otherwise the first segment names the slot and the rest walks into it.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.get(path) {
            return Some(value);
        }
        let segments = parse_path(path);
        let (first, rest) = segments.split_first()?;
        let Segment::Key(name) = first else {
            return None;
        };
        let root = self.get(name)?;
        get_segments(&root, rest).cloned()
    }

    pub fn set_meta(&mut self, block_id: impl Into<String>, meta: StepMeta) {
        self.meta.insert(block_id.into(), meta);
    }

    pub fn meta(&self, block_id: &str) -> Option<&StepMeta> {
        self.meta.get(block_id)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.meta.is_empty() && self.last_error.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Flatten the bus into one record, side-channel included.
    pub fn to_record(&self) -> Record {
        let mut record = self.slots.clone();
        if !self.meta.is_empty() {
            record.insert(META_KEY.to_string(), self.meta_value());
        }
        if let Some(ref err) = self.last_error {
            record.insert(ERROR_KEY.to_string(), Value::String(err.clone()));
        }
        record
    }

    fn meta_value(&self) -> Value {
        serde_json::to_value(&self.meta).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_write_wins() {
        let mut bus = DataBus::new();
        bus.set("a", json!(1));
        bus.set("a", json!(2));
        assert_eq!(bus.get("a"), Some(json!(2)));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn unwritten_slot_is_absent_not_null() {
        let bus = DataBus::new();
        assert_eq!(bus.get("never"), None);
        assert!(!bus.contains("never"));
    }

    #[test]
    fn lookup_walks_nested_paths() {
        let mut bus = DataBus::new();
        bus.set("response", json!({"body": {"items": [{"id": 7}]}}));
        assert_eq!(bus.lookup("response.body.items[0].id"), Some(json!(7)));
        assert_eq!(bus.lookup("response.missing"), None);
    }

    #[test]
    fn lookup_prefers_exact_slot_name() {
        let mut bus = DataBus::new();
        bus.set("a.b", json!("literal"));
        bus.set("a", json!({"b": "nested"}));
        assert_eq!(bus.lookup("a.b"), Some(json!("literal")));
    }

    #[test]
    fn meta_and_error_are_visible_by_path() {
        let mut bus = DataBus::new();
        bus.set_meta("fetch", StepMeta::failure(12, "timeout"));
        bus.set_error("timeout");

        assert_eq!(bus.lookup("_meta.fetch.success"), Some(json!(false)));
        assert_eq!(bus.lookup("_meta.fetch.duration"), Some(json!(12)));
        assert_eq!(bus.get("_error"), Some(json!("timeout")));
    }

    #[test]
    fn to_record_includes_side_channel() {
        let mut bus = DataBus::new();
        bus.set("input", json!({"q": 1}));
        bus.set_meta("parse", StepMeta::success(3));
        bus.set_error("boom");

        let record = bus.to_record();
        assert_eq!(record.get("input"), Some(&json!({"q": 1})));
        assert_eq!(record.get("_error"), Some(&json!("boom")));
        let meta = record.get("_meta").and_then(|m| m.get("parse")).unwrap();
        assert_eq!(meta.get("success"), Some(&json!(true)));
        assert!(meta.get("error").is_none());
        assert!(meta.get("timestamp").is_some());
    }

    #[test]
    fn empty_bus_flattens_to_empty_record() {
        let bus = DataBus::new();
        assert!(bus.is_empty());
        assert!(bus.to_record().is_empty());
    }
}
