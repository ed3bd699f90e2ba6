//! `${...}` placeholder resolution against the context and the data bus.
//!
//! Lookup precedence for a placeholder path:
//! 1. `env.NAME` reads `NAME` from the context only;
//! 2. any other path reads the context key of the same name;
//! 3. when the context has nothing, the path is resolved on the data bus
//!    (nested paths allowed).
//!
//! A context key always shadows a slot of the same name.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::data_bus::DataBus;

static WHOLE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{([^}]+)\}$").expect("valid placeholder regex"));

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid placeholder regex"));

const ENV_PREFIX: &str = "env.";

/// The two lookup scopes a template is resolved against.
pub struct TemplateScope<'a> {
    pub context: &'a HashMap<String, Value>,
    pub bus: &'a DataBus,
}

impl<'a> TemplateScope<'a> {
    pub fn new(context: &'a HashMap<String, Value>, bus: &'a DataBus) -> Self {
        Self { context, bus }
    }

    /// Resolve a single placeholder path with context-over-bus precedence.
    /// For `env.NAME` only the context key `NAME` is consulted; a context key
    /// spelled `env.NAME` is never read.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let key = path.strip_prefix(ENV_PREFIX).unwrap_or(path);
        if let Some(value) = self.context.get(key) {
            return Some(value.clone());
        }
        self.bus.lookup(path)
    }
}

/// Resolve one raw input value.
///
/// - non-strings pass through unchanged;
/// - `"${path}"` yields the looked-up value itself (any JSON type), or `None`
///   when nothing matches;
/// - strings with embedded placeholders have each occurrence substituted,
///   unresolved ones kept as their literal `${...}` text;
/// - strings without placeholders are treated as a slot name and yield that
///   slot's value when it exists, else the string itself.
pub fn resolve_value(scope: &TemplateScope<'_>, raw: &Value) -> Option<Value> {
    let Value::String(text) = raw else {
        return Some(raw.clone());
    };

    if let Some(caps) = WHOLE_PLACEHOLDER.captures(text) {
        let resolved = scope.lookup(&caps[1]);
        if resolved.is_none() {
            tracing::debug!(placeholder = %text, "Unresolved placeholder");
        }
        return resolved;
    }

    if PLACEHOLDER.is_match(text) {
        let expanded = PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| {
            match scope.lookup(&caps[1]) {
                Some(value) => stringify(&value),
                None => caps[0].to_string(),
            }
        });
        return Some(Value::String(expanded.into_owned()));
    }

    Some(scope.bus.get(text).unwrap_or_else(|| raw.clone()))
}

/// Apply [`resolve_value`] to every string leaf of `value`.
///
/// Record keys whose value resolves to nothing are dropped; array elements
/// that resolve to nothing become `null` so positions are preserved.
pub fn deep_resolve(scope: &TemplateScope<'_>, value: &Value) -> Option<Value> {
    match value {
        Value::String(_) => resolve_value(scope, value),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| deep_resolve(scope, item).unwrap_or(Value::Null))
                .collect(),
        )),
        Value::Object(map) => Some(Value::Object(
            map.iter()
                .filter_map(|(k, v)| deep_resolve(scope, v).map(|v| (k.clone(), v)))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// Replace every string that is exactly `${env.NAME}` (at any depth) with the
/// value `lookup` returns for `NAME`. Partial matches are left untouched, as
/// are placeholders `lookup` cannot satisfy.
pub fn expand_env(value: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    match value {
        Value::String(text) => {
            let name = WHOLE_PLACEHOLDER
                .captures(&text)
                .and_then(|caps| caps[1].strip_prefix(ENV_PREFIX).map(String::from));
            match name {
                Some(name) => match lookup(&name) {
                    Some(resolved) => Value::String(resolved),
                    None => {
                        tracing::warn!(variable = %name, "Environment variable not set, keeping placeholder");
                        Value::String(text)
                    }
                },
                None => Value::String(text),
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(|v| expand_env(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_env(v, lookup)))
                .collect(),
        ),
        other => other,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
