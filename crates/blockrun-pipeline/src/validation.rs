//! Static checks on a pipeline description before it is built.
//!
//! Rules check a [`PipelineDocument`] before any block is instantiated. Call
//! [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail on
//! any `Error`-severity issue.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use blockrun_types::{BlockrunError, Result};

use crate::block::BlockRegistry;
use crate::builder::{PipelineDocument, StepSpec};
use crate::condition::parse_conditions;
use crate::engine::InputSpec;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step_id: Option<String>,
    pub step_index: Option<usize>,
    pub fix: Option<String>,
}

impl Diagnostic {
    fn for_step(rule: &str, severity: Severity, index: usize, step: &StepSpec, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            step_id: Some(step.step_id().to_string()),
            step_index: Some(index),
            fix: None,
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, doc: &PipelineDocument, registry: &BlockRegistry) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helper predicates
// ---------------------------------------------------------------------------

/// A statically known value for `key`: the step's `config` wins over a
/// record-shaped `input`, mirroring the merge order at run time.
fn static_field<'a>(step: &'a StepSpec, key: &str) -> Option<&'a Value> {
    if let Some(value) = step.config_record().and_then(|c| c.get(key)) {
        return Some(value);
    }
    match &step.input {
        Some(InputSpec::Record(record)) => record.get(key),
        _ => None,
    }
}

fn is_templated(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.contains("${"))
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, doc: &PipelineDocument, _registry: &BlockRegistry) -> Vec<Diagnostic> {
        if doc.pipeline.is_empty() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Pipeline has no steps".into(),
                step_id: None,
                step_index: None,
                fix: Some("Add at least one entry to the \"pipeline\" array".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct KnownBlockTypeRule;
impl LintRule for KnownBlockTypeRule {
    fn name(&self) -> &str { "known_block_type" }
    fn apply(&self, doc: &PipelineDocument, registry: &BlockRegistry) -> Vec<Diagnostic> {
        doc.pipeline
            .iter()
            .enumerate()
            .filter(|(_, step)| !registry.has(&step.block))
            .map(|(index, step)| {
                Diagnostic::for_step(
                    self.name(),
                    Severity::Error,
                    index,
                    step,
                    format!("Step '{}' uses unknown block type '{}'", step.step_id(), step.block),
                )
                .with_fix(format!("Use one of: {}", registry.block_types().join(", ")))
            })
            .collect()
    }
}

struct DuplicateIdRule;
impl LintRule for DuplicateIdRule {
    fn name(&self) -> &str { "duplicate_id" }
    fn apply(&self, doc: &PipelineDocument, _registry: &BlockRegistry) -> Vec<Diagnostic> {
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        let mut diags = Vec::new();
        for (index, step) in doc.pipeline.iter().enumerate() {
            let id = step.step_id();
            match first_seen.get(id) {
                Some(&first) => diags.push(
                    Diagnostic::for_step(
                        self.name(),
                        Severity::Warning,
                        index,
                        step,
                        format!(
                            "Step id '{id}' is already used by step {first}; loop targets resolve to the first one"
                        ),
                    )
                    .with_fix("Give the step an explicit unique \"id\""),
                ),
                None => {
                    first_seen.insert(id, index);
                }
            }
        }
        diags
    }
}

struct LoopTargetRule;
impl LintRule for LoopTargetRule {
    fn name(&self) -> &str { "loop_target" }
    fn apply(&self, doc: &PipelineDocument, _registry: &BlockRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (index, step) in doc.pipeline.iter().enumerate() {
            if step.block != "loop" {
                continue;
            }
            let Some(target) = static_field(step, "target") else {
                continue;
            };
            if is_templated(target) {
                continue;
            }
            let found = match target {
                Value::String(id) => doc.pipeline[..index].iter().any(|s| s.step_id() == id),
                Value::Number(n) => n.as_u64().is_some_and(|t| (t as usize) < index),
                _ => false,
            };
            if !found {
                diags.push(
                    Diagnostic::for_step(
                        self.name(),
                        Severity::Warning,
                        index,
                        step,
                        format!(
                            "Loop step '{}' targets {target}, which is not an earlier step; the jump will be ignored",
                            step.step_id()
                        ),
                    )
                    .with_fix("Point \"target\" at the id of a step defined before the loop"),
                );
            }
        }
        diags
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, doc: &PipelineDocument, _registry: &BlockRegistry) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (index, step) in doc.pipeline.iter().enumerate() {
            let Some(raw) = static_field(step, "conditions") else {
                continue;
            };
            if is_templated(raw) {
                continue;
            }
            let problems: Vec<String> = match parse_conditions(raw) {
                Err(e) => vec![e.to_string()],
                Ok(conditions) => conditions
                    .iter()
                    .filter_map(|c| c.checked_operator().err())
                    .map(|e| e.to_string())
                    .collect(),
            };
            diags.extend(problems.into_iter().map(|problem| {
                Diagnostic::for_step(
                    self.name(),
                    Severity::Error,
                    index,
                    step,
                    format!("Step '{}' has an invalid condition: {problem}", step.step_id()),
                )
            }));
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Lint `doc` against `registry`, returning every diagnostic in rule order.
pub fn validate(doc: &PipelineDocument, registry: &BlockRegistry) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NonEmptyRule),
        Box::new(KnownBlockTypeRule),
        Box::new(DuplicateIdRule),
        Box::new(LoopTargetRule),
        Box::new(ConditionSyntaxRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(doc, registry));
    }
    diagnostics
}

/// Like [`validate`], but fails with `InvalidPipeline` when any diagnostic is
/// an error. Warnings are returned for the caller to log.
pub fn validate_or_raise(doc: &PipelineDocument, registry: &BlockRegistry) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(doc, registry);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(BlockrunError::InvalidPipeline(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
