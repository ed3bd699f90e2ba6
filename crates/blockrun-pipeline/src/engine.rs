//! Pipeline execution engine: the core step loop.
//!
//! A run walks the ordered step list with a single cursor. Each step gathers
//! its inputs from the data bus and context, invokes its block, stores the
//! output, and then either advances, jumps backward (loop), or halts.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use blockrun_types::{is_truthy, BlockrunError, Context, Record};

use crate::block::Block;
use crate::condition::whole_number;
use crate::data_bus::{DataBus, StepMeta, INPUT_SLOT};
use crate::events::{EventEmitter, PipelineEvent};
use crate::template::{deep_resolve, resolve_value, TemplateScope};

/// Context flag that keeps the run going after a block fault.
pub const CONTINUE_ON_ERROR: &str = "continueOnError";
/// Output field carrying a soft error.
pub const ERROR_FIELD: &str = "error";
/// Output field that ends the run successfully.
pub const TERMINATE_FIELD: &str = "_terminate";
/// Output field naming a backward jump target (step id or index).
pub const LOOP_TO_FIELD: &str = "_loopTo";
/// Output field capping jumps toward the `_loopTo` target.
pub const MAX_LOOPS_FIELD: &str = "_maxLoops";
/// Jump cap used when a block does not send `_maxLoops`.
pub const DEFAULT_MAX_LOOPS: u64 = 10;

// ---------------------------------------------------------------------------
// Step wiring
// ---------------------------------------------------------------------------

/// Where a step's inputs come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// A template string; the resolved value is passed as `{ "body": value }`.
    Template(String),
    /// A literal data-bus path, optionally wrapped under the `as` key.
    From {
        from: String,
        #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// A record whose string leaves are resolved as templates.
    Record(Record),
}

/// Where a step's output goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    /// `{ outputField: slotName }` pairs; absent fields are skipped.
    Mapping(BTreeMap<String, String>),
    /// Store the whole output record under one slot.
    Slot(String),
}

/// A configured block inside a pipeline.
pub struct Step {
    pub id: String,
    block: Box<dyn Block>,
    pub input: Option<InputSpec>,
    pub output: Option<OutputSpec>,
    pub config: Option<Record>,
}

impl Step {
    /// Wrap a block; the step id defaults to the block type.
    pub fn new(block: impl Block + 'static) -> Self {
        Self::from_boxed(Box::new(block))
    }

    pub fn from_boxed(block: Box<dyn Block>) -> Self {
        Self {
            id: block.block_type().to_string(),
            block,
            input: None,
            output: None,
            config: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_config(mut self, config: Record) -> Self {
        self.config = Some(config);
        self
    }

    pub fn block(&self) -> &dyn Block {
        self.block.as_ref()
    }

    pub fn block_type(&self) -> &str {
        self.block.block_type()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one block invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResult {
    pub id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate report for one `execute()` call. Recreated on every call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: Uuid,
    pub total_blocks: usize,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub had_error: bool,
    pub results: Vec<BlockResult>,
}

impl ExecutionSummary {
    fn new(total_blocks: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total_blocks,
            ..Self::default()
        }
    }

    fn record_success(&mut self, id: &str, duration_ms: u64) {
        self.executed += 1;
        self.succeeded += 1;
        self.results.push(BlockResult {
            id: id.to_string(),
            success: true,
            duration_ms,
            error: None,
        });
    }

    fn record_failure(&mut self, id: &str, duration_ms: u64, error: &str) {
        self.executed += 1;
        self.failed += 1;
        self.had_error = true;
        self.results.push(BlockResult {
            id: id.to_string(),
            success: false,
            duration_ms,
            error: Some(error.to_string()),
        });
    }
}

/// What `execute()` hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// The whole data bus, `_meta` and `_error` included.
    pub data: Record,
    /// The whole context, loop counters and `_test` included.
    pub context: Record,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// Classified result of invoking one block.
#[derive(Debug)]
pub enum StepOutcome {
    Success(Record),
    /// The block returned normally but flagged a truthy `error` field.
    SoftError { output: Record, message: String },
    /// Missing required inputs, or the block itself returned an error.
    Fault(BlockrunError),
}

/// Cursor movement decided after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    JumpTo(usize),
    Halt,
}

async fn invoke(step: &Step, inputs: Record, context: &Context) -> StepOutcome {
    let missing = step.block.inputs().missing(&inputs);
    if !missing.is_empty() {
        return StepOutcome::Fault(BlockrunError::MissingInputs {
            block: step.id.clone(),
            missing,
        });
    }

    match step.block.process(&inputs, context).await {
        Err(e) => StepOutcome::Fault(e),
        Ok(output) => {
            let message = output
                .get(ERROR_FIELD)
                .filter(|e| is_truthy(e))
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            match message {
                Some(message) => StepOutcome::SoftError { output, message },
                None => StepOutcome::Success(output),
            }
        }
    }
}

fn store_output(bus: &mut DataBus, step: &Step, output: &Record) {
    if output.is_empty() {
        return;
    }
    match &step.output {
        Some(OutputSpec::Mapping(mapping)) => {
            for (field, slot) in mapping {
                if let Some(value) = output.get(field) {
                    bus.set(slot.clone(), value.clone());
                }
            }
        }
        Some(OutputSpec::Slot(slot)) if !slot.is_empty() => {
            bus.set(slot.clone(), Value::Object(output.clone()));
        }
        _ => bus.set(step.id.clone(), Value::Object(output.clone())),
    }
}

fn record_failure(
    bus: &mut DataBus,
    summary: &mut ExecutionSummary,
    id: &str,
    duration_ms: u64,
    message: &str,
) {
    bus.set_error(message);
    bus.set_meta(id, StepMeta::failure(duration_ms, message));
    summary.record_failure(id, duration_ms, message);
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered list of steps plus the data bus and context they share.
///
/// The data bus and context are not reset between `execute()` calls: a second
/// run on the same instance sees the slots, context keys, and loop counters
/// the first one left behind. Only the [`ExecutionSummary`] is fresh per run.
pub struct Pipeline {
    steps: Vec<Step>,
    bus: DataBus,
    context: Context,
    summary: ExecutionSummary,
    events: Option<EventEmitter>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_context(Context::new())
    }

    pub fn with_context(context: Context) -> Self {
        Self {
            steps: Vec::new(),
            bus: DataBus::new(),
            context,
            summary: ExecutionSummary::default(),
            events: None,
        }
    }

    /// Builder-style [`push`](Pipeline::push).
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn data_bus(&self) -> &DataBus {
        &self.bus
    }

    pub fn data_bus_mut(&mut self) -> &mut DataBus {
        &mut self.bus
    }

    /// Summary of the most recent `execute()` call.
    pub fn summary(&self) -> &ExecutionSummary {
        &self.summary
    }

    /// Resolve a raw value against the current context and data bus.
    pub async fn resolve_value(&self, raw: &Value) -> Option<Value> {
        let context = self.context.snapshot().await;
        resolve_value(&TemplateScope::new(&context, &self.bus), raw)
    }

    /// Resolve every string leaf of `raw` against the current context and
    /// data bus.
    pub async fn deep_resolve(&self, raw: &Value) -> Option<Value> {
        let context = self.context.snapshot().await;
        deep_resolve(&TemplateScope::new(&context, &self.bus), raw)
    }

    /// Run every step in order. `input` is stored in the `input` slot and
    /// `initial_context` is merged into the context before the first step.
    pub async fn execute(&mut self, input: Record, initial_context: Record) -> ExecutionResult {
        self.summary = ExecutionSummary::new(self.steps.len());
        let run_id = self.summary.run_id.to_string();
        let started = Instant::now();

        self.bus.set(INPUT_SLOT, Value::Object(input));
        self.context.merge(initial_context).await;

        tracing::info!(run_id = %run_id, blocks = self.steps.len(), "Pipeline started");
        self.emit(PipelineEvent::PipelineStarted {
            run_id: run_id.clone(),
            block_count: self.steps.len(),
        });

        let mut index = 0;
        while index < self.steps.len() {
            match self.execute_step(index).await {
                Flow::Next => index += 1,
                Flow::JumpTo(target) => index = target,
                Flow::Halt => break,
            }
        }

        self.summary.duration_ms = started.elapsed().as_millis() as u64;
        let success = !self.summary.had_error;
        tracing::info!(
            run_id = %run_id,
            success,
            executed = self.summary.executed,
            failed = self.summary.failed,
            duration_ms = self.summary.duration_ms,
            "Pipeline finished"
        );
        self.emit(PipelineEvent::PipelineCompleted {
            run_id,
            success,
            duration_ms: self.summary.duration_ms,
        });

        ExecutionResult {
            data: self.bus.to_record(),
            context: self.context.to_record().await,
            success,
            error: self.bus.error().map(String::from),
        }
    }

    async fn execute_step(&mut self, index: usize) -> Flow {
        let step = &self.steps[index];
        let id = step.id.clone();
        tracing::info!(block = %id, block_type = %step.block_type(), index, "Executing block");
        self.emit(PipelineEvent::BlockStarted {
            block_id: id.clone(),
            block_type: step.block_type().to_string(),
            index,
        });

        let inputs = self.gather_inputs(step).await;
        let started = Instant::now();
        let outcome = invoke(step, inputs, &self.context).await;
        let duration = started.elapsed().as_millis() as u64;

        match outcome {
            StepOutcome::Fault(err) => {
                let message = err.to_string();
                tracing::error!(
                    block = %id,
                    duration_ms = duration,
                    configuration = err.is_configuration(),
                    error = %message,
                    "Block failed"
                );
                record_failure(&mut self.bus, &mut self.summary, &id, duration, &message);
                self.emit(PipelineEvent::BlockFailed {
                    block_id: id.clone(),
                    error: message,
                    soft: false,
                });
                if self.context.is_truthy(CONTINUE_ON_ERROR).await {
                    tracing::warn!(block = %id, "continueOnError set, moving on");
                    Flow::Next
                } else {
                    Flow::Halt
                }
            }
            StepOutcome::SoftError { output, message } => {
                tracing::error!(block = %id, duration_ms = duration, error = %message, "Block reported an error");
                store_output(&mut self.bus, step, &output);
                record_failure(&mut self.bus, &mut self.summary, &id, duration, &message);
                self.emit(PipelineEvent::BlockFailed {
                    block_id: id,
                    error: message,
                    soft: true,
                });
                Flow::Halt
            }
            StepOutcome::Success(output) => {
                store_output(&mut self.bus, step, &output);
                self.bus.set_meta(id.clone(), StepMeta::success(duration));
                self.summary.record_success(&id, duration);
                tracing::info!(block = %id, duration_ms = duration, "Block completed");
                self.emit(PipelineEvent::BlockCompleted {
                    block_id: id,
                    duration_ms: duration,
                });
                self.flow_control(index, &output).await
            }
        }
    }

    async fn gather_inputs(&self, step: &Step) -> Record {
        let context = self.context.snapshot().await;
        let scope = TemplateScope::new(&context, &self.bus);

        let mut inputs = match &step.input {
            None => self.bus.to_record(),
            Some(InputSpec::Template(raw)) => {
                let mut inputs = Record::new();
                if let Some(value) = resolve_value(&scope, &Value::String(raw.clone())) {
                    inputs.insert("body".to_string(), value);
                }
                inputs
            }
            Some(InputSpec::From { from, alias }) => {
                let value = self.bus.lookup(from);
                match (alias, value) {
                    (Some(name), Some(value)) => {
                        let mut inputs = Record::new();
                        inputs.insert(name.clone(), value);
                        inputs
                    }
                    (None, Some(Value::Object(map))) => map,
                    (None, Some(_)) => {
                        tracing::warn!(block = %step.id, from = %from, "Input source is not a record, ignoring it");
                        Record::new()
                    }
                    (_, None) => Record::new(),
                }
            }
            Some(InputSpec::Record(raw)) => raw
                .iter()
                .filter_map(|(k, v)| deep_resolve(&scope, v).map(|v| (k.clone(), v)))
                .collect(),
        };

        if let Some(config) = &step.config {
            for (key, value) in config {
                inputs.insert(key.clone(), value.clone());
            }
        }

        tracing::debug!(
            block = %step.id,
            keys = ?inputs.keys().collect::<Vec<_>>(),
            "Resolved inputs"
        );
        inputs
    }

    /// Interpret `_terminate` and `_loopTo` in a successful output.
    async fn flow_control(&self, index: usize, output: &Record) -> Flow {
        let id = &self.steps[index].id;

        if output.get(TERMINATE_FIELD).is_some_and(is_truthy) {
            tracing::info!(block = %id, "Block requested termination");
            self.emit(PipelineEvent::Terminated {
                block_id: id.clone(),
            });
            return Flow::Halt;
        }

        let Some(loop_to) = output.get(LOOP_TO_FIELD) else {
            return Flow::Next;
        };
        let counter_key = match loop_to {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let target = match self.resolve_target(loop_to) {
            Some(target) if target < index => target,
            Some(target) => {
                tracing::warn!(block = %id, target, "Ignoring loop target that is not behind the current block");
                return Flow::Next;
            }
            None => {
                tracing::warn!(block = %id, loop_to = %counter_key, "Loop target not found");
                return Flow::Next;
            }
        };

        let max_loops = output
            .get(MAX_LOOPS_FIELD)
            .and_then(whole_number)
            .unwrap_or(DEFAULT_MAX_LOOPS);
        let count = self.context.loop_count(&counter_key).await;
        if u64::from(count) >= max_loops {
            tracing::warn!(block = %id, loop_to = %counter_key, max_loops, "Loop limit reached, continuing");
            self.emit(PipelineEvent::LoopLimitReached {
                block_id: id.clone(),
                target: counter_key,
                max_loops,
            });
            return Flow::Next;
        }

        let iteration = self.context.increment_loop(&counter_key).await;
        tracing::info!(block = %id, to = %self.steps[target].id, iteration, max_loops, "Looping back");
        self.emit(PipelineEvent::LoopBack {
            from_block: id.clone(),
            to_block: self.steps[target].id.clone(),
            iteration,
        });
        Flow::JumpTo(target)
    }

    /// Map a `_loopTo` value to a step index: numbers are used as-is, strings
    /// name the first step with that id.
    fn resolve_target(&self, loop_to: &Value) -> Option<usize> {
        match loop_to {
            Value::Number(n) => n.as_u64().map(|i| i as usize),
            Value::String(id) => self.steps.iter().position(|s| &s.id == id),
            _ => None,
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(ref events) = self.events {
            events.emit(event);
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
