//! Block pipeline engine, templating, conditions, builder, and suite runner.
//!
//! This crate implements the Blockrun runner: sequential block execution over
//! a shared data bus and context, `${...}` template resolution, declarative
//! conditions, loop-back and termination signals, JSON pipeline descriptions,
//! validation lints, suite orchestration, and the built-in blocks.

pub mod block;
pub mod blocks;
pub mod builder;
pub mod condition;
pub mod data_bus;
pub mod engine;
pub mod events;
pub mod path;
pub mod suite;
pub mod template;
pub mod validation;

pub use block::{default_registry, Block, BlockFactory, BlockRegistry, InputContract, OutputContract};
pub use blocks::{
    AssertBlock, DelayBlock, HttpRequestBlock, JsonParserBlock, LoopBlock, StreamParserBlock,
    TerminateBlock,
};
pub use builder::{PipelineBuilder, PipelineDocument, StepSpec};
pub use condition::{
    evaluate_all, evaluate_condition, evaluate_conditions, evaluate_operator, parse_conditions,
    Condition, Operator,
};
pub use data_bus::{DataBus, StepMeta};
pub use engine::{
    BlockResult, ExecutionResult, ExecutionSummary, InputSpec, OutputSpec, Pipeline, Step,
    StepOutcome,
};
pub use events::{EventEmitter, PipelineEvent};
pub use path::{get_path, parse_path, set_path, Segment};
pub use suite::{SuiteDocument, SuiteReport, SuiteRunner, SuiteTest, TestReport};
pub use template::{deep_resolve, expand_env, resolve_value, TemplateScope};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
