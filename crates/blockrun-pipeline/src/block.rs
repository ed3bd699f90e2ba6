//! Block trait, declared input/output contracts, and the block registry.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use blockrun_types::{BlockrunError, Context, Record, Result};

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Input names a block declares. Only `required` is enforced by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputContract {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl InputContract {
    pub fn new<'a>(
        required: impl IntoIterator<Item = &'a str>,
        optional: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            required: required.into_iter().map(String::from).collect(),
            optional: optional.into_iter().map(String::from).collect(),
        }
    }

    /// Required names that are absent from `inputs`.
    pub fn missing(&self, inputs: &Record) -> Vec<String> {
        self.required
            .iter()
            .filter(|name| !inputs.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Output fields a block declares. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputContract {
    pub produces: Vec<String>,
}

impl OutputContract {
    pub fn new<'a>(produces: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            produces: produces.into_iter().map(String::from).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Block trait
// ---------------------------------------------------------------------------

/// One unit of work in a pipeline.
///
/// `process` receives the resolved inputs (step `config` already merged on
/// top) and the live shared [`Context`]. It must not rely on mutating
/// `inputs`; it may read and write the context. The returned record is
/// stored on the data bus. An `error` field marks a soft failure, and the
/// reserved `_terminate`, `_loopTo`, and `_maxLoops` fields steer the engine.
#[async_trait]
pub trait Block: Send + Sync {
    /// The block type tag (e.g. "http_request", "json_parser").
    fn block_type(&self) -> &str;

    fn inputs(&self) -> InputContract {
        InputContract::default()
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::default()
    }

    async fn process(&self, inputs: &Record, context: &Context) -> Result<Record>;
}

// ---------------------------------------------------------------------------
// BlockRegistry
// ---------------------------------------------------------------------------

/// Builds a block instance from the step's `config` record.
pub type BlockFactory = Box<dyn Fn(&Record) -> Result<Box<dyn Block>> + Send + Sync>;

/// Maps block type tags to factories. Used by the builder only; the engine
/// holds already-constructed blocks.
pub struct BlockRegistry {
    factories: HashMap<String, BlockFactory>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, block_type: impl Into<String>, factory: F)
    where
        F: Fn(&Record) -> Result<Box<dyn Block>> + Send + Sync + 'static,
    {
        self.factories.insert(block_type.into(), Box::new(factory));
    }

    /// Instantiate a block of type `block_type`.
    pub fn create(&self, block_type: &str, config: &Record) -> Result<Box<dyn Block>> {
        let factory = self
            .factories
            .get(block_type)
            .ok_or_else(|| BlockrunError::UnknownBlockType(block_type.to_string()))?;
        factory(config)
    }

    pub fn has(&self, block_type: &str) -> bool {
        self.factories.contains_key(block_type)
    }

    /// Registered type tags, sorted.
    pub fn block_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> BlockRegistry {
    use crate::blocks::{
        AssertBlock, DelayBlock, HttpRequestBlock, JsonParserBlock, LoopBlock, StreamParserBlock,
        TerminateBlock,
    };

    let mut reg = BlockRegistry::new();
    reg.register("http_request", |config| Ok(Box::new(HttpRequestBlock::from_config(config)?)));
    reg.register("json_parser", |_| Ok(Box::new(JsonParserBlock)));
    reg.register("stream_parser", |_| Ok(Box::new(StreamParserBlock)));
    reg.register("assert", |_| Ok(Box::new(AssertBlock)));
    reg.register("loop", |_| Ok(Box::new(LoopBlock)));
    reg.register("delay", |_| Ok(Box::new(DelayBlock)));
    reg.register("terminate", |_| Ok(Box::new(TerminateBlock)));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
