//! JSON pipeline descriptions and the builder that turns them into a
//! runnable [`Pipeline`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use blockrun_types::{Context, Record, Result, TestMeta};

use crate::block::BlockRegistry;
use crate::engine::{InputSpec, OutputSpec, Pipeline, Step};
use crate::template::expand_env;
use crate::validation::{validate_or_raise, Severity};

/// A parsed pipeline description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// String or number; kept as written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Seed for the pipeline context. Whole-value `${env.NAME}` strings are
    /// substituted at build time.
    #[serde(default)]
    pub context: Record,
    #[serde(default)]
    pub pipeline: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Value>,
}

impl PipelineDocument {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Test metadata carried into the context, or `None` when the document
    /// declares none of it.
    pub fn test_meta(&self) -> Option<TestMeta> {
        let meta = TestMeta {
            name: self.name.clone(),
            version: self.version.as_ref().map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            input: self.input.clone(),
            output: self.output.clone(),
            assertions: self.assertions.clone(),
        };
        (meta != TestMeta::default()).then_some(meta)
    }
}

/// One entry of the `pipeline` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Registry tag of the block to instantiate.
    pub block: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl StepSpec {
    /// The explicit id, or the block tag.
    pub fn step_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.block)
    }

    /// `config` when it is a record.
    pub fn config_record(&self) -> Option<&Record> {
        self.config.as_ref().and_then(Value::as_object)
    }
}

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Instantiates blocks through a [`BlockRegistry`] and wires them into a
/// [`Pipeline`].
pub struct PipelineBuilder {
    registry: BlockRegistry,
    env: Box<EnvLookup>,
}

impl PipelineBuilder {
    pub fn new(registry: BlockRegistry) -> Self {
        Self {
            registry,
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the process-environment lookup used for `${env.NAME}`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut BlockRegistry {
        &mut self.registry
    }

    /// Validate `doc` and build a pipeline from it.
    pub fn build(&self, doc: &PipelineDocument) -> Result<Pipeline> {
        let diagnostics = validate_or_raise(doc, &self.registry)?;
        for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            tracing::warn!(rule = %d.rule, step = ?d.step_id, "{}", d.message);
        }

        let context = match expand_env(Value::Object(doc.context.clone()), self.env.as_ref()) {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        let mut pipeline = Pipeline::with_context(Context::seeded(context, doc.test_meta()));

        for spec in &doc.pipeline {
            pipeline.push(self.build_step(spec)?);
        }

        tracing::info!(
            name = doc.name.as_deref().unwrap_or("<unnamed>"),
            steps = pipeline.len(),
            "Pipeline built"
        );
        Ok(pipeline)
    }

    pub fn from_json_str(&self, json: &str) -> Result<Pipeline> {
        self.build(&PipelineDocument::from_json_str(json)?)
    }

    pub fn from_file(&self, path: impl AsRef<Path>) -> Result<Pipeline> {
        self.build(&PipelineDocument::from_file(path)?)
    }

    fn build_step(&self, spec: &StepSpec) -> Result<Step> {
        let config = match &spec.config {
            Some(Value::Object(map)) => Some(map.clone()),
            None | Some(Value::Null) => None,
            Some(other) => {
                tracing::warn!(step = %spec.step_id(), config = %other, "Ignoring non-record config");
                None
            }
        };

        let block = self
            .registry
            .create(&spec.block, config.as_ref().unwrap_or(&Record::new()))?;
        let mut step = Step::from_boxed(block).with_id(spec.step_id());
        step.input = spec.input.clone();
        step.output = spec.output.clone();
        step.config = config;
        Ok(step)
    }
}
