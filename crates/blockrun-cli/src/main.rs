//! CLI binary for running and validating Blockrun pipelines and suites.

mod report;

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use blockrun_pipeline::engine::CONTINUE_ON_ERROR;
use blockrun_pipeline::{
    default_registry, validate, EventEmitter, ExecutionResult, ExecutionSummary, InputSpec,
    OutputSpec, PipelineBuilder, PipelineDocument, Severity, SuiteRunner,
};
use blockrun_types::Record;

#[derive(Parser)]
#[command(name = "blockrun", version, about = "Declarative JSON test pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a JSON description
    Run {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Input record as a JSON object, stored in the `input` slot
        #[arg(short, long)]
        input: Option<String>,

        /// Set a context value (VALUE is parsed as JSON, else used as a string)
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, Value)>,

        /// Keep going after a block fault
        #[arg(long)]
        continue_on_error: bool,

        /// Print the result and summary as JSON
        #[arg(long)]
        json: bool,

        /// Stream run events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Validate a pipeline description
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Run a suite: setup, tests, teardown
    Suite {
        /// Path to the suite .json file
        suite: PathBuf,

        /// Print the suite report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `--json` output stays parseable
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            set,
            continue_on_error,
            json,
            events,
        } => {
            let opts = RunOptions {
                continue_on_error,
                json,
                events,
            };
            cmd_run(&pipeline, input.as_deref(), set, opts).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
        Commands::Suite { suite, json } => {
            cmd_suite(&suite, json).await?;
        }
    }

    Ok(())
}

/// Parse `KEY=VALUE`; VALUE is JSON when it parses, else a plain string.
fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_input(raw: Option<&str>) -> anyhow::Result<Record> {
    let Some(raw) = raw else {
        return Ok(Record::new());
    };
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--input must be a JSON object, got {other}"),
    }
}

fn load_document(path: &Path) -> anyhow::Result<PipelineDocument> {
    PipelineDocument::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

struct RunOptions {
    continue_on_error: bool,
    json: bool,
    events: bool,
}

/// Print every event as one JSON line on stderr until the emitter is dropped.
fn spawn_event_printer(events: &EventEmitter) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Wait for the printer to drain. Returns `false`, after logging, when the
/// task panicked or was cancelled.
async fn join_event_printer(handle: tokio::task::JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Event printer task failed");
            false
        }
    }
}

#[derive(Serialize)]
struct RunOutput<'a> {
    result: &'a ExecutionResult,
    summary: &'a ExecutionSummary,
}

async fn cmd_run(
    path: &Path,
    input: Option<&str>,
    set: Vec<(String, Value)>,
    opts: RunOptions,
) -> anyhow::Result<()> {
    let doc = load_document(path)?;
    let input = parse_input(input)?;
    let name = doc.name.clone().unwrap_or_else(|| path.display().to_string());

    let builder = PipelineBuilder::new(default_registry());
    let mut pipeline = builder
        .build(&doc)
        .with_context(|| format!("failed to build {}", path.display()))?;

    let printer = if opts.events {
        let events = EventEmitter::default();
        let handle = spawn_event_printer(&events);
        pipeline = pipeline.with_events(events);
        Some(handle)
    } else {
        None
    };

    let mut overrides: Record = set.into_iter().collect();
    if opts.continue_on_error {
        overrides.insert(CONTINUE_ON_ERROR.to_string(), Value::Bool(true));
    }
    tracing::debug!(keys = ?overrides.keys().collect::<Vec<_>>(), "Context overrides");

    if !opts.json {
        println!("Running pipeline: {name}");
        if let Some(ref description) = doc.description {
            println!("{description}");
        }
        println!();
    }

    let result = pipeline.execute(input, overrides).await;
    let summary = pipeline.summary().clone();

    if let Some(handle) = printer {
        // Dropping the pipeline drops the last sender and closes the channel
        drop(pipeline);
        join_event_printer(handle).await;
    }

    if opts.json {
        let output = RunOutput {
            result: &result,
            summary: &summary,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", report::render_run(&name, &result, &summary));
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let doc = load_document(path)?;
    let diagnostics = validate(&doc, &default_registry());

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match diag.step_id {
            Some(ref id) => println!("[{severity}] {} ({id}): {}", diag.rule, diag.message),
            None => println!("[{severity}] {}: {}", diag.rule, diag.message),
        }
        if let Some(ref fix) = diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn describe_input(input: Option<&InputSpec>) -> String {
    match input {
        None => "<data bus>".into(),
        Some(InputSpec::Template(template)) => format!("body={template}"),
        Some(InputSpec::From { from, alias: Some(alias) }) => format!("{alias}<-{from}"),
        Some(InputSpec::From { from, alias: None }) => format!("<-{from}"),
        Some(InputSpec::Record(record)) => {
            let keys: Vec<&str> = record.keys().map(String::as_str).collect();
            format!("{{{}}}", keys.join(", "))
        }
    }
}

fn describe_output(output: Option<&OutputSpec>, id: &str) -> String {
    match output {
        None => id.to_string(),
        Some(OutputSpec::Slot(slot)) => slot.clone(),
        Some(OutputSpec::Mapping(mapping)) => mapping
            .iter()
            .map(|(field, slot)| format!("{field}->{slot}"))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let doc = load_document(path)?;

    println!("Pipeline: {}", doc.name.as_deref().unwrap_or("<unnamed>"));
    if let Some(ref version) = doc.version {
        println!("Version: {version}");
    }
    if let Some(ref description) = doc.description {
        println!("Description: {description}");
    }
    println!("Steps: {}", doc.pipeline.len());

    if !doc.context.is_empty() {
        let keys: Vec<&str> = doc.context.keys().map(String::as_str).collect();
        println!("Context keys: {}", keys.join(", "));
    }
    if !doc.assertions.is_empty() {
        println!("Assertions: {}", doc.assertions.len());
    }

    println!("\nSteps:");
    for (index, step) in doc.pipeline.iter().enumerate() {
        let id = step.step_id();
        println!(
            "  {index}. {id} [{}] input={} output={}",
            step.block,
            describe_input(step.input.as_ref()),
            describe_output(step.output.as_ref(), id)
        );
    }

    Ok(())
}

async fn cmd_suite(path: &Path, json: bool) -> anyhow::Result<()> {
    let runner = SuiteRunner::new(PipelineBuilder::new(default_registry()));
    let report = runner
        .run_file(path)
        .await
        .with_context(|| format!("failed to load suite {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report::render_suite(&report));
    }

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
