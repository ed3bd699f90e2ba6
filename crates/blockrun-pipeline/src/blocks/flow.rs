//! Flow-control blocks: conditional loop-back, early termination, and delays.
//!
//! These blocks never jump themselves. They emit the reserved `_loopTo`,
//! `_maxLoops`, and `_terminate` fields and the engine acts on them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use blockrun_types::{Context, Record, Result};

use super::{record, required};
use crate::block::{Block, InputContract, OutputContract};
use crate::condition::{evaluate_conditions, whole_number};
use crate::engine::DEFAULT_MAX_LOOPS;

fn conditions_hold(inputs: &Record) -> Result<bool> {
    match inputs.get("conditions") {
        Some(conditions) => {
            let data = inputs.get("data").cloned().unwrap_or(Value::Null);
            evaluate_conditions(&data, conditions)
        }
        None => Ok(true),
    }
}

fn millis(inputs: &Record, key: &str) -> u64 {
    inputs.get(key).and_then(whole_number).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// LoopBlock
// ---------------------------------------------------------------------------

/// Requests a backward jump to `target` while `conditions` hold against
/// `data` (always, when no conditions are given), sleeping `delay` ms first.
pub struct LoopBlock;

#[async_trait]
impl Block for LoopBlock {
    fn block_type(&self) -> &str {
        "loop"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new(["target"], ["conditions", "data", "maxIterations", "delay"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["looping", "iteration", "_loopTo", "_maxLoops"])
    }

    async fn process(&self, inputs: &Record, context: &Context) -> Result<Record> {
        let target = required(self.block_type(), inputs, "target")?.clone();
        let counter_key = match &target {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let iteration = context.loop_count(&counter_key).await;

        if !conditions_hold(inputs)? {
            return Ok(record(json!({ "looping": false, "iteration": iteration })));
        }

        let max_loops = inputs
            .get("maxIterations")
            .and_then(whole_number)
            .unwrap_or(DEFAULT_MAX_LOOPS);
        let delay = millis(inputs, "delay");
        if delay > 0 {
            tracing::debug!(loop_target = %counter_key, delay_ms = delay, "Delaying before loop-back");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        Ok(record(json!({
            "looping": true,
            "iteration": iteration,
            "_loopTo": target,
            "_maxLoops": max_loops,
        })))
    }
}

// ---------------------------------------------------------------------------
// TerminateBlock
// ---------------------------------------------------------------------------

/// Ends the run successfully when `conditions` hold against `data`.
pub struct TerminateBlock;

#[async_trait]
impl Block for TerminateBlock {
    fn block_type(&self) -> &str {
        "terminate"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new([], ["conditions", "data"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["terminated", "_terminate"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        if conditions_hold(inputs)? {
            Ok(record(json!({ "terminated": true, "_terminate": true })))
        } else {
            Ok(record(json!({ "terminated": false })))
        }
    }
}

// ---------------------------------------------------------------------------
// DelayBlock
// ---------------------------------------------------------------------------

pub struct DelayBlock;

#[async_trait]
impl Block for DelayBlock {
    fn block_type(&self) -> &str {
        "delay"
    }

    fn inputs(&self) -> InputContract {
        InputContract::new([], ["ms"])
    }

    fn outputs(&self) -> OutputContract {
        OutputContract::new(["delayed"])
    }

    async fn process(&self, inputs: &Record, _context: &Context) -> Result<Record> {
        let ms = millis(inputs, "ms");
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(record(json!({ "delayed": ms })))
    }
}
