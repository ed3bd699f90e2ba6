//! Run events published over a [`tokio::sync::broadcast`] channel.
//!
//! A [`Pipeline`](crate::engine::Pipeline) with an [`EventEmitter`] attached
//! publishes one event per lifecycle step; without one it publishes nothing.
//! Events serialize as internally tagged JSON (`{"type": "block_started", ...}`).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        block_count: usize,
    },
    PipelineCompleted {
        run_id: String,
        success: bool,
        duration_ms: u64,
    },
    BlockStarted {
        block_id: String,
        block_type: String,
        index: usize,
    },
    BlockCompleted {
        block_id: String,
        duration_ms: u64,
    },
    BlockFailed {
        block_id: String,
        error: String,
        /// `true` when the block reported the error in its output rather than
        /// returning a fault.
        soft: bool,
    },
    LoopBack {
        from_block: String,
        to_block: String,
        iteration: u32,
    },
    LoopLimitReached {
        block_id: String,
        target: String,
        max_loops: u64,
    },
    Terminated {
        block_id: String,
    },
}

impl PipelineEvent {
    /// The block the event is about; `None` for run-level events.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::PipelineStarted { .. } | PipelineEvent::PipelineCompleted { .. } => None,
            PipelineEvent::BlockStarted { block_id, .. }
            | PipelineEvent::BlockCompleted { block_id, .. }
            | PipelineEvent::BlockFailed { block_id, .. }
            | PipelineEvent::LoopLimitReached { block_id, .. }
            | PipelineEvent::Terminated { block_id } => Some(block_id),
            PipelineEvent::LoopBack { from_block, .. } => Some(from_block),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PipelineEvent::BlockFailed { .. } | PipelineEvent::PipelineCompleted { success: false, .. }
        )
    }
}

/// Cloneable publisher; every clone feeds the same subscribers.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish `event`. Dropped when nobody is subscribed.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
