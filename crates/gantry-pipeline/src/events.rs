//! Engine event stream for observability.
//!
//! Each run owns an [`EventEmitter`]. Every emitted event is wrapped in an
//! [`EventEnvelope`] carrying a monotonically increasing per-run ordinal,
//! then fanned out on a bounded [`tokio::sync::broadcast`] channel. Slow
//! subscribers lose events rather than stalling the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use gantry_types::Outcome;

/// Channel capacity per run. Lossy for subscribers that fall further behind.
pub const EVENT_BUFFER: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    PipelineStarted {
        pipeline_name: String,
        node_count: usize,
    },
    StageStarted {
        node_id: String,
        handler_type: String,
    },
    StageCompleted {
        node_id: String,
        status: String,
        duration_ms: u64,
    },
    StageFailed {
        node_id: String,
        reason: String,
    },
    StageRetrying {
        node_id: String,
        attempt: usize,
        delay_ms: u64,
    },
    CheckpointSaved {
        node_id: String,
    },
    PipelineCompleted {
        completed_nodes: Vec<String>,
        outcome: Box<Outcome>,
    },
    PipelineFailed {
        reason: String,
    },
}

impl EngineEvent {
    /// The wire name of the variant, used as the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PipelineStarted { .. } => "PipelineStarted",
            EngineEvent::StageStarted { .. } => "StageStarted",
            EngineEvent::StageCompleted { .. } => "StageCompleted",
            EngineEvent::StageFailed { .. } => "StageFailed",
            EngineEvent::StageRetrying { .. } => "StageRetrying",
            EngineEvent::CheckpointSaved { .. } => "CheckpointSaved",
            EngineEvent::PipelineCompleted { .. } => "PipelineCompleted",
            EngineEvent::PipelineFailed { .. } => "PipelineFailed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub ordinal: u64,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Per-run event emitter with ordinal numbering.
#[derive(Clone)]
pub struct EventEmitter {
    run_id: String,
    sender: tokio::sync::broadcast::Sender<EventEnvelope>,
    ordinal: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(EVENT_BUFFER);
        Self {
            run_id: run_id.into(),
            sender,
            ordinal: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all current subscribers, assigning the next ordinal.
    /// With no active receivers the event is silently dropped.
    pub fn emit(&self, event: EngineEvent) -> EventEnvelope {
        let envelope = EventEnvelope {
            ordinal: self.ordinal.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id.clone(),
            timestamp: chrono::Utc::now(),
            event,
        };
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}
