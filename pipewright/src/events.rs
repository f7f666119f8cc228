//! Execution events and sinks.
//!
//! The executor reports progress through an [`EventSink`]. Sinks must not
//! fail the run: errors inside a sink are logged and swallowed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Event kinds emitted by the executor.
pub mod kinds {
    /// A run began.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A run finished (successfully or not).
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage's agent is about to be invoked.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage produced output.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage's condition was false.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage failed after all retries.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage's output came from the cache.
    pub const STAGE_CACHE_HIT: &str = "stage.cache_hit";
    /// Every stage of a batch has settled.
    pub const BATCH_COMPLETED: &str = "batch.completed";
}

/// One execution event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// One of [`kinds`].
    pub kind: &'static str,
    /// Pipeline name.
    pub pipeline: String,
    /// Stage ID, for stage events.
    pub stage: Option<String>,
    /// Emission time.
    pub at: DateTime<Utc>,
    /// Kind-specific payload.
    pub data: Value,
}

impl Event {
    /// Pipeline-level event.
    pub fn new(kind: &'static str, pipeline: impl Into<String>) -> Self {
        Self {
            kind,
            pipeline: pipeline.into(),
            stage: None,
            at: Utc::now(),
            data: Value::Null,
        }
    }

    /// Stage-level event.
    pub fn for_stage(kind: &'static str, pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::new(kind, pipeline)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Receives execution events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: Event);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: Event) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Sink logging at `level` (`DEBUG` or `INFO`; anything else logs at `INFO`).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &Event) {
        let stage = event.stage.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(kind = event.kind, pipeline = %event.pipeline, stage, data = %event.data, "Event: {}", event.kind);
        } else {
            info!(kind = event.kind, pipeline = %event.pipeline, stage, data = %event.data, "Event: {}", event.kind);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: Event) {
        self.log_event(&event);
    }
}

/// Records events in memory, for tests and post-run inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl CollectingEventSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Event kinds in emission order.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.kind).collect()
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: &str) -> Vec<Event> {
        self.events.read().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    /// Events for one stage.
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage.as_deref() == Some(stage))
            .cloned()
            .collect()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets all events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: Event) {
        self.events.write().push(event);
    }
}
