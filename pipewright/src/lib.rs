//! # Pipewright
//!
//! Declarative pipeline orchestration core.
//!
//! Pipewright loads named pipeline definitions, resolves their stage
//! dependencies into ordered batches of parallel-safe stages, and provides
//! the primitives that let such a plan run repeatedly without corrupting
//! shared state:
//!
//! - **Definitions**: YAML documents with `extends` inheritance, `${ expr }`
//!   substitution, validation and implicit dependency inference
//! - **Plans**: deterministic batches of stages grouped by `parallel_with`
//! - **Layered cache**: in-memory tier in front of an optional Redis tier
//! - **File locks**: cross-process mutual exclusion with stale reclamation
//! - **Backups**: tar.gz snapshots with manifests, retention and off-box copies
//! - **Executor**: a reference runner for plans against opaque agents
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipewright::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipewrightConfig::load();
//! let loader = DefinitionLoader::from_config(&config.definitions);
//! let pipeline = loader.load("ebook", &serde_json::Map::new())?;
//!
//! let agents = AgentRegistry::new().with("writer", Arc::new(MyWriter));
//! let cache = Arc::new(LayeredCache::from_config(&config.cache).await);
//! let report = PlanExecutor::new(agents)
//!     .with_cache(cache)
//!     .run(&pipeline, &serde_json::Map::new())
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backup;
pub mod cache;
pub mod config;
pub mod definition;
pub mod errors;
pub mod events;
pub mod executor;
pub mod expr;
pub mod lock;
pub mod observability;
pub mod plan;
pub mod retry;
pub mod testing;


pub use errors::{PipewrightError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backup::{
        BackupInfo, BackupKind, BackupManager, BackupOptions, BackupResult, BackupSource,
        ListFilter, RestoreOptions, RestoreResult,
    };
    pub use crate::cache::{CacheTier, LayeredCache, MemoryTier, Structured};
    pub use crate::config::PipewrightConfig;
    pub use crate::definition::{DefinitionLoader, PipelineDefinition, ResolvedPipeline, Stage};
    pub use crate::errors::{
        CycleDetectedError, LockTimeoutError, NotFoundError, PipelineValidationError,
        PipewrightError, Result, StageFailure,
    };
    pub use crate::events::{CollectingEventSink, Event, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{Agent, AgentRegistry, AgentRequest, PlanExecutor, RunReport, StageStatus};
    pub use crate::lock::{FileLock, LockGuard, LockManager, LockOptions};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::plan::{compile_plan, ExecutionPlan};
    pub use crate::retry::BackoffPolicy;
}
