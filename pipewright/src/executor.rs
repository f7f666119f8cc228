//! Reference plan executor.
//!
//! Runs an [`ExecutionPlan`](crate::plan::ExecutionPlan) batch by batch. Every stage of a batch is a
//! separate tokio task and the batch is a barrier: the next batch starts
//! only after every sibling has settled, failing ones included. A failed
//! required stage stops the run after its batch drains.
//!
//! Per stage the executor evaluates the `condition`, takes the stage's
//! file locks, then invokes the agent (through the cache when `cache` is
//! set), bounding each attempt by `timeout` and retrying up to `retries`
//! times with backoff.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::{hash_value, LayeredCache};
use crate::definition::{ResolvedPipeline, Stage};
use crate::errors::StageFailure;
use crate::events::{kinds, Event, EventSink, NoOpEventSink};
use crate::expr::{evaluate_condition, Scope};
use crate::lock::LockManager;
use crate::retry::{retry_with_backoff, BackoffPolicy};

/// Input handed to an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    /// Pipeline name.
    pub pipeline: String,
    /// Stage ID.
    pub stage: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// The stage's resolved `config`.
    pub config: Map<String, Value>,
    /// Outputs of the stage's completed dependencies, by stage ID.
    pub inputs: Map<String, Value>,
}

/// An external collaborator performing a stage's work.
///
/// A `null` result counts as a failure.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Performs the work for one attempt.
    async fn invoke(&self, request: AgentRequest) -> Result<Value, String>;
}

/// Agents by identifier.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.agents.keys().collect();
        names.sort();
        f.debug_struct("AgentRegistry").field("agents", &names).finish()
    }
}

impl AgentRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent` under `name`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.register(name, agent);
        self
    }

    /// Registers `agent` under `name` in place.
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    /// Looks up an agent.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// True when no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Final state of a stage in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The agent produced output (possibly from the cache).
    Completed,
    /// The condition was false or could not be evaluated.
    Skipped,
    /// Every attempt failed.
    Failed,
    /// The run stopped before the stage's batch.
    NotRun,
}

impl StageStatus {
    /// Name used in condition expressions (`stages.<id>.status`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::NotRun => "not_run",
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage ID.
    pub stage: String,
    /// Final status.
    pub status: StageStatus,
    /// Agent attempts made (0 when skipped, not run, or served from cache).
    pub attempts: u32,
    /// Wall time including lock waits.
    pub duration: Duration,
    /// Agent output.
    pub output: Option<Value>,
    /// Failure details.
    pub error: Option<StageFailure>,
    /// Output came from the cache.
    pub cache_hit: bool,
    /// Whether failure aborts the run.
    pub required: bool,
}

impl StageReport {
    fn new(stage: &Stage, status: StageStatus) -> Self {
        Self {
            stage: stage.id.clone(),
            status,
            attempts: 0,
            duration: Duration::ZERO,
            output: None,
            error: None,
            cache_hit: false,
            required: stage.required,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Pipeline name.
    pub pipeline: String,
    /// No required stage failed.
    pub success: bool,
    /// Per-stage outcomes in plan order.
    pub stages: Vec<StageReport>,
    /// Index of the batch whose required failure stopped the run.
    pub aborted_at_batch: Option<usize>,
    /// Total wall time.
    pub duration: Duration,
}

impl RunReport {
    /// Report for one stage.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == id)
    }

    /// Status of one stage.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<StageStatus> {
        self.stage(id).map(|s| s.status)
    }

    /// Output of one stage.
    #[must_use]
    pub fn output_of(&self, id: &str) -> Option<&Value> {
        self.stage(id).and_then(|s| s.output.as_ref())
    }
}

#[derive(Debug)]
enum InvokeError {
    Agent(String),
    Empty,
    Timeout(Duration),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(reason) => f.write_str(reason),
            Self::Empty => f.write_str("agent returned no result"),
            Self::Timeout(d) => write!(f, "timed out after {}s", d.as_secs_f64()),
        }
    }
}

/// Runs resolved pipelines against an [`AgentRegistry`].
#[derive(Clone)]
pub struct PlanExecutor {
    agents: Arc<AgentRegistry>,
    cache: Option<Arc<LayeredCache>>,
    locks: Arc<LockManager>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("agents", &self.agents)
            .field("cache", &self.cache.as_ref().map(|c| c.tier_names()))
            .field("locks", &self.locks)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Executor without cache, with default lock options and no event sink.
    #[must_use]
    pub fn new(agents: AgentRegistry) -> Self {
        Self {
            agents: Arc::new(agents),
            cache: None,
            locks: Arc::new(LockManager::default()),
            events: Arc::new(NoOpEventSink),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Uses `cache` for stages with `cache: true`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<LayeredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses `locks` for stage `locks`.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Sends events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Backoff between stage attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs `pipeline`. `variables` are visible to stage conditions.
    pub async fn run(&self, pipeline: &ResolvedPipeline, variables: &Map<String, Value>) -> RunReport {
        let started = Instant::now();
        let definition = &pipeline.definition;
        let name = definition.name.clone();

        info!(pipeline = %name, batches = pipeline.plan.batches.len(), "Pipeline run started");
        self.events
            .emit(Event::new(kinds::PIPELINE_STARTED, &name).with_data(json!({
                "batches": pipeline.plan.batches.len(),
                "stages": pipeline.plan.stage_count(),
            })))
            .await;

        let base_scope = Scope::new()
            .with_root("variables", Value::Object(variables.clone()))
            .with_root("settings", Value::Object(definition.settings.clone()))
            .with_env();

        let mut reports: HashMap<String, StageReport> = HashMap::new();
        let mut stage_states = Map::new();
        let mut aborted_at_batch = None;

        for (index, batch) in pipeline.plan.batches.iter().enumerate() {
            let scope = Arc::new(
                base_scope
                    .clone()
                    .with_root("stages", Value::Object(stage_states.clone())),
            );

            let mut handles = Vec::with_capacity(batch.len());
            for id in batch.stage_ids() {
                let Some(stage) = definition.stage(id) else {
                    continue;
                };
                let inputs: Map<String, Value> = stage
                    .dependencies()
                    .iter()
                    .filter_map(|dep| {
                        reports
                            .get(dep)
                            .and_then(|r| r.output.clone())
                            .map(|out| (dep.clone(), out))
                    })
                    .collect();

                let this = self.clone();
                let stage = stage.clone();
                let pipeline_name = name.clone();
                let scope = Arc::clone(&scope);
                let fallback = StageReport::new(&stage, StageStatus::Failed);
                let agent = stage.agent.clone();
                handles.push((
                    fallback,
                    agent,
                    tokio::spawn(async move { this.run_stage(&pipeline_name, stage, &scope, inputs).await }),
                ));
            }

            let (meta, joins): (Vec<_>, Vec<_>) = handles
                .into_iter()
                .map(|(fallback, agent, handle)| ((fallback, agent), handle))
                .unzip();
            let results = join_all(joins).await;

            let mut batch_failed = Vec::new();
            for ((mut fallback, agent), result) in meta.into_iter().zip(results) {
                let report = match result {
                    Ok(report) => report,
                    Err(e) => {
                        error!(pipeline = %name, stage = %fallback.stage, error = %e, "Stage task panicked");
                        fallback.error = Some(StageFailure {
                            stage: fallback.stage.clone(),
                            agent,
                            attempts: 0,
                            reason: format!("stage task panicked: {e}"),
                            timed_out: false,
                        });
                        fallback
                    }
                };

                if report.status == StageStatus::Failed {
                    batch_failed.push(report.stage.clone());
                    if report.required {
                        aborted_at_batch = Some(index);
                    }
                }
                stage_states.insert(
                    report.stage.clone(),
                    json!({
                        "status": report.status.as_str(),
                        "output": report.output.clone().unwrap_or(Value::Null),
                    }),
                );
                reports.insert(report.stage.clone(), report);
            }

            self.events
                .emit(Event::new(kinds::BATCH_COMPLETED, &name).with_data(json!({
                    "index": index,
                    "stages": batch.stage_ids().collect::<Vec<_>>(),
                    "failed": batch_failed,
                })))
                .await;

            if aborted_at_batch.is_some() {
                warn!(pipeline = %name, batch = index, "Required stage failed; stopping run");
                break;
            }
        }

        let stages: Vec<StageReport> = pipeline
            .plan
            .batches
            .iter()
            .flat_map(|b| b.stage_ids())
            .filter_map(|id| {
                reports.remove(id).or_else(|| {
                    definition
                        .stage(id)
                        .map(|stage| StageReport::new(stage, StageStatus::NotRun))
                })
            })
            .collect();

        let success = aborted_at_batch.is_none();
        let duration = started.elapsed();
        info!(
            pipeline = %name,
            success,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Pipeline run finished"
        );
        self.events
            .emit(Event::new(kinds::PIPELINE_COMPLETED, &name).with_data(json!({
                "success": success,
                "aborted_at_batch": aborted_at_batch,
                "duration_ms": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            })))
            .await;

        RunReport {
            pipeline: name,
            success,
            stages,
            aborted_at_batch,
            duration,
        }
    }

    async fn run_stage(
        &self,
        pipeline: &str,
        stage: Stage,
        scope: &Scope,
        inputs: Map<String, Value>,
    ) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::new(&stage, StageStatus::Failed);

        if let Some(condition) = &stage.condition {
            let run = match evaluate_condition(condition, scope) {
                Ok(run) => run,
                Err(e) => {
                    warn!(pipeline, stage = %stage.id, condition = %condition, error = %e, "Condition failed to evaluate; skipping");
                    false
                }
            };
            if !run {
                debug!(pipeline, stage = %stage.id, "Condition false; skipping");
                report.status = StageStatus::Skipped;
                self.events
                    .emit(Event::for_stage(kinds::STAGE_SKIPPED, pipeline, &stage.id)
                        .with_data(json!({ "condition": condition })))
                    .await;
                return report;
            }
        }

        let failure = |reason: String, attempts: u32, timed_out: bool| StageFailure {
            stage: stage.id.clone(),
            agent: stage.agent.clone(),
            attempts,
            reason,
            timed_out,
        };

        let Some(agent) = self.agents.get(&stage.agent) else {
            let err = failure(format!("unknown agent '{}'", stage.agent), 0, false);
            return self.finish_failed(pipeline, report, err, started).await;
        };

        let _guards = if stage.locks.is_empty() {
            Vec::new()
        } else {
            match self.locks.lock_all(&stage.locks).await {
                Ok(guards) => guards,
                Err(e) => {
                    let err = failure(e.to_string(), 0, false);
                    return self.finish_failed(pipeline, report, err, started).await;
                }
            }
        };

        self.events
            .emit(Event::for_stage(kinds::STAGE_STARTED, pipeline, &stage.id).with_data(json!({
                "agent": stage.agent,
                "retries": stage.retries,
            })))
            .await;

        let attempts = AtomicU32::new(0);
        let timed_out = AtomicBool::new(false);
        let (attempts_ref, timed_out_ref) = (&attempts, &timed_out);
        let (stage_ref, agent_ref, inputs_ref, backoff) = (&stage, &agent, &inputs, &self.backoff);
        let invoke = move || async move {
            let stage = stage_ref;
            let result = retry_with_backoff(backoff, stage.retries, |attempt| {
                let agent = Arc::clone(agent_ref);
                let request = AgentRequest {
                    pipeline: pipeline.to_string(),
                    stage: stage.id.clone(),
                    attempt,
                    config: stage.config.clone(),
                    inputs: inputs_ref.clone(),
                };
                let limit = stage.timeout_duration();
                async move {
                    let call = agent.invoke(request);
                    let outcome = match limit {
                        Some(limit) => tokio::time::timeout(limit, call)
                            .await
                            .map_err(|_| InvokeError::Timeout(limit))?,
                        None => call.await,
                    };
                    match outcome {
                        Ok(Value::Null) => Err(InvokeError::Empty),
                        Ok(value) => Ok(value),
                        Err(reason) => Err(InvokeError::Agent(reason)),
                    }
                }
            })
            .await;
            match result {
                Ok((value, n)) => {
                    attempts_ref.store(n, Ordering::Relaxed);
                    Ok(value)
                }
                Err((e, n)) => {
                    attempts_ref.store(n, Ordering::Relaxed);
                    timed_out_ref.store(matches!(e, InvokeError::Timeout(_)), Ordering::Relaxed);
                    Err(e)
                }
            }
        };

        let outcome = match (&self.cache, stage.cache) {
            (Some(cache), true) => {
                let key = stage.cache_key.clone().unwrap_or_else(|| {
                    hash_value(&json!({
                        "pipeline": pipeline,
                        "stage": stage.id,
                        "agent": stage.agent,
                        "config": stage.config,
                    }))
                });
                let ttl = stage.cache_ttl.map(Duration::from_secs);
                cache.wrap_with_status(&key, ttl, invoke).await
            }
            _ => invoke().await.map(|value| (value, false)),
        };

        report.attempts = attempts.load(Ordering::Relaxed);
        match outcome {
            Ok((value, cache_hit)) => {
                report.status = StageStatus::Completed;
                report.cache_hit = cache_hit;
                report.duration = started.elapsed();
                if cache_hit {
                    debug!(pipeline, stage = %stage.id, "Served from cache");
                    self.events
                        .emit(Event::for_stage(kinds::STAGE_CACHE_HIT, pipeline, &stage.id))
                        .await;
                }
                self.events
                    .emit(Event::for_stage(kinds::STAGE_COMPLETED, pipeline, &stage.id).with_data(json!({
                        "attempts": report.attempts,
                        "cache_hit": cache_hit,
                        "duration_ms": u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
                    })))
                    .await;
                report.output = Some(value);
                report
            }
            Err(e) => {
                let err = failure(e.to_string(), report.attempts, timed_out.load(Ordering::Relaxed));
                self.finish_failed(pipeline, report, err, started).await
            }
        }
    }

    async fn finish_failed(
        &self,
        pipeline: &str,
        mut report: StageReport,
        failure: StageFailure,
        started: Instant,
    ) -> StageReport {
        if report.required {
            error!(pipeline, stage = %failure.stage, error = %failure, "Required stage failed");
        } else {
            warn!(pipeline, stage = %failure.stage, error = %failure, "Optional stage failed");
        }
        self.events
            .emit(Event::for_stage(kinds::STAGE_FAILED, pipeline, &failure.stage).with_data(json!({
                "reason": failure.reason,
                "attempts": failure.attempts,
                "timed_out": failure.timed_out,
                "required": report.required,
            })))
            .await;
        report.status = StageStatus::Failed;
        report.attempts = failure.attempts;
        report.duration = started.elapsed();
        report.error = Some(failure);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::resolve_str;
    use crate::events::CollectingEventSink;
    use crate::retry::JitterStrategy;
    use crate::testing::{FailingAgent, FlakyAgent, MockAgent, SlowAgent};
    use pretty_assertions::assert_eq;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_millis(1), Duration::from_millis(5))
            .with_jitter(JitterStrategy::None)
    }

    fn resolve(yaml: &str) -> ResolvedPipeline {
        resolve_str(yaml, &Map::new()).unwrap()
    }

    #[tokio::test]
    async fn test_runs_batches_in_order_and_passes_inputs() {
        let pipeline = resolve(
            r"
name: ebook
stages:
  - id: outline
    agent: writer
  - id: chapters
    agent: writer
  - id: cover
    agent: echo
    depends_on: [outline]
    parallel_with: [chapters]
",
        );
        let writer = Arc::new(MockAgent::returning(json!({"text": "ok"})));
        let echo = Arc::new(MockAgent::echo());
        let sink = Arc::new(CollectingEventSink::new());
        let executor = PlanExecutor::new(
            AgentRegistry::new()
                .with("writer", writer.clone())
                .with("echo", echo.clone()),
        )
        .with_events(sink.clone());

        let report = executor.run(&pipeline, &Map::new()).await;

        assert!(report.success);
        assert_eq!(writer.calls(), 2);
        assert_eq!(report.status_of("cover"), Some(StageStatus::Completed));
        let cover_inputs = &report.output_of("cover").unwrap()["inputs"];
        assert_eq!(cover_inputs, &json!({"outline": {"text": "ok"}}));
        assert_eq!(sink.of_kind(kinds::BATCH_COMPLETED).len(), 2);
        assert_eq!(sink.kinds().first(), Some(&kinds::PIPELINE_STARTED));
        assert_eq!(sink.kinds().last(), Some(&kinds::PIPELINE_COMPLETED));
    }

    #[tokio::test]
    async fn test_condition_sees_previous_stage_status() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: draft
    agent: ok
  - id: review
    agent: ok
    condition: stages.draft.status == 'completed'
  - id: images
    agent: ok
    condition: ${variables.with_images}
  - id: publish
    agent: ok
    depends_on: [images]
",
        );
        let executor = PlanExecutor::new(AgentRegistry::new().with("ok", Arc::new(MockAgent::returning(json!(1)))));

        let report = executor.run(&pipeline, &Map::new()).await;

        assert!(report.success);
        assert_eq!(report.status_of("review"), Some(StageStatus::Completed));
        assert_eq!(report.status_of("images"), Some(StageStatus::Skipped));
        assert_eq!(report.status_of("publish"), Some(StageStatus::Completed));
    }

    #[tokio::test]
    async fn test_required_failure_drains_batch_then_stops() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: a
    agent: fail
  - id: b
    agent: slow
    parallel_with: [a]
  - id: c
    agent: ok
",
        );
        let slow = Arc::new(SlowAgent::new(Duration::from_millis(50), json!("late")));
        let executor = PlanExecutor::new(
            AgentRegistry::new()
                .with("fail", Arc::new(FailingAgent::new("boom")))
                .with("slow", slow.clone())
                .with("ok", Arc::new(MockAgent::returning(json!(1)))),
        );

        let report = executor.run(&pipeline, &Map::new()).await;

        assert!(!report.success);
        assert_eq!(report.aborted_at_batch, Some(0));
        assert_eq!(report.status_of("b"), Some(StageStatus::Completed));
        assert_eq!(report.status_of("c"), Some(StageStatus::NotRun));
        let failure = report.stage("a").unwrap().error.as_ref().unwrap();
        assert_eq!(failure.reason, "boom");
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn test_optional_failure_is_tolerated() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: seo
    agent: fail
    required: false
  - id: publish
    agent: ok
    depends_on: [seo]
",
        );
        let executor = PlanExecutor::new(
            AgentRegistry::new()
                .with("fail", Arc::new(FailingAgent::new("no")))
                .with("ok", Arc::new(MockAgent::returning(json!(true)))),
        );

        let report = executor.run(&pipeline, &Map::new()).await;

        assert!(report.success);
        assert_eq!(report.status_of("seo"), Some(StageStatus::Failed));
        assert_eq!(report.status_of("publish"), Some(StageStatus::Completed));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: flaky
    agent: flaky
    retries: 2
",
        );
        let flaky = Arc::new(FlakyAgent::new(2, json!("third time")));
        let executor = PlanExecutor::new(AgentRegistry::new().with("flaky", flaky.clone())).with_backoff(fast_backoff());

        let report = executor.run(&pipeline, &Map::new()).await;

        assert!(report.success);
        assert_eq!(report.stage("flaky").unwrap().attempts, 3);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: slow
    agent: slow
    timeout: 1
    retries: 1
",
        );
        let slow = Arc::new(SlowAgent::new(Duration::from_secs(5), json!(null)));
        let executor = PlanExecutor::new(AgentRegistry::new().with("slow", slow)).with_backoff(fast_backoff());

        tokio::time::pause();
        let report = executor.run(&pipeline, &Map::new()).await;

        let failure = report.stage("slow").unwrap().error.clone().unwrap();
        assert!(failure.timed_out);
        assert_eq!(failure.attempts, 2);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_stage() {
        let pipeline = resolve("name: p\nstages:\n  - id: a\n    agent: ghost\n");
        let report = PlanExecutor::new(AgentRegistry::new()).run(&pipeline, &Map::new()).await;
        let failure = report.stage("a").unwrap().error.as_ref().unwrap();
        assert!(failure.reason.contains("ghost"));
    }

    #[tokio::test]
    async fn test_cached_stage_invokes_agent_once() {
        let pipeline = resolve(
            r"
name: p
stages:
  - id: research
    agent: llm
    cache: true
    cache_ttl: 60
    config:
      topic: rust
",
        );
        let llm = Arc::new(MockAgent::returning(json!({"notes": [1, 2]})));
        let sink = Arc::new(CollectingEventSink::new());
        let cache = Arc::new(LayeredCache::memory_only(&crate::config::CacheConfig::default()));
        let executor = PlanExecutor::new(AgentRegistry::new().with("llm", llm.clone()))
            .with_cache(cache)
            .with_events(sink.clone());

        let first = executor.run(&pipeline, &Map::new()).await;
        let second = executor.run(&pipeline, &Map::new()).await;

        assert_eq!(llm.calls(), 1);
        assert!(!first.stage("research").unwrap().cache_hit);
        assert!(second.stage("research").unwrap().cache_hit);
        assert_eq!(second.output_of("research"), Some(&json!({"notes": [1, 2]})));
        assert_eq!(sink.of_kind(kinds::STAGE_CACHE_HIT).len(), 1);
    }

    #[tokio::test]
    async fn test_null_result_is_failure() {
        let pipeline = resolve("name: p\nstages:\n  - id: a\n    agent: null_agent\n");
        let executor =
            PlanExecutor::new(AgentRegistry::new().with("null_agent", Arc::new(MockAgent::returning(Value::Null))));
        let report = executor.run(&pipeline, &Map::new()).await;
        assert_eq!(report.status_of("a"), Some(StageStatus::Failed));
    }
}
