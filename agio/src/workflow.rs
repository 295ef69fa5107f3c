//! Composite runnables: pipeline, parallel, and loop workflows.
//!
//! A [`Runnable`] is anything with a `(query, config) → run` interface: an
//! agent, or one of the composites here. Every stage, branch, and iteration
//! executes as a full child run — its own run record and session, its
//! `parent_run_id` set to the workflow's wrapper run, its depth incremented
//! — emitting `run_*` events on the same bus alongside the workflow's
//! wrapper events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::controller::RunSignals;
use crate::error::{Error, Result};
use crate::event::{
    EventPayload, RunCompletedData, RunEmitter, RunFailedData, RunStartedData,
};
use crate::run::{Run, RunMetrics, RunOutcome, RunStatus, TerminationReason};
use crate::runner::RunConfig;
use crate::store::SessionStore as _;

/// Anything that can execute a query against a session as one run.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Stable identifier; also the tool name when registered as a tool.
    fn id(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute one run to its terminal state.
    ///
    /// # Errors
    ///
    /// Returns the run's fatal error (model or invariant failure); normal
    /// terminals (done, max steps, timeout, cancelled) are `Ok` outcomes.
    async fn run(&self, query: &str, config: RunConfig) -> Result<RunOutcome>;
}

enum WorkflowEnd {
    Done,
    Cancelled,
    Failed(Error),
}

/// Shared wrapper-run bookkeeping for the three composites.
struct WorkflowRun {
    config: RunConfig,
    run_id: String,
    signals: RunSignals,
    emitter: RunEmitter,
    run: Run,
    metrics: RunMetrics,
    started: Instant,
}

impl WorkflowRun {
    async fn begin(
        config: RunConfig,
        workflow_id: &str,
        query: &str,
        workflow_type: &str,
        total_stages: Option<usize>,
        branch_ids: Option<Vec<String>>,
    ) -> Result<Self> {
        let session_id = match &config.session_id {
            Some(session_id) => {
                config.store.get_session(session_id).await?;
                session_id.clone()
            }
            None => {
                let mut metadata = HashMap::new();
                metadata.insert(
                    "workflow_type".to_owned(),
                    Value::String(workflow_type.to_owned()),
                );
                config
                    .store
                    .create_session(None, metadata)
                    .await?
                    .session_id
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let signals = config
            .controller
            .register(&run_id, config.parent_token.as_ref())?;
        let emitter = RunEmitter::new(
            Arc::clone(&config.bus),
            run_id.clone(),
            config.parent_run_id.clone(),
            config.depth,
        );

        let run = Run::started(
            &run_id,
            &session_id,
            config.parent_run_id.clone(),
            workflow_id,
            query,
        );
        config.store.save_run(&run).await?;

        info!(workflow = workflow_id, kind = workflow_type, run_id = %run_id, "workflow run started");
        emitter.emit(EventPayload::RunStarted {
            session_id: session_id.clone(),
            agent_id: workflow_id.to_owned(),
            input_query: query.to_owned(),
            data: RunStartedData {
                session_id,
                workflow_type: Some(workflow_type.to_owned()),
                total_stages,
                branch_ids,
            },
        });

        Ok(Self {
            config,
            run_id,
            signals,
            emitter,
            run,
            metrics: RunMetrics::default(),
            started: Instant::now(),
        })
    }

    fn child_config(&self) -> RunConfig {
        self.config.child_of(&self.run_id, &self.signals.token)
    }

    fn absorb(&mut self, metrics: &RunMetrics) {
        self.metrics.steps += metrics.steps;
        self.metrics.tool_calls += metrics.tool_calls;
        self.metrics.usage += metrics.usage;
    }

    async fn finish(mut self, end: WorkflowEnd, output: String) -> Result<RunOutcome> {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.metrics.duration_ms = self.started.elapsed().as_millis() as u64;
        }

        let result = match end {
            WorkflowEnd::Done | WorkflowEnd::Cancelled => {
                let (status, reason) = if matches!(end, WorkflowEnd::Done) {
                    (RunStatus::Completed, TerminationReason::Done)
                } else {
                    (RunStatus::Cancelled, TerminationReason::Cancelled)
                };
                self.run.finish(status, reason, self.metrics);
                self.config.store.save_run(&self.run).await?;
                self.emitter.emit(EventPayload::RunCompleted {
                    data: RunCompletedData {
                        metrics: self.metrics,
                        termination_reason: Some(reason),
                    },
                });
                Ok(RunOutcome {
                    run_id: self.run.run_id.clone(),
                    session_id: self.run.session_id.clone(),
                    status,
                    termination_reason: reason,
                    output,
                    metrics: self.metrics,
                })
            }
            WorkflowEnd::Failed(err) => {
                self.run
                    .finish(RunStatus::Failed, TerminationReason::Error, self.metrics);
                self.config.store.save_run(&self.run).await?;
                error!(run_id = %self.run.run_id, error = %err, "workflow run failed");
                self.emitter.emit(EventPayload::RunFailed {
                    data: RunFailedData {
                        error: err.to_string(),
                    },
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        };

        self.config.controller.deregister(&self.run_id);
        result
    }
}

/// Sequential stages: each stage's output string becomes the next stage's
/// input query.
pub struct Pipeline {
    id: String,
    description: String,
    stages: Vec<Arc<dyn Runnable>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            stages: Vec::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.stages.push(runnable);
        self
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn skip_rest(&self, wf: &WorkflowRun, from: usize, reason: &str) {
        for (index, stage) in self.stages.iter().enumerate().skip(from) {
            wf.emitter.emit(EventPayload::StageSkipped {
                stage: index,
                name: stage.id().to_owned(),
                reason: reason.to_owned(),
            });
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("stages", &self.stages.iter().map(|s| s.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Runnable for Pipeline {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, query: &str, config: RunConfig) -> Result<RunOutcome> {
        if self.stages.is_empty() {
            return Err(Error::config(format!("pipeline '{}' has no stages", self.id)));
        }

        let mut wf = WorkflowRun::begin(
            config,
            &self.id,
            query,
            "pipeline",
            Some(self.stages.len()),
            None,
        )
        .await?;

        let mut output = query.to_owned();
        let mut end = WorkflowEnd::Done;

        for (index, stage) in self.stages.iter().enumerate() {
            if wf.signals.token.is_cancelled() {
                self.skip_rest(&wf, index, "run cancelled");
                end = WorkflowEnd::Cancelled;
                break;
            }

            wf.emitter.emit(EventPayload::StageStarted {
                stage: index,
                name: stage.id().to_owned(),
            });

            match stage.run(&output, wf.child_config()).await {
                Ok(outcome) if outcome.status == RunStatus::Completed => {
                    wf.absorb(&outcome.metrics);
                    wf.emitter.emit(EventPayload::StageCompleted {
                        stage: index,
                        name: stage.id().to_owned(),
                        output: outcome.output.clone(),
                    });
                    output = outcome.output;
                }
                Ok(outcome) if outcome.status == RunStatus::Cancelled => {
                    wf.absorb(&outcome.metrics);
                    self.skip_rest(&wf, index + 1, "run cancelled");
                    end = WorkflowEnd::Cancelled;
                    break;
                }
                Ok(outcome) => {
                    wf.absorb(&outcome.metrics);
                    self.skip_rest(&wf, index + 1, "previous stage failed");
                    end = WorkflowEnd::Failed(Error::model(format!(
                        "stage '{}' ended with status {}",
                        stage.id(),
                        outcome.status
                    )));
                    break;
                }
                Err(err) => {
                    self.skip_rest(&wf, index + 1, "previous stage failed");
                    end = WorkflowEnd::Failed(err);
                    break;
                }
            }
        }

        wf.finish(end, output).await
    }
}

/// Concurrent fan-out: every branch receives the same query; outputs are
/// gathered in branch order into a JSON array string.
pub struct ParallelWorkflow {
    id: String,
    description: String,
    branches: Vec<Arc<dyn Runnable>>,
}

impl ParallelWorkflow {
    /// Create an empty parallel workflow.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            branches: Vec::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a branch.
    #[must_use]
    pub fn branch(mut self, runnable: Arc<dyn Runnable>) -> Self {
        self.branches.push(runnable);
        self
    }
}

impl std::fmt::Debug for ParallelWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelWorkflow")
            .field("id", &self.id)
            .field(
                "branches",
                &self.branches.iter().map(|b| b.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl Runnable for ParallelWorkflow {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, query: &str, config: RunConfig) -> Result<RunOutcome> {
        if self.branches.is_empty() {
            return Err(Error::config(format!(
                "parallel workflow '{}' has no branches",
                self.id
            )));
        }

        let branch_ids: Vec<String> = self
            .branches
            .iter()
            .enumerate()
            .map(|(index, branch)| format!("{}-{index}", branch.id()))
            .collect();

        let mut wf = WorkflowRun::begin(
            config,
            &self.id,
            query,
            "parallel",
            None,
            Some(branch_ids.clone()),
        )
        .await?;

        let futures = self.branches.iter().zip(&branch_ids).map(|(branch, branch_id)| {
            let child = wf.child_config();
            let emitter = wf.emitter.clone();
            async move {
                emitter.emit(EventPayload::BranchStarted {
                    branch_id: branch_id.clone(),
                });
                let result = branch.run(query, child).await;
                let is_success =
                    matches!(&result, Ok(outcome) if outcome.status == RunStatus::Completed);
                emitter.emit(EventPayload::BranchCompleted {
                    branch_id: branch_id.clone(),
                    is_success,
                });
                result
            }
        });
        let results = join_all(futures).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut end = WorkflowEnd::Done;
        for result in results {
            match result {
                Ok(outcome) if outcome.status == RunStatus::Completed => {
                    wf.absorb(&outcome.metrics);
                    outputs.push(outcome.output);
                }
                Ok(outcome) if outcome.status == RunStatus::Cancelled => {
                    wf.absorb(&outcome.metrics);
                    if matches!(end, WorkflowEnd::Done) {
                        end = WorkflowEnd::Cancelled;
                    }
                }
                Ok(outcome) => {
                    wf.absorb(&outcome.metrics);
                    end = WorkflowEnd::Failed(Error::model(format!(
                        "branch ended with status {}",
                        outcome.status
                    )));
                }
                Err(err) => {
                    end = WorkflowEnd::Failed(err);
                }
            }
        }

        let output = serde_json::to_string(&outputs)?;
        wf.finish(end, output).await
    }
}

/// Predicate over a loop iteration's output.
pub type LoopPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Bounded iteration: the body runs up to `max_iterations` times, each
/// iteration feeding its output into the next, stopping early when the
/// predicate is satisfied.
pub struct LoopWorkflow {
    id: String,
    description: String,
    body: Arc<dyn Runnable>,
    max_iterations: usize,
    until: Option<LoopPredicate>,
}

impl LoopWorkflow {
    /// Create a loop over `body` bounded by `max_iterations`.
    #[must_use]
    pub fn new(id: impl Into<String>, body: Arc<dyn Runnable>, max_iterations: usize) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            body,
            max_iterations,
            until: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Stop as soon as the predicate over the iteration output holds.
    #[must_use]
    pub fn until(mut self, predicate: LoopPredicate) -> Self {
        self.until = Some(predicate);
        self
    }
}

impl std::fmt::Debug for LoopWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopWorkflow")
            .field("id", &self.id)
            .field("body", &self.body.id())
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runnable for LoopWorkflow {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, query: &str, config: RunConfig) -> Result<RunOutcome> {
        if self.max_iterations == 0 {
            return Err(Error::config(format!(
                "loop workflow '{}' must allow at least one iteration",
                self.id
            )));
        }

        let mut wf = WorkflowRun::begin(config, &self.id, query, "loop", None, None).await?;

        let mut output = query.to_owned();
        let mut end = WorkflowEnd::Done;

        for iteration in 1..=self.max_iterations {
            if wf.signals.token.is_cancelled() {
                end = WorkflowEnd::Cancelled;
                break;
            }

            wf.emitter
                .emit(EventPayload::IterationStarted { iteration });

            match self.body.run(&output, wf.child_config()).await {
                Ok(outcome) if outcome.status == RunStatus::Completed => {
                    wf.absorb(&outcome.metrics);
                    output = outcome.output;
                    let satisfied = self.until.as_ref().is_some_and(|p| p(&output));
                    wf.emitter.emit(EventPayload::IterationCompleted {
                        iteration,
                        satisfied,
                    });
                    if satisfied {
                        break;
                    }
                }
                Ok(outcome) if outcome.status == RunStatus::Cancelled => {
                    wf.absorb(&outcome.metrics);
                    end = WorkflowEnd::Cancelled;
                    break;
                }
                Ok(outcome) => {
                    wf.absorb(&outcome.metrics);
                    end = WorkflowEnd::Failed(Error::model(format!(
                        "loop body ended with status {}",
                        outcome.status
                    )));
                    break;
                }
                Err(err) => {
                    end = WorkflowEnd::Failed(err);
                    break;
                }
            }
        }

        wf.finish(end, output).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::event::EventBus;
    use crate::provider::mock::{ScriptedProvider, ScriptedTurn};
    use crate::store::memory::MemoryStore;
    use crate::store::{RunFilter, SessionStore as _, SharedStore};
    use futures::StreamExt as _;

    fn agent(id: &str, replies: Vec<&str>) -> Arc<Agent> {
        let turns = replies.into_iter().map(ScriptedTurn::text).collect();
        Arc::new(
            Agent::builder(id)
                .model("mock")
                .provider(Arc::new(ScriptedProvider::new(turns)))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn pipeline_chains_stage_outputs() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = RunConfig::new(Arc::clone(&store));
        let bus = Arc::clone(&config.bus);
        let mut events = bus.subscribe();

        let pipeline = Pipeline::new("draft-then-polish")
            .stage(agent("draft", vec!["rough draft"]))
            .stage(agent("polish", vec!["polished text"]));
        assert_eq!(pipeline.len(), 2);

        let outcome = pipeline.run("write a poem", config).await.unwrap();
        assert_eq!(outcome.output, "polished text");
        assert!(outcome.is_done());

        // Wrapper events: run_started carries the workflow shape; stages
        // bracket each child run.
        let mut kinds = Vec::new();
        while let Some(event) = events.next().await {
            kinds.push(event.kind());
            if event.kind() == "run_completed" && event.depth == 0 {
                break;
            }
        }
        assert_eq!(kinds.first().copied(), Some("run_started"));
        assert!(kinds.contains(&"stage_started"));
        assert!(kinds.contains(&"stage_completed"));

        // Each stage produced a child run linked to the wrapper.
        let runs = store.list_runs(&RunFilter::any()).await.unwrap();
        assert_eq!(runs.len(), 3);
        let children: Vec<_> = runs
            .iter()
            .filter(|r| r.parent_run_id.as_deref() == Some(outcome.run_id.as_str()))
            .collect();
        assert_eq!(children.len(), 2);
        // The second stage's input was the first stage's output.
        assert!(children.iter().any(|r| r.input_query == "rough draft"));
    }

    #[tokio::test]
    async fn pipeline_failure_skips_remaining_stages() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = RunConfig::new(Arc::clone(&store));
        let bus = Arc::clone(&config.bus);
        let mut events = bus.subscribe();

        let failing = Arc::new(
            Agent::builder("broken")
                .model("mock")
                .provider(Arc::new(ScriptedProvider::new(vec![ScriptedTurn::failing(
                    "provider down",
                )])))
                .build()
                .unwrap(),
        );
        let pipeline = Pipeline::new("doomed")
            .stage(failing)
            .stage(agent("never-runs", vec!["unused"]));

        let err = pipeline.run("go", config).await.unwrap_err();
        assert!(matches!(err, Error::Model { .. }));

        let mut saw_skip = false;
        let mut saw_failed = false;
        while let Some(event) = events.next().await {
            match event.kind() {
                "stage_skipped" => saw_skip = true,
                "run_failed" if event.depth == 0 => {
                    saw_failed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_skip);
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn parallel_gathers_branch_outputs_in_order() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = RunConfig::new(Arc::clone(&store));

        let workflow = ParallelWorkflow::new("fan-out")
            .branch(agent("a", vec!["alpha"]))
            .branch(agent("b", vec!["beta"]));

        let outcome = workflow.run("same question", config).await.unwrap();
        let outputs: Vec<String> = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(outputs, vec!["alpha", "beta"]);

        let runs = store.list_runs(&RunFilter::any()).await.unwrap();
        // One wrapper plus two branch runs, each in its own session.
        assert_eq!(runs.len(), 3);
        let sessions: std::collections::HashSet<_> =
            runs.iter().map(|r| r.session_id.clone()).collect();
        assert_eq!(sessions.len(), 3);
    }

    #[tokio::test]
    async fn loop_stops_when_the_predicate_holds() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = RunConfig::new(Arc::clone(&store));
        let bus = Arc::clone(&config.bus);
        let mut events = bus.subscribe();

        let body = agent("refiner", vec!["almost", "done"]);
        let workflow = LoopWorkflow::new("refine", body, 5)
            .until(Arc::new(|output: &str| output == "done"));

        let outcome = workflow.run("start", config).await.unwrap();
        assert_eq!(outcome.output, "done");

        let mut iterations = Vec::new();
        while let Some(event) = events.next().await {
            if let EventPayload::IterationCompleted { iteration, satisfied } = event.payload {
                iterations.push((iteration, satisfied));
            }
            if event.kind() == "run_completed" && event.depth == 0 {
                break;
            }
        }
        assert_eq!(iterations, vec![(1, false), (2, true)]);
    }

    #[tokio::test]
    async fn empty_composites_are_config_errors() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new("empty");
        assert!(pipeline.is_empty());
        let err = pipeline
            .run("x", RunConfig::new(Arc::clone(&store)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = ParallelWorkflow::new("empty")
            .run("x", RunConfig::new(store))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
