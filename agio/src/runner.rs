//! The run coordinator.
//!
//! [`Runner`] drives one run through its state machine: append the user
//! step, call the step executor, persist the assistant step, dispatch any
//! tool calls, persist the tool steps in call order, and loop until the
//! model stops calling tools, the step budget is exhausted, a deadline
//! elapses, or the caller cancels. All shared per-run state lives in
//! [`RunConfig`] (services) and a private loop state; `Runner` itself is
//! stateless, so concurrent runs never contend.
//!
//! Resume: when a session's tip is an assistant step with unanswered tool
//! calls, [`Runner::resume`] enters the loop at the dispatch phase with
//! exactly the missing calls, in their original order — the LLM is not
//! re-queried for that turn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{Instrument as _, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::checkpoint::{CheckpointManager, CheckpointOptions};
use crate::context::ContextBuilder;
use crate::controller::{ExecutionController, RunSignals};
use crate::dispatch::{self, DispatchContext, DispatchOptions, ToolCall};
use crate::error::{Error, Result};
use crate::event::{
    EventBus, EventPayload, EventStream, RunCompletedData, RunFailedData, RunEmitter,
    RunStartedData,
};
use crate::executor::{self, StepExecution};
use crate::provider::ChatRequest;
use crate::run::{Run, RunMetrics, RunOutcome, RunStatus, TerminationReason};
use crate::step::{Step, StepRole};
use crate::store::{SessionStore as _, SharedStore};
use tokio_util::sync::CancellationToken;

/// Services and linkage for one run.
///
/// Cheap to clone; nested child runs derive their config via the parent's
/// batch dispatch, sharing the store, controller, and bus.
#[derive(Clone)]
pub struct RunConfig {
    /// The canonical session store.
    pub store: SharedStore,
    /// The pause/cancel controller.
    pub controller: Arc<ExecutionController>,
    /// The event bus for this run tree.
    pub bus: Arc<EventBus>,
    /// Run against this session; a fresh session is created when absent.
    pub session_id: Option<String>,
    /// The parent run, for nested runnables.
    pub parent_run_id: Option<String>,
    /// Nesting depth (0 = top-level).
    pub depth: usize,
    pub(crate) parent_token: Option<CancellationToken>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("session_id", &self.session_id)
            .field("parent_run_id", &self.parent_run_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl RunConfig {
    /// Create a config with a fresh controller and bus over the given store.
    #[must_use]
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            controller: Arc::new(ExecutionController::new()),
            bus: Arc::new(EventBus::new(
                crate::config::RunnerConfig::DEFAULT_EVENT_QUEUE_SIZE,
            )),
            session_id: None,
            parent_run_id: None,
            depth: 0,
            parent_token: None,
        }
    }

    /// Run against an existing session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Share a controller across runs.
    #[must_use]
    pub fn with_controller(mut self, controller: Arc<ExecutionController>) -> Self {
        self.controller = controller;
        self
    }

    /// Share an event bus across runs.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Derive the config for a child run of `parent_run_id`.
    ///
    /// The child shares the store, controller, and bus; it gets a fresh
    /// session, `depth + 1`, and a cancellation token chained to the
    /// parent's.
    #[must_use]
    pub(crate) fn child_of(&self, parent_run_id: &str, token: &CancellationToken) -> Self {
        Self {
            store: Arc::clone(&self.store),
            controller: Arc::clone(&self.controller),
            bus: Arc::clone(&self.bus),
            session_id: None,
            parent_run_id: Some(parent_run_id.to_owned()),
            depth: self.depth + 1,
            parent_token: Some(token.clone()),
        }
    }
}

/// Handle to a run spawned with [`Runner::start`].
#[derive(Debug)]
pub struct StartedRun {
    /// The allocated run identifier.
    pub run_id: String,
    /// Bus subscription opened before the run began; sees every event of
    /// the run tree.
    pub events: EventStream,
    /// Completion handle.
    pub handle: tokio::task::JoinHandle<Result<RunOutcome>>,
}

enum RunInput {
    Query(String),
    Resume,
}

enum LoopEnd {
    Done { output: String },
    MaxSteps,
    Timeout,
    Cancelled,
}

enum IterEnd {
    Final(String),
    Continue,
}

struct LoopState {
    metrics: RunMetrics,
}

/// Stateless execution engine for [`Agent`] runs.
#[derive(Debug, Clone, Copy)]
pub struct Runner;

impl Runner {
    /// Execute a run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Model`] when the provider fails beyond the retry
    /// budget (the run record is persisted as failed), [`Error::NotFound`]
    /// for an unknown session, and store errors.
    pub async fn run(
        agent: &Agent,
        query: impl Into<String>,
        config: RunConfig,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        Self::drive(agent, RunInput::Query(query.into()), config, run_id).await
    }

    /// Spawn a run and return its id, a pre-opened event subscription, and
    /// a completion handle.
    #[must_use]
    pub fn start(agent: Arc<Agent>, query: impl Into<String>, config: RunConfig) -> StartedRun {
        let run_id = Uuid::new_v4().to_string();
        let events = config.bus.subscribe();
        let query = query.into();
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            Self::drive(&agent, RunInput::Query(query), config, task_run_id).await
        });
        StartedRun {
            run_id,
            events,
            handle,
        }
    }

    /// Resume a session whose tip is an assistant step with unanswered tool
    /// calls.
    ///
    /// Only the missing tool calls are dispatched, in their original order,
    /// after which the loop continues normally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the session has nothing pending.
    pub async fn resume(agent: &Agent, session_id: &str, config: RunConfig) -> Result<RunOutcome> {
        let mut config = config;
        config.session_id = Some(session_id.to_owned());
        let run_id = Uuid::new_v4().to_string();
        Self::drive(agent, RunInput::Resume, config, run_id).await
    }

    async fn drive(
        agent: &Agent,
        input: RunInput,
        config: RunConfig,
        run_id: String,
    ) -> Result<RunOutcome> {
        let span = info_span!(
            "run",
            run.id = %run_id,
            agent.id = %agent.id(),
            agent.model = %agent.model(),
            run.depth = config.depth,
            run.max_steps = agent.config().max_steps,
        );

        async {
            let session_id = Self::resolve_session(&config).await?;
            let signals = config
                .controller
                .register(&run_id, config.parent_token.as_ref())?;

            let result = Self::execute(agent, &input, &config, &run_id, &session_id, &signals).await;
            config.controller.deregister(&run_id);
            result
        }
        .instrument(span)
        .await
    }

    async fn resolve_session(config: &RunConfig) -> Result<String> {
        match &config.session_id {
            Some(session_id) => {
                config.store.get_session(session_id).await?;
                Ok(session_id.clone())
            }
            None => Ok(config
                .store
                .create_session(None, HashMap::new())
                .await?
                .session_id),
        }
    }

    async fn execute(
        agent: &Agent,
        input: &RunInput,
        config: &RunConfig,
        run_id: &str,
        session_id: &str,
        signals: &RunSignals,
    ) -> Result<RunOutcome> {
        let emitter = RunEmitter::new(
            Arc::clone(&config.bus),
            run_id.to_owned(),
            config.parent_run_id.clone(),
            config.depth,
        );

        let query = match input {
            RunInput::Query(query) => query.clone(),
            RunInput::Resume => String::new(),
        };
        let mut run = Run::started(
            run_id,
            session_id,
            config.parent_run_id.clone(),
            agent.id(),
            &query,
        );
        config.store.save_run(&run).await?;

        info!(session_id, "run started");
        emitter.emit(EventPayload::RunStarted {
            session_id: session_id.to_owned(),
            agent_id: agent.id().to_owned(),
            input_query: query.clone(),
            data: RunStartedData {
                session_id: session_id.to_owned(),
                ..RunStartedData::default()
            },
        });

        let pending = match input {
            RunInput::Query(query) => {
                if !query.is_empty() {
                    config
                        .store
                        .append_step(session_id, crate::step::NewStep::user(query))
                        .await?;
                }
                None
            }
            RunInput::Resume => {
                let pending = Self::pending_tool_calls(config, session_id).await?;
                if pending.is_none() {
                    let err = Error::config(format!(
                        "session '{session_id}' has no pending tool calls to resume"
                    ));
                    Self::finalize(
                        config,
                        &emitter,
                        &mut run,
                        RunMetrics::default(),
                        Err(&err),
                        String::new(),
                    )
                    .await?;
                    return Err(err);
                }
                pending
            }
        };

        let started = Instant::now();
        let mut state = LoopState {
            metrics: RunMetrics::default(),
        };

        let loop_future =
            Self::run_loop(agent, config, run_id, session_id, signals, &emitter, &mut state, pending);
        let loop_result = match agent.config().timeout_per_run {
            Some(deadline) => tokio::time::timeout(deadline, loop_future)
                .await
                .unwrap_or(Ok(LoopEnd::Timeout)),
            None => loop_future.await,
        };

        #[allow(clippy::cast_possible_truncation)]
        {
            state.metrics.duration_ms = started.elapsed().as_millis() as u64;
        }

        match loop_result {
            Ok(end) => {
                let (reason, output) = match end {
                    LoopEnd::Done { output } => (TerminationReason::Done, output),
                    LoopEnd::MaxSteps => (TerminationReason::MaxSteps, String::new()),
                    LoopEnd::Timeout => (TerminationReason::Timeout, String::new()),
                    LoopEnd::Cancelled => (TerminationReason::Cancelled, String::new()),
                };
                Self::finalize(config, &emitter, &mut run, state.metrics, Ok(reason), output).await
            }
            Err(err) => {
                Self::finalize(config, &emitter, &mut run, state.metrics, Err(&err), String::new())
                    .await?;
                Err(err)
            }
        }
    }

    /// Freeze the run record and emit the terminal event.
    async fn finalize(
        config: &RunConfig,
        emitter: &RunEmitter,
        run: &mut Run,
        metrics: RunMetrics,
        end: std::result::Result<TerminationReason, &Error>,
        output: String,
    ) -> Result<RunOutcome> {
        match end {
            Ok(reason) => {
                let status = if reason == TerminationReason::Cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Completed
                };
                run.finish(status, reason, metrics);
                config.store.save_run(run).await?;

                info!(
                    reason = %reason,
                    steps = metrics.steps,
                    input_tokens = metrics.usage.input_tokens,
                    output_tokens = metrics.usage.output_tokens,
                    "run completed"
                );
                emitter.emit(EventPayload::RunCompleted {
                    data: RunCompletedData {
                        metrics,
                        termination_reason: Some(reason),
                    },
                });

                Ok(RunOutcome {
                    run_id: run.run_id.clone(),
                    session_id: run.session_id.clone(),
                    status,
                    termination_reason: reason,
                    output,
                    metrics,
                })
            }
            Err(err) => {
                run.finish(RunStatus::Failed, TerminationReason::Error, metrics);
                config.store.save_run(run).await?;

                error!(error = %err, "run failed");
                emitter.emit(EventPayload::RunFailed {
                    data: RunFailedData {
                        error: err.to_string(),
                    },
                    error: Some(err.to_string()),
                });

                Ok(RunOutcome {
                    run_id: run.run_id.clone(),
                    session_id: run.session_id.clone(),
                    status: RunStatus::Failed,
                    termination_reason: TerminationReason::Error,
                    output,
                    metrics,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        agent: &Agent,
        config: &RunConfig,
        run_id: &str,
        session_id: &str,
        signals: &RunSignals,
        emitter: &RunEmitter,
        state: &mut LoopState,
        mut pending: Option<Vec<ToolCall>>,
    ) -> Result<LoopEnd> {
        let mut step_count = 0_usize;
        loop {
            step_count += 1;
            if step_count > agent.config().max_steps {
                state.metrics.steps = step_count - 1;
                return Ok(LoopEnd::MaxSteps);
            }
            state.metrics.steps = step_count;

            if signals.token.is_cancelled() {
                return Ok(LoopEnd::Cancelled);
            }

            // Pause checkpoint: only between iterations, never mid-stream.
            match config.controller.await_gate(run_id).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(LoopEnd::Cancelled),
                Err(err) => return Err(err),
            }

            debug!(step = step_count, "starting iteration");
            let iteration = Self::iteration(
                agent,
                config,
                run_id,
                session_id,
                signals,
                emitter,
                state,
                pending.take(),
            );
            let outcome =
                match tokio::time::timeout(agent.config().timeout_per_step, iteration).await {
                    Err(_elapsed) => return Ok(LoopEnd::Timeout),
                    Ok(Err(Error::Cancelled)) => return Ok(LoopEnd::Cancelled),
                    Ok(result) => result?,
                };

            match outcome {
                IterEnd::Final(output) => return Ok(LoopEnd::Done { output }),
                IterEnd::Continue => {}
            }
        }
    }

    /// One loop iteration: an LLM call (unless resuming into a pending
    /// batch) followed by its tool batch.
    #[allow(clippy::too_many_arguments)]
    async fn iteration(
        agent: &Agent,
        config: &RunConfig,
        run_id: &str,
        session_id: &str,
        signals: &RunSignals,
        emitter: &RunEmitter,
        state: &mut LoopState,
        pending: Option<Vec<ToolCall>>,
    ) -> Result<IterEnd> {
        let calls = if let Some(calls) = pending {
            debug!(calls = calls.len(), "resuming into pending tool batch");
            calls
        } else {
            let mut builder = ContextBuilder::new();
            if let Some(prompt) = agent.system_prompt() {
                builder = builder.with_system_prompt(prompt);
            }
            if let Some(cap) = agent.config().context_window_messages {
                builder = builder.with_max_messages(cap);
            }
            let messages = builder.build(config.store.as_ref(), session_id).await?;

            let next_sequence = config
                .store
                .get_last_step(session_id)
                .await?
                .map_or(1, |step| step.sequence + 1);

            let mut request = ChatRequest::with_messages(agent.model(), messages);
            if !agent.tools().is_empty() {
                request = request
                    .tools(agent.tools().definitions())
                    .parallel_tool_calls(agent.config().parallel_tool_calls);
            }
            if agent.config().stream {
                request = request.streaming();
            }

            let draft = executor::execute_step(&StepExecution {
                provider: agent.provider().as_ref(),
                request,
                emitter,
                store: config.store.as_ref(),
                session_id,
                step_id: next_sequence,
                max_retries: agent.config().max_retries,
                token: &signals.token,
            })
            .await?;

            state.metrics.usage += draft.usage.unwrap_or_default();

            let step = config
                .store
                .append_step(session_id, draft.into_new_step())
                .await?;
            if step.sequence != next_sequence {
                return Err(Error::invariant(format!(
                    "assistant step persisted at sequence {} but {} was announced",
                    step.sequence, next_sequence
                )));
            }
            Self::maybe_checkpoint(agent, config, run_id, &step).await;

            if !step.has_tool_calls() {
                return Ok(IterEnd::Final(step.content));
            }

            step.tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCall::new(c.id, c.name, c.arguments))
                .collect()
        };

        let ctx = DispatchContext {
            registry: agent.tools(),
            options: DispatchOptions {
                parallel: agent.config().parallel_tool_calls,
                max_parallel: agent.config().max_parallel_tool_calls,
                timeout: agent.config().timeout_per_tool,
            },
            token: signals.token.clone(),
            emitter,
            child_config: config.child_of(run_id, &signals.token),
        };
        let outcomes = dispatch::execute_batch(&ctx, &calls).await;
        state.metrics.tool_calls += outcomes.len();

        // Tool steps persist in the original tool_calls order regardless of
        // completion order.
        for outcome in outcomes {
            let step = config
                .store
                .append_step(session_id, outcome.into_new_step())
                .await?;
            Self::maybe_checkpoint(agent, config, run_id, &step).await;
        }

        Ok(IterEnd::Continue)
    }

    /// Pending tool calls at the session tip: the last assistant step's
    /// calls that have no matching tool step yet, in original order.
    async fn pending_tool_calls(
        config: &RunConfig,
        session_id: &str,
    ) -> Result<Option<Vec<ToolCall>>> {
        let steps = config.store.list_steps(session_id, None).await?;

        let Some(assistant) = steps
            .iter()
            .rev()
            .find(|s| s.role == StepRole::Assistant && s.has_tool_calls())
        else {
            return Ok(None);
        };
        // Anything after the assistant step other than its tool replies
        // means the turn already advanced.
        if steps
            .iter()
            .any(|s| s.sequence > assistant.sequence && s.role != StepRole::Tool)
        {
            return Ok(None);
        }

        let satisfied: HashSet<&str> = steps
            .iter()
            .filter(|s| s.sequence > assistant.sequence && s.role == StepRole::Tool)
            .filter_map(|s| s.tool_call_id.as_deref())
            .collect();

        let missing: Vec<ToolCall> = assistant
            .tool_calls
            .iter()
            .flatten()
            .filter(|call| !satisfied.contains(call.id.as_str()))
            .map(|call| ToolCall::new(&call.id, &call.name, &call.arguments))
            .collect();

        Ok((!missing.is_empty()).then_some(missing))
    }

    async fn maybe_checkpoint(agent: &Agent, config: &RunConfig, run_id: &str, step: &Step) {
        if agent.config().checkpoint_strategy.should_checkpoint(step) {
            let manager = CheckpointManager::new(Arc::clone(&config.store));
            let options = CheckpointOptions {
                agent_config: agent.config_descriptor(),
                ..CheckpointOptions::default()
            };
            if let Err(err) = manager
                .create_checkpoint(run_id, step.sequence, options)
                .await
            {
                warn!(run_id, sequence = step.sequence, error = %err, "automatic checkpoint failed");
            }
        }
    }
}
