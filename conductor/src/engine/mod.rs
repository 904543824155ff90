//! Workflow engine — DAG execution with a live readiness frontier
//!
//! A submitted workflow is validated once, then executed by repeatedly
//! computing the set of steps whose dependencies have reached a terminal
//! state and dispatching them onto a bounded worker pool. The frontier is
//! recomputed after every completion rather than sorted once up front:
//! step durations vary, and a newly-ready step must launch immediately
//! instead of waiting for an entire layer.
//!
//! Simultaneously-ready steps dispatch in submission order, so runs are
//! reproducible for testing. Step failures are retried per policy, cascade
//! `skipped` to dependents when terminal, and never escape as panics.

pub mod validate;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_sdk::{
    AgentErrorKind, BroadcastSink, EventSink, GenerationResult, OrchestratorError, Result,
    RetryPolicy, RunMetadata, StateStore, StepDef, StepError, StepResult, StepState, Workflow,
    WorkflowEvent, WorkflowResult, WorkflowStatus,
};

// ============================================================================
// Operations
// ============================================================================

/// Boxed future returned by a step operation.
pub type OperationFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

type OperationFn = dyn Fn(StepContext) -> OperationFuture + Send + Sync;

/// Everything a step operation gets to see: its dependency outputs, the
/// run's cancellation token, and the shared usage accumulator. The engine
/// stays domain-agnostic; operations close over whatever collaborators
/// (agent pool, knowledge router) they need.
pub struct StepContext {
    pub run_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// One entry per declared dependency. `None` means the dependency was
    /// optional and failed, so its output is absent.
    pub inputs: HashMap<String, Option<serde_json::Value>>,
    pub cancel: CancellationToken,
    metadata: Arc<std::sync::Mutex<RunMetadata>>,
}

impl StepContext {
    /// Output of a completed dependency, if present.
    pub fn input(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.inputs.get(step_id).and_then(|v| v.as_ref())
    }

    /// Fold a generation's usage into the run-wide metadata.
    pub fn record_generation(&self, result: &GenerationResult) {
        if let Ok(mut meta) = self.metadata.lock() {
            meta.record_generation(
                &result.model,
                result.tokens_in,
                result.tokens_out,
                result.cost_usd,
            );
        }
    }
}

/// Named operations resolvable from `StepDef.operation`.
#[derive(Default)]
pub struct OperationRegistry {
    ops: HashMap<String, Arc<OperationFn>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, op: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.ops
            .insert(name.into(), Arc::new(move |ctx| Box::pin(op(ctx))));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Arc<OperationFn>> {
        self.ops.get(name).cloned()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on concurrently running steps, process-wide.
    pub max_concurrency: usize,
    /// Capacity of each run's progress-event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            event_capacity: 256,
        }
    }
}

struct RunState {
    workflow: Workflow,
    results: HashMap<String, StepResult>,
    status: WorkflowStatus,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    launched: bool,
}

struct RunHandle {
    state: Mutex<RunState>,
    metadata: Arc<std::sync::Mutex<RunMetadata>>,
    cancel: CancellationToken,
    /// Woken on step completion, resume, and cancel.
    wake: Notify,
    events: BroadcastSink,
}

/// Executes workflows. One engine per process; runs multiplex their ready
/// steps onto the engine's shared worker pool.
pub struct WorkflowEngine {
    registry: Arc<OperationRegistry>,
    store: Arc<dyn StateStore>,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
    workers: Arc<Semaphore>,
    sinks: Vec<Arc<dyn EventSink>>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(registry: OperationRegistry, store: Arc<dyn StateStore>) -> Self {
        Self::with_config(registry, store, EngineConfig::default())
    }

    pub fn with_config(
        registry: OperationRegistry,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            runs: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(config.max_concurrency)),
            sinks: Vec::new(),
            config,
        }
    }

    /// Attach an additional sink receiving every run's events.
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Validate and register a workflow. Returns the run id immediately;
    /// nothing executes until [`run`](Self::run).
    pub async fn submit(&self, workflow: Workflow) -> Result<Uuid> {
        validate::validate(&workflow)?;
        for step in &workflow.steps {
            if !self.registry.contains(&step.operation) {
                return Err(OrchestratorError::UnknownOperation(step.operation.clone()));
            }
        }

        let run_id = workflow.id;
        let results = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepResult::pending(&s.id)))
            .collect();

        let handle = Arc::new(RunHandle {
            state: Mutex::new(RunState {
                workflow,
                results,
                status: WorkflowStatus::Pending,
                started_at: None,
                completed_at: None,
                launched: false,
            }),
            metadata: Arc::new(std::sync::Mutex::new(RunMetadata::default())),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            events: BroadcastSink::new(self.config.event_capacity),
        });

        self.runs.write().await.insert(run_id, handle);
        info!(%run_id, "workflow submitted");
        Ok(run_id)
    }

    /// Subscribe to a run's progress events.
    pub async fn subscribe(
        &self,
        run_id: Uuid,
    ) -> Result<tokio::sync::broadcast::Receiver<WorkflowEvent>> {
        Ok(self.handle(run_id).await?.events.subscribe())
    }

    /// Stop dispatching new ready steps; in-flight steps finish.
    pub async fn pause(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let mut st = handle.state.lock().await;
        if st.status == WorkflowStatus::Running {
            st.status = WorkflowStatus::Paused;
            info!(%run_id, "run paused");
        }
        Ok(())
    }

    /// Continue scheduling from current state; completed steps never rerun.
    pub async fn resume(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id).await?;
        {
            let mut st = handle.state.lock().await;
            if st.status == WorkflowStatus::Paused {
                st.status = WorkflowStatus::Running;
                info!(%run_id, "run resumed");
            }
        }
        handle.wake.notify_one();
        Ok(())
    }

    /// Propagate cancellation to in-flight steps and skip everything not
    /// yet started.
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let handle = self.handle(run_id).await?;
        handle.cancel.cancel();
        handle.wake.notify_one();
        info!(%run_id, "run cancelled");
        Ok(())
    }

    /// Snapshot of the run's result; partial while the run is in flight.
    pub async fn status(&self, run_id: Uuid) -> Result<WorkflowResult> {
        if let Some(handle) = self.runs.read().await.get(&run_id).cloned() {
            let st = handle.state.lock().await;
            return Ok(snapshot(&st, &handle.metadata));
        }
        // Terminal runs leave the live registry; serve them from the store.
        self.store
            .load(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Execute the run to completion and return the accumulated result.
    pub async fn run(&self, run_id: Uuid) -> Result<WorkflowResult> {
        let handle = self.handle(run_id).await?;

        {
            let mut st = handle.state.lock().await;
            if st.launched {
                return Err(OrchestratorError::Operation(format!(
                    "run {run_id} was already started; submit a new workflow instance to re-run"
                )));
            }
            st.launched = true;
            st.status = WorkflowStatus::Running;
            st.started_at = Some(Utc::now());
        }

        loop {
            let action = self.plan_iteration(&handle).await;
            match action {
                Action::Finalize => break,
                Action::Wait => {
                    if handle.cancel.is_cancelled() {
                        // Only in-flight completions can unblock us now.
                        handle.wake.notified().await;
                    } else {
                        tokio::select! {
                            _ = handle.cancel.cancelled() => {}
                            _ = handle.wake.notified() => {}
                        }
                    }
                }
                Action::Dispatch(batch) => {
                    for dispatch in batch {
                        self.dispatch_step(&handle, dispatch).await;
                    }
                }
            }
        }

        let result = self.finalize(&handle).await;
        match self.store.save(&result).await {
            // Once the store owns the terminal record the live handle is
            // dropped, keeping the run registry bounded.
            Ok(()) => {
                self.runs.write().await.remove(&run_id);
            }
            Err(e) => warn!(%run_id, error = %e, "state store rejected run result"),
        }
        Ok(result)
    }

    async fn handle(&self, run_id: Uuid) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// One pass over the run state: cascade skips, collect the ready
    /// frontier, or decide to wait/finish.
    async fn plan_iteration(&self, handle: &Arc<RunHandle>) -> Action {
        let mut st = handle.state.lock().await;

        if handle.cancel.is_cancelled() {
            let skipped = skip_unstarted(&mut st);
            for step_id in skipped {
                self.publish(
                    handle,
                    WorkflowEvent::StepSkipped {
                        run_id: st.workflow.id,
                        step_id,
                    },
                );
            }
            if any_running(&st) {
                return Action::Wait;
            }
            return Action::Finalize;
        }

        if st.status == WorkflowStatus::Paused {
            return Action::Wait;
        }

        let cascaded = apply_cascade(&mut st);
        for step_id in cascaded {
            self.publish(
                handle,
                WorkflowEvent::StepSkipped {
                    run_id: st.workflow.id,
                    step_id,
                },
            );
        }

        let ready = collect_ready(&mut st);
        if !ready.is_empty() {
            return Action::Dispatch(ready);
        }

        let any_left = st
            .results
            .values()
            .any(|r| !r.state.is_terminal());
        if any_left {
            Action::Wait
        } else {
            Action::Finalize
        }
    }

    /// Acquire a worker slot, mark the step running, and spawn its task.
    /// Marking and publishing happen here, in dispatch order, so the
    /// `step_started` sequence is deterministic.
    async fn dispatch_step(&self, handle: &Arc<RunHandle>, step: StepDef) {
        let permit = match self.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let (run_id, inputs) = {
            let mut st = handle.state.lock().await;
            if handle.cancel.is_cancelled() {
                // Cancelled while waiting for a worker; leave the step for
                // the skip pass.
                return;
            }
            if st.status == WorkflowStatus::Paused {
                // The pause landed after this step was collected; put it
                // back so resume re-collects it.
                st.results.get_mut(&step.id).expect("step is registered").state =
                    StepState::Pending;
                return;
            }
            let inputs = collect_inputs(&st, &step);
            let result = st.results.get_mut(&step.id).expect("step is registered");
            result.state = StepState::Running;
            result.attempts = 1;
            result.started_at = Some(Utc::now());
            (st.workflow.id, inputs)
        };

        self.publish(
            handle,
            WorkflowEvent::StepStarted {
                run_id,
                step_id: step.id.clone(),
                attempt: 1,
            },
        );
        debug!(%run_id, step_id = %step.id, "step dispatched");

        let op = self
            .registry
            .get(&step.operation)
            .expect("operation checked at submit");
        let handle = handle.clone();
        let sinks = self.sinks.clone();
        tokio::spawn(run_step(handle, sinks, op, step, run_id, inputs, permit));
    }

    async fn finalize(&self, handle: &Arc<RunHandle>) -> WorkflowResult {
        let mut st = handle.state.lock().await;

        let failed_required = st.workflow.steps.iter().any(|step| {
            !step.optional
                && st
                    .results
                    .get(&step.id)
                    .is_some_and(|r| r.state == StepState::Failed)
        });

        st.status = if handle.cancel.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if failed_required {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        st.completed_at = Some(Utc::now());

        let result = snapshot(&st, &handle.metadata);
        self.publish(
            handle,
            WorkflowEvent::WorkflowCompleted {
                run_id: st.workflow.id,
                status: st.status,
            },
        );
        info!(
            run_id = %st.workflow.id,
            status = ?st.status,
            completed = result.steps_completed,
            total = result.steps_total,
            "run finished"
        );
        result
    }

    fn publish(&self, handle: &Arc<RunHandle>, event: WorkflowEvent) {
        handle.events.publish(&event);
        for sink in &self.sinks {
            sink.publish(&event);
        }
    }
}

enum Action {
    Dispatch(Vec<StepDef>),
    Wait,
    Finalize,
}

// ============================================================================
// State helpers (run lock held)
// ============================================================================

/// Transitively mark skipped every pending step with a failed or skipped
/// non-optional dependency. Returns the ids marked this pass.
fn apply_cascade(st: &mut RunState) -> Vec<String> {
    let mut all_skipped = Vec::new();
    loop {
        let mut skipped_this_round = Vec::new();
        for step in &st.workflow.steps {
            let state = st.results[&step.id].state;
            if state != StepState::Pending && state != StepState::Ready {
                continue;
            }
            let blocked = step.dependencies.iter().any(|dep_id| {
                let dep_state = st.results[dep_id].state;
                let dep_optional = st
                    .workflow
                    .steps
                    .iter()
                    .find(|s| &s.id == dep_id)
                    .map(|s| s.optional)
                    .unwrap_or(false);
                !dep_optional
                    && matches!(dep_state, StepState::Failed | StepState::Skipped)
            });
            if blocked {
                skipped_this_round.push(step.id.clone());
            }
        }
        if skipped_this_round.is_empty() {
            break;
        }
        for step_id in &skipped_this_round {
            let result = st.results.get_mut(step_id).expect("step is registered");
            result.state = StepState::Skipped;
            result.finished_at = Some(Utc::now());
        }
        all_skipped.extend(skipped_this_round);
    }
    all_skipped
}

/// Pending steps whose dependencies are all terminal and satisfied, in
/// submission order. Marked `Ready` before returning.
fn collect_ready(st: &mut RunState) -> Vec<StepDef> {
    let mut ready = Vec::new();
    for step in &st.workflow.steps {
        if st.results[&step.id].state != StepState::Pending {
            continue;
        }
        let satisfied = step.dependencies.iter().all(|dep_id| {
            let dep = &st.results[dep_id];
            // A non-optional failed dep would have cascaded already; here a
            // terminal dep is either completed or an absent optional.
            dep.state.is_terminal()
        });
        if satisfied {
            ready.push(step.clone());
        }
    }
    for step in &ready {
        st.results.get_mut(&step.id).expect("step is registered").state = StepState::Ready;
    }
    ready
}

/// Dependency outputs for a step about to run. Optional deps that failed
/// contribute `None`.
fn collect_inputs(st: &RunState, step: &StepDef) -> HashMap<String, Option<serde_json::Value>> {
    step.dependencies
        .iter()
        .map(|dep_id| {
            let output = st
                .results
                .get(dep_id)
                .filter(|r| r.state == StepState::Completed)
                .and_then(|r| r.output.clone());
            (dep_id.clone(), output)
        })
        .collect()
}

fn skip_unstarted(st: &mut RunState) -> Vec<String> {
    let mut skipped = Vec::new();
    for step in &st.workflow.steps {
        let result = st.results.get_mut(&step.id).expect("step is registered");
        if matches!(result.state, StepState::Pending | StepState::Ready) {
            result.state = StepState::Skipped;
            result.finished_at = Some(Utc::now());
            skipped.push(step.id.clone());
        }
    }
    skipped
}

fn any_running(st: &RunState) -> bool {
    st.results
        .values()
        .any(|r| r.state == StepState::Running)
}

fn snapshot(st: &RunState, metadata: &Arc<std::sync::Mutex<RunMetadata>>) -> WorkflowResult {
    let outputs = st
        .results
        .values()
        .filter(|r| r.state == StepState::Completed)
        .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
        .collect();

    let errors = st
        .workflow
        .steps
        .iter()
        .filter_map(|step| {
            let r = st.results.get(&step.id)?;
            if r.state == StepState::Failed {
                Some(StepError {
                    step_id: r.step_id.clone(),
                    message: r.error.clone().unwrap_or_else(|| "unknown error".into()),
                    attempts: r.attempts,
                })
            } else {
                None
            }
        })
        .collect();

    let steps_completed = st
        .results
        .values()
        .filter(|r| r.state == StepState::Completed)
        .count();

    let duration = match (st.started_at, st.completed_at) {
        (Some(start), Some(end)) => (end - start).to_std().ok(),
        _ => None,
    };

    WorkflowResult {
        workflow_id: st.workflow.id,
        status: st.status,
        outputs,
        errors,
        steps_completed,
        steps_total: st.workflow.steps.len(),
        metadata: metadata.lock().map(|m| m.clone()).unwrap_or_default(),
        started_at: st.started_at,
        completed_at: st.completed_at,
        duration,
    }
}

// ============================================================================
// Step execution
// ============================================================================

/// Drive one step through its attempts. Runs inside its own tokio task,
/// holding one worker permit for the duration (backoff sleeps included, so
/// a flapping step cannot oversubscribe the pool by releasing mid-retry).
async fn run_step(
    handle: Arc<RunHandle>,
    sinks: Vec<Arc<dyn EventSink>>,
    op: Arc<OperationFn>,
    step: StepDef,
    run_id: Uuid,
    inputs: HashMap<String, Option<serde_json::Value>>,
    permit: OwnedSemaphorePermit,
) {
    let _permit = permit;
    let mut attempt: u32 = 1;

    let publish = |event: WorkflowEvent| {
        handle.events.publish(&event);
        for sink in &sinks {
            sink.publish(&event);
        }
    };

    loop {
        let ctx = StepContext {
            run_id,
            step_id: step.id.clone(),
            attempt,
            inputs: inputs.clone(),
            cancel: handle.cancel.clone(),
            metadata: handle.metadata.clone(),
        };

        // The operation runs in its own task so a panic is contained and
        // surfaces as a step failure.
        let mut join = tokio::spawn(op(ctx));
        let abort = join.abort_handle();
        let outcome = tokio::select! {
            _ = handle.cancel.cancelled() => {
                abort.abort();
                Err(OrchestratorError::Cancelled)
            }
            joined = await_attempt(step.timeout, &mut join) => joined,
        };

        match outcome {
            Ok(value) => {
                {
                    let mut st = handle.state.lock().await;
                    let result = st.results.get_mut(&step.id).expect("step is registered");
                    result.state = StepState::Completed;
                    result.output = Some(value);
                    result.error = None;
                    result.finished_at = Some(Utc::now());
                }
                publish(WorkflowEvent::StepCompleted {
                    run_id,
                    step_id: step.id.clone(),
                    attempts: attempt,
                });
                break;
            }
            Err(err) => {
                let retry = engine_retryable(&err) && attempt < step.retry.max_attempts;
                if retry {
                    let delay = backoff_delay(&step.retry, attempt);
                    debug!(
                        step_id = %step.id,
                        attempt,
                        ?delay,
                        error = %err,
                        "step failed, retrying"
                    );
                    tokio::select! {
                        _ = handle.cancel.cancelled() => {
                            record_failure(&handle, &step, attempt, &OrchestratorError::Cancelled)
                                .await;
                            publish(WorkflowEvent::StepFailed {
                                run_id,
                                step_id: step.id.clone(),
                                error: OrchestratorError::Cancelled.to_string(),
                                attempts: attempt,
                            });
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    {
                        let mut st = handle.state.lock().await;
                        let result =
                            st.results.get_mut(&step.id).expect("step is registered");
                        result.attempts = attempt;
                    }
                    publish(WorkflowEvent::StepStarted {
                        run_id,
                        step_id: step.id.clone(),
                        attempt,
                    });
                    continue;
                }

                record_failure(&handle, &step, attempt, &err).await;
                publish(WorkflowEvent::StepFailed {
                    run_id,
                    step_id: step.id.clone(),
                    error: err.to_string(),
                    attempts: attempt,
                });
                break;
            }
        }
    }

    handle.wake.notify_one();
}

async fn record_failure(
    handle: &Arc<RunHandle>,
    step: &StepDef,
    attempts: u32,
    err: &OrchestratorError,
) {
    let mut st = handle.state.lock().await;
    let result = st.results.get_mut(&step.id).expect("step is registered");
    result.state = StepState::Failed;
    result.error = Some(err.to_string());
    result.attempts = attempts;
    result.finished_at = Some(Utc::now());
}

async fn await_attempt(
    timeout: Option<Duration>,
    join: &mut JoinHandle<Result<serde_json::Value>>,
) -> Result<serde_json::Value> {
    let joined = match timeout {
        Some(deadline) => match tokio::time::timeout(deadline, &mut *join).await {
            Ok(joined) => joined,
            Err(_) => {
                join.abort();
                return Err(OrchestratorError::Timeout(deadline));
            }
        },
        None => (&mut *join).await,
    };

    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(OrchestratorError::Operation(
            "step operation panicked".into(),
        )),
        Err(_) => Err(OrchestratorError::Cancelled),
    }
}

/// Whether the engine's retry policy applies. Generic operation failures
/// and classified-retryable errors are retried; fatal classifications,
/// overflow, and cancellation are terminal immediately.
fn engine_retryable(err: &OrchestratorError) -> bool {
    !matches!(
        err,
        OrchestratorError::Agent {
            kind: AgentErrorKind::Fatal,
            ..
        } | OrchestratorError::ContextOverflow { .. }
            | OrchestratorError::Cancelled
            | OrchestratorError::Validation(_)
            | OrchestratorError::Dependency { .. }
            | OrchestratorError::UnknownOperation(_)
    )
}

/// Exponential backoff capped at `max_backoff`, jittered by up to 20% so
/// simultaneous retries do not stampede a recovering backend.
fn backoff_delay(policy: &RetryPolicy, completed_attempts: u32) -> Duration {
    let exp = policy
        .base_backoff
        .as_millis()
        .saturating_mul(1u128 << (completed_attempts - 1).min(32));
    let capped = exp.min(policy.max_backoff.as_millis()) as f64;
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped * jitter) as u64)
}
