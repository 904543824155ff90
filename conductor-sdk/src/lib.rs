//! Shared data model and collaborator interfaces for the conductor
//! orchestration core.
//!
//! This crate holds everything both the engine and external consumers need:
//! workflow/step definitions, run results, the error taxonomy, progress
//! events, and the traits the core consumes but does not implement
//! (generation backends, knowledge sources, durable state stores).

pub mod error;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use async_trait::async_trait;
pub use error::{AgentErrorKind, OrchestratorError, Result};

// ============================================================================
// Workflow definition
// ============================================================================

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Retry policy for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` means no retries.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_backoff: Duration,
    /// Cap on the backoff delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// A single schedulable operation within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique within the workflow.
    pub id: String,
    /// Name of a registered operation; resolved by the engine at dispatch.
    pub operation: String,
    /// Ids of steps whose outputs this step consumes.
    pub dependencies: Vec<String>,
    pub retry: RetryPolicy,
    /// An optional step that fails terminally does not block its dependents;
    /// they see an absent output instead.
    pub optional: bool,
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
}

impl StepDef {
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            dependencies: Vec::new(),
            retry: RetryPolicy::default(),
            optional: false,
            timeout: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A DAG of steps submitted as one unit of work. Immutable once submitted;
/// re-running means submitting a new instance with a fresh id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    /// Submission order doubles as the tie-break for simultaneously-ready
    /// steps, so runs are reproducible.
    pub steps: Vec<StepDef>,
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps: Vec::new(),
            status: WorkflowStatus::Pending,
        }
    }

    pub fn step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }
}

// ============================================================================
// Run results
// ============================================================================

/// Per-step execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }
}

/// Result of a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub state: StepState,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            state: StepState::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A failed step recorded in the run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub step_id: String,
    pub message: String,
    pub attempts: u32,
}

/// Typed run metadata with one open extension map for forward-compatible
/// additions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub models_used: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl RunMetadata {
    /// Fold one generation's usage into the run totals.
    pub fn record_generation(&mut self, model: &str, tokens_in: u64, tokens_out: u64, cost: f64) {
        self.cost_usd += cost;
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        if !self.models_used.iter().any(|m| m == model) {
            self.models_used.push(model.to_string());
        }
    }
}

/// The single accumulated result of a workflow run. Mutated only by the
/// engine that owns the run; read-only everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// Exactly one final value per completed step id.
    pub outputs: HashMap<String, serde_json::Value>,
    pub errors: Vec<StepError>,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub metadata: RunMetadata,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

// ============================================================================
// Agents
// ============================================================================

/// Where a generation backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cloud,
    Local,
}

/// Static profile of a generation backend. Registered once at pool
/// construction, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub provider: ProviderKind,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    pub max_context_tokens: u64,
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl AgentConfig {
    pub fn local(name: impl Into<String>, max_context_tokens: u64) -> Self {
        Self {
            name: name.into(),
            provider: ProviderKind::Local,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            max_context_tokens,
            endpoint: None,
            api_key: None,
        }
    }

    /// Dollar cost of one request at this backend's prices.
    pub fn cost_for(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 / 1000.0) * self.cost_per_1k_input
            + (tokens_out as f64 / 1000.0) * self.cost_per_1k_output
    }
}

/// A single generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

/// What a generation backend returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub latency: Duration,
    pub model: String,
}

// ============================================================================
// Knowledge
// ============================================================================

/// One ranked excerpt returned by a knowledge source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub origin: String,
    pub excerpt: String,
    pub relevance: f64,
}

/// Unified answer assembled by the knowledge router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub snippets: Vec<Snippet>,
    pub from_cache: bool,
}

// ============================================================================
// Progress events
// ============================================================================

/// Progress events published per run. Transport adapters subscribe and
/// forward; the core only publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepStarted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        attempts: u32,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
    },
    WorkflowCompleted {
        run_id: Uuid,
        status: WorkflowStatus,
    },
}

/// Receives progress events for forwarding to any real-time transport.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &WorkflowEvent);
}

/// Fan-out sink built on a tokio broadcast channel. Lagging or absent
/// subscribers never block the engine.
pub struct BroadcastSink {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &WorkflowEvent) {
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.tx.send(event.clone());
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// A text-generation backend. Implementations must classify failures as
/// retryable or fatal (see [`AgentErrorKind`]) and honor the cancellation
/// token by aborting in-flight network calls promptly.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult>;
}

/// A queryable provider of contextual snippets.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Stable origin label recorded on returned snippets.
    fn origin(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snippet>>;
}

/// Durable record of workflow results for recovery across restarts. The
/// engine operates in-memory and defers persistence here.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, result: &WorkflowResult) -> Result<()>;
    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowResult>>;
    async fn remove(&self, run_id: Uuid) -> Result<()>;
}
