//! Agent pool — registry of generation backends with usage accounting
//!
//! The pool abstracts over heterogeneous backends (cloud and local), each
//! carrying a cost/latency/context-window profile. It supports single-call
//! invocation and parallel multi-backend tournaments, tracks per-model
//! usage, and sidelines backends that keep failing fatally.

pub mod client;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_sdk::{
    AgentConfig, AgentErrorKind, GenerationClient, GenerationRequest, GenerationResult,
    OrchestratorError, Result,
};

use crate::batch::execute_bounded;
use self::client::estimate_tokens;

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Process-wide bound on concurrent backend calls.
    pub max_concurrency: usize,
    /// How long a backend stays degraded after repeated fatal failures.
    pub degraded_cooldown: Duration,
    /// Consecutive fatal failures before a backend is marked degraded.
    pub fatal_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            degraded_cooldown: Duration::from_secs(30),
            fatal_threshold: 3,
        }
    }
}

struct Backend {
    config: AgentConfig,
    client: Arc<dyn GenerationClient>,
    health: Mutex<BackendHealth>,
}

#[derive(Default)]
struct BackendHealth {
    consecutive_fatal: u32,
    degraded_until: Option<Instant>,
}

/// Usage counters for one model.
#[derive(Debug, Clone, Default)]
pub struct ModelStats {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub avg_latency: Duration,
    total_latency: Duration,
}

/// Read-only snapshot of pool-wide usage.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub per_model: HashMap<String, ModelStats>,
}

/// Builds an [`AgentPool`]; backends are registered once and the pool is
/// immutable after `build`.
pub struct AgentPoolBuilder {
    backends: HashMap<String, Backend>,
    config: PoolConfig,
}

impl AgentPoolBuilder {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            backends: HashMap::new(),
            config,
        }
    }

    /// Registers a backend. Duplicate names are rejected.
    pub fn register(
        mut self,
        config: AgentConfig,
        client: Arc<dyn GenerationClient>,
    ) -> Result<Self> {
        if self.backends.contains_key(&config.name) {
            return Err(OrchestratorError::Validation(format!(
                "backend '{}' registered twice",
                config.name
            )));
        }
        self.backends.insert(
            config.name.clone(),
            Backend {
                config,
                client,
                health: Mutex::new(BackendHealth::default()),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> AgentPool {
        AgentPool {
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrency)),
            stats: RwLock::new(HashMap::new()),
            backends: Arc::new(self.backends),
            config: self.config,
        }
    }
}

/// Registry of generation backends with shared usage statistics.
pub struct AgentPool {
    backends: Arc<HashMap<String, Backend>>,
    semaphore: Arc<Semaphore>,
    stats: RwLock<HashMap<String, ModelStats>>,
    config: PoolConfig,
}

impl AgentPool {
    pub fn builder() -> AgentPoolBuilder {
        AgentPoolBuilder::new(PoolConfig::default())
    }

    /// Route a request to the named backend.
    ///
    /// Rejects prompts that exceed the backend's context window rather than
    /// silently truncating, and refuses degraded backends outright so a
    /// misconfigured provider is not hammered for the rest of the run.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let backend = self.backends.get(&request.model).ok_or_else(|| {
            OrchestratorError::Validation(format!("unknown model '{}'", request.model))
        })?;

        let estimated = estimate_tokens(&request.prompt);
        if estimated > backend.config.max_context_tokens {
            return Err(OrchestratorError::ContextOverflow {
                model: request.model.clone(),
                estimated,
                limit: backend.config.max_context_tokens,
            });
        }

        self.check_health(backend, &request.model)?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Operation("agent pool shut down".into()))?;

        let started = Instant::now();
        let outcome = backend.client.generate(request, cancel).await;
        let latency = started.elapsed();

        match outcome {
            Ok(mut result) => {
                result.latency = latency;
                result.cost_usd = backend.config.cost_for(result.tokens_in, result.tokens_out);
                self.record_success(backend, &result);
                Ok(result)
            }
            Err(err) => {
                self.record_failure(backend, &request.model, &err);
                Err(err)
            }
        }
    }

    /// Fire the request at each named backend concurrently, bounded by the
    /// pool's concurrency limit. Returns one entry per requested model, in
    /// input order; per-backend failures are recorded in place and the call
    /// itself never fails.
    pub async fn tournament(
        self: &Arc<Self>,
        request: &GenerationRequest,
        models: &[&str],
    ) -> Vec<(String, Result<GenerationResult>)> {
        self.tournament_with_cancel(request, models, &CancellationToken::new())
            .await
    }

    pub async fn tournament_with_cancel(
        self: &Arc<Self>,
        request: &GenerationRequest,
        models: &[&str],
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<GenerationResult>)> {
        let names: Vec<String> = models.iter().map(|m| m.to_string()).collect();
        let pool = self.clone();
        let base = request.clone();
        let cancel = cancel.clone();

        let results = execute_bounded(
            names.clone(),
            self.config.max_concurrency,
            move |_, model| {
                let pool = pool.clone();
                let cancel = cancel.clone();
                let mut request = base.clone();
                request.model = model;
                async move { pool.generate(&request, &cancel).await }
            },
        )
        .await;

        names.into_iter().zip(results).collect()
    }

    /// Concurrent-safe snapshot of per-model usage.
    pub fn stats(&self) -> PoolStats {
        let per_model = self
            .stats
            .read()
            .map(|map| map.clone())
            .unwrap_or_default();
        PoolStats { per_model }
    }

    /// Names of registered backends, for diagnostics.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    fn check_health(&self, backend: &Backend, model: &str) -> Result<()> {
        let health = backend
            .health
            .lock()
            .map_err(|_| OrchestratorError::Operation("backend health poisoned".into()))?;
        if let Some(until) = health.degraded_until {
            if until > Instant::now() {
                return Err(OrchestratorError::agent_fatal(
                    model,
                    format!("backend degraded for another {:?}", until - Instant::now()),
                ));
            }
        }
        Ok(())
    }

    fn record_success(&self, backend: &Backend, result: &GenerationResult) {
        if let Ok(mut health) = backend.health.lock() {
            health.consecutive_fatal = 0;
            health.degraded_until = None;
        }
        if let Ok(mut stats) = self.stats.write() {
            let entry = stats.entry(result.model.clone()).or_default();
            entry.calls += 1;
            entry.tokens_in += result.tokens_in;
            entry.tokens_out += result.tokens_out;
            entry.cost_usd += result.cost_usd;
            entry.total_latency += result.latency;
            entry.avg_latency = entry.total_latency / entry.calls as u32;
        }
        debug!(
            model = %result.model,
            tokens_in = result.tokens_in,
            tokens_out = result.tokens_out,
            "generation recorded"
        );
    }

    fn record_failure(&self, backend: &Backend, model: &str, err: &OrchestratorError) {
        // Only failures the backend itself classified as fatal count toward
        // degradation. Cancellation and oversized prompts say nothing about
        // backend health.
        if !matches!(
            err,
            OrchestratorError::Agent {
                kind: AgentErrorKind::Fatal,
                ..
            }
        ) {
            return;
        }
        if let Ok(mut health) = backend.health.lock() {
            health.consecutive_fatal += 1;
            if health.consecutive_fatal >= self.config.fatal_threshold {
                health.degraded_until = Some(Instant::now() + self.config.degraded_cooldown);
                warn!(
                    model,
                    cooldown = ?self.config.degraded_cooldown,
                    "backend marked degraded after repeated fatal failures"
                );
            }
        }
    }
}
