//! Error taxonomy shared by the engine, the agent pool and the knowledge layer

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Classification of a generation-backend failure.
///
/// Rate limits, timeouts and transient transport problems are `Retryable`
/// and fall under the engine's normal retry policy. Auth and configuration
/// problems are `Fatal`: retrying cannot help, and repeated fatal failures
/// mark the backend degraded for a cool-down window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentErrorKind {
    Retryable,
    Fatal,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentErrorKind::Retryable => write!(f, "retryable"),
            AgentErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// All failure modes of the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed workflow (duplicate step ids, cyclic dependencies).
    /// Rejected at submission, never retried.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// A step references a dependency that does not exist in the workflow.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    Dependency { step: String, dependency: String },

    /// A generation backend failed.
    #[error("agent '{model}' failed ({kind}): {message}")]
    Agent {
        model: String,
        kind: AgentErrorKind,
        message: String,
    },

    /// The prompt does not fit the backend's context window. Fatal: the
    /// pool never truncates input on the caller's behalf.
    #[error("prompt (~{estimated} tokens) exceeds context window of {limit} for '{model}'")]
    ContextOverflow {
        model: String,
        estimated: u64,
        limit: u64,
    },

    /// A step ran past its deadline. Eligible for the normal retry policy.
    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    /// Both knowledge sources failed or returned nothing usable.
    #[error("no knowledge source could answer: {0}")]
    KnowledgeUnavailable(String),

    /// Cache malfunction. Always non-fatal to callers; the router bypasses
    /// the cache and goes straight to the sources.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("unknown run id {0}")]
    RunNotFound(Uuid),

    #[error("operation '{0}' is not registered with the engine")]
    UnknownOperation(String),

    /// The run's cancellation token fired while this work was in flight.
    #[error("cancelled")]
    Cancelled,

    /// A step operation failed for a reason of its own.
    #[error("{0}")]
    Operation(String),
}

impl OrchestratorError {
    /// Whether the engine's retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Agent { kind, .. } => *kind == AgentErrorKind::Retryable,
            OrchestratorError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Shorthand for a retryable agent failure.
    pub fn agent_retryable(model: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::Agent {
            model: model.into(),
            kind: AgentErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// Shorthand for a fatal agent failure.
    pub fn agent_fatal(model: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::Agent {
            model: model.into(),
            kind: AgentErrorKind::Fatal,
            message: message.into(),
        }
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_classification() {
        assert!(OrchestratorError::agent_retryable("m", "rate limited").is_retryable());
        assert!(OrchestratorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OrchestratorError::agent_fatal("m", "bad api key").is_retryable());
        assert!(!OrchestratorError::Validation("cycle".into()).is_retryable());
        assert!(!OrchestratorError::ContextOverflow {
            model: "m".into(),
            estimated: 9000,
            limit: 4096,
        }
        .is_retryable());
    }
}
