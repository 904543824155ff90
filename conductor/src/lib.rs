//! Conductor — orchestration core for multi-agent pipelines
//!
//! Three cooperating subsystems:
//!
//! - [`engine`]: dependency-graph workflow execution with retries,
//!   cancellation, and progress events
//! - [`agents`]: a pool of generation backends with usage accounting and
//!   parallel tournaments
//! - [`knowledge`]: query routing across knowledge sources with a TTL cache
//!
//! Shared types and the collaborator traits live in `conductor-sdk` so
//! alternative backends and stores can be implemented out of tree.

pub mod agents;
pub mod batch;
pub mod engine;
pub mod knowledge;
pub mod store;

pub use agents::{AgentPool, AgentPoolBuilder, PoolConfig, PoolStats};
pub use engine::{EngineConfig, OperationRegistry, StepContext, WorkflowEngine};
pub use knowledge::{KeywordClassifier, KnowledgeRouter, QueryRoute, RouterConfig};
pub use store::InMemoryStateStore;
