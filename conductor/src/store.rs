//! In-memory state store
//!
//! The engine defers persistence to a [`StateStore`]; this default
//! implementation keeps results in memory with TTL-based eviction of
//! completed runs, so a long-lived process does not grow without bound.
//! A durable implementation (database, file) plugs in behind the same trait.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use uuid::Uuid;

use conductor_sdk::{async_trait, OrchestratorError, Result, StateStore, WorkflowResult};

struct StoredRun {
    result: WorkflowResult,
    stored_at: Instant,
}

/// Arena of runs keyed by id with a retention window for terminal runs.
pub struct InMemoryStateStore {
    runs: RwLock<HashMap<Uuid, StoredRun>>,
    retention: Duration,
}

impl InMemoryStateStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Drop terminal runs older than the retention window. Returns how many
    /// were evicted.
    pub fn evict_expired(&self) -> usize {
        // Nothing can be older than the retention window if the process has
        // not been up that long.
        let cutoff = match Instant::now().checked_sub(self.retention) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut runs = match self.runs.write() {
            Ok(runs) => runs,
            Err(_) => return 0,
        };
        let before = runs.len();
        runs.retain(|_, stored| stored.stored_at > cutoff);
        before - runs.len()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, result: &WorkflowResult) -> Result<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| OrchestratorError::Operation("state store poisoned".into()))?;
        runs.insert(
            result.workflow_id,
            StoredRun {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<WorkflowResult>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| OrchestratorError::Operation("state store poisoned".into()))?;
        Ok(runs.get(&run_id).map(|stored| stored.result.clone()))
    }

    async fn remove(&self, run_id: Uuid) -> Result<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| OrchestratorError::Operation("state store poisoned".into()))?;
        runs.remove(&run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_sdk::{RunMetadata, WorkflowStatus};

    fn sample_result(id: Uuid) -> WorkflowResult {
        WorkflowResult {
            workflow_id: id,
            status: WorkflowStatus::Completed,
            outputs: HashMap::new(),
            errors: Vec::new(),
            steps_completed: 0,
            steps_total: 0,
            metadata: RunMetadata::default(),
            started_at: None,
            completed_at: None,
            duration: None,
        }
    }

    #[tokio::test]
    async fn test_save_load_remove_round_trip() {
        let store = InMemoryStateStore::default();
        let id = Uuid::new_v4();

        store.save(&sample_result(id)).await.unwrap();
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, id);
        assert_eq!(loaded.status, WorkflowStatus::Completed);

        store.remove(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_honors_retention() {
        let store = InMemoryStateStore::new(Duration::from_millis(0));
        store.save(&sample_result(Uuid::new_v4())).await.unwrap();
        store.save(&sample_result(Uuid::new_v4())).await.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.evict_expired(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_unknown_run_is_none() {
        let store = InMemoryStateStore::default();
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }
}
