#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast;

use conductor::{InMemoryStateStore, OperationRegistry, WorkflowEngine};
use conductor_sdk::WorkflowEvent;

pub fn engine_with(registry: OperationRegistry) -> (Arc<WorkflowEngine>, Arc<InMemoryStateStore>) {
    let store = Arc::new(InMemoryStateStore::default());
    let engine = Arc::new(WorkflowEngine::new(registry, store.clone()));
    (engine, store)
}

/// Records labelled timestamps from inside operations so tests can assert
/// on invocation order and counts.
#[derive(Clone, Default)]
pub struct Recorder {
    marks: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, label: impl Into<String>) {
        if let Ok(mut marks) = self.marks.lock() {
            marks.push((label.into(), Instant::now()));
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.marks
            .lock()
            .map(|marks| marks.iter().map(|(l, _)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// First timestamp recorded under `label`.
    pub fn time_of(&self, label: &str) -> Option<Instant> {
        self.marks
            .lock()
            .ok()?
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, t)| *t)
    }

    pub fn count(&self, label: &str) -> usize {
        self.marks
            .lock()
            .map(|marks| marks.iter().filter(|(l, _)| l == label).count())
            .unwrap_or(0)
    }
}

/// Drain everything already published on the run's event channel.
pub fn drain_events(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
