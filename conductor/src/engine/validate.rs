//! Submission-time workflow validation
//!
//! Everything here fails fast, before any execution begins: duplicate step
//! ids, references to unknown steps, and dependency cycles. Run-time code
//! can therefore assume the step graph is a well-formed DAG.

use std::collections::{HashMap, HashSet, VecDeque};

use conductor_sdk::{OrchestratorError, Result, Workflow};

/// Validate a workflow's step graph. Kahn's algorithm for cycle detection:
/// if a topological pass cannot consume every step, whatever remains is on
/// a cycle.
pub fn validate(workflow: &Workflow) -> Result<()> {
    if workflow.steps.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "workflow '{}' has no steps",
            workflow.name
        )));
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(OrchestratorError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    for step in &workflow.steps {
        for dep in &step.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(OrchestratorError::Dependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if dep == &step.id {
                return Err(OrchestratorError::Validation(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
        }
    }

    // In-degree per step and the reverse adjacency (dep -> dependents).
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        in_degree.insert(step.id.as_str(), step.dependencies.len());
        for dep in &step.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut consumed = 0;
    while let Some(id) = queue.pop_front() {
        consumed += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                let degree = in_degree.get_mut(child).expect("child is a known step");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if consumed != workflow.steps.len() {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        return Err(OrchestratorError::Validation(format!(
            "dependency cycle involving: {}",
            cyclic.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_sdk::StepDef;

    fn wf(steps: Vec<StepDef>) -> Workflow {
        let mut workflow = Workflow::new("test");
        workflow.steps = steps;
        workflow
    }

    #[test]
    fn test_accepts_valid_dag() {
        let workflow = wf(vec![
            StepDef::new("a", "noop"),
            StepDef::new("b", "noop"),
            StepDef::new("c", "noop").depends_on(["a", "b"]),
            StepDef::new("d", "noop").depends_on(["c"]),
        ]);
        assert!(validate(&workflow).is_ok());
    }

    #[test]
    fn test_rejects_empty_workflow() {
        let err = validate(&wf(vec![])).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let workflow = wf(vec![StepDef::new("a", "noop"), StepDef::new("a", "noop")]);
        let err = validate(&workflow).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let workflow = wf(vec![StepDef::new("a", "noop").depends_on(["ghost"])]);
        match validate(&workflow).unwrap_err() {
            OrchestratorError::Dependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected Dependency error, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_self_dependency() {
        let workflow = wf(vec![StepDef::new("a", "noop").depends_on(["a"])]);
        assert!(matches!(
            validate(&workflow).unwrap_err(),
            OrchestratorError::Validation(_)
        ));
    }

    #[test]
    fn test_rejects_cycle() {
        let workflow = wf(vec![
            StepDef::new("a", "noop").depends_on(["c"]),
            StepDef::new("b", "noop").depends_on(["a"]),
            StepDef::new("c", "noop").depends_on(["b"]),
        ]);
        match validate(&workflow).unwrap_err() {
            OrchestratorError::Validation(msg) => assert!(msg.contains("cycle")),
            other => panic!("expected Validation error, got {other:?}"),
        }
    }
}
