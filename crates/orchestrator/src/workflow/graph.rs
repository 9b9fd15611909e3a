//! Dependency graph resolution.
//!
//! Blueprints are validated once, at template registration, so a cyclic or
//! dangling dependency can never reach runtime scheduling. At runtime the
//! ready set is a pure function over a snapshot of step statuses.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::registry::StepBlueprint;
use crate::store::{StepStatus, WorkflowStep};
use crate::{Error, Result};

/// Validate a template's dependency declarations: every referenced order must
/// exist, orders must be unique, and the graph must be acyclic.
pub fn validate_blueprints(steps: &[StepBlueprint]) -> Result<()> {
    let mut indices: HashMap<u32, NodeIndex> = HashMap::new();
    let mut graph: DiGraph<u32, ()> = DiGraph::new();

    for step in steps {
        if indices.insert(step.order, graph.add_node(step.order)).is_some() {
            return Err(Error::Validation(format!(
                "duplicate step order {} in template",
                step.order
            )));
        }
    }

    for step in steps {
        let from = indices[&step.order];
        for dep in &step.depends_on {
            let to = *indices.get(dep).ok_or_else(|| {
                Error::Validation(format!(
                    "step '{}' depends on unknown step order {}",
                    step.name, dep
                ))
            })?;
            // Edge from dependency to dependent: execution order.
            graph.add_edge(to, from, ());
        }
    }

    let names: HashMap<u32, &str> = steps.iter().map(|s| (s.order, s.name.as_str())).collect();
    let mut offending: Vec<String> = Vec::new();
    for scc in tarjan_scc(&graph) {
        let cyclic = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if cyclic {
            for node in scc {
                offending.push(names[&graph[node]].to_string());
            }
        }
    }

    if offending.is_empty() {
        Ok(())
    } else {
        offending.sort();
        Err(Error::CyclicDependency { steps: offending })
    }
}

/// Steps whose dependencies are all satisfied and that are still pending.
/// Pure snapshot function: no side effects, no I/O.
pub fn ready_set(steps: &[WorkflowStep]) -> Vec<Uuid> {
    let satisfied: HashSet<Uuid> = steps
        .iter()
        .filter(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        .map(|s| s.id)
        .collect();

    steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| s.depends_on.iter().all(|dep| satisfied.contains(dep)))
        .map(|s| s.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepBlueprint;
    use crate::store::StepType;
    use chrono::Utc;

    fn blueprint(order: u32, name: &str, deps: &[u32]) -> StepBlueprint {
        StepBlueprint {
            order,
            name: name.to_string(),
            step_type: StepType::Manual,
            stage: "stage".to_string(),
            depends_on: deps.to_vec(),
            integration: None,
            default_assignee: None,
            due_in_days: None,
            max_retries: None,
        }
    }

    fn step(id: Uuid, deps: Vec<Uuid>, status: StepStatus) -> WorkflowStep {
        WorkflowStep {
            id,
            workflow_id: Uuid::new_v4(),
            step_order: 1,
            name: "step".to_string(),
            step_type: StepType::Manual,
            stage: "stage".to_string(),
            status,
            depends_on: deps,
            assigned_to: None,
            integration: None,
            max_retries: None,
            due_date: None,
            started_at: None,
            completed_at: None,
            completed_by: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn accepts_a_linear_chain() {
        let steps = vec![
            blueprint(1, "a", &[]),
            blueprint(2, "b", &[1]),
            blueprint(3, "c", &[1, 2]),
        ];
        assert!(validate_blueprints(&steps).is_ok());
    }

    #[test]
    fn rejects_a_two_step_cycle_naming_both_steps() {
        let steps = vec![blueprint(1, "a", &[2]), blueprint(2, "b", &[1])];
        match validate_blueprints(&steps) {
            Err(Error::CyclicDependency { steps }) => {
                assert_eq!(steps, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn rejects_a_self_dependency() {
        let steps = vec![blueprint(1, "a", &[1])];
        assert!(matches!(
            validate_blueprints(&steps),
            Err(Error::CyclicDependency { .. })
        ));
    }

    #[test]
    fn rejects_unknown_dependency_reference() {
        let steps = vec![blueprint(1, "a", &[9])];
        assert!(matches!(
            validate_blueprints(&steps),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn ready_set_walks_the_chain() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        // A(no deps), B(dep A), C(dep A,B)
        let mut steps = vec![
            step(a, vec![], StepStatus::Pending),
            step(b, vec![a], StepStatus::Pending),
            step(c, vec![a, b], StepStatus::Pending),
        ];
        assert_eq!(ready_set(&steps), vec![a]);

        steps[0].status = StepStatus::Completed;
        assert_eq!(ready_set(&steps), vec![b]);

        steps[1].status = StepStatus::Completed;
        assert_eq!(ready_set(&steps), vec![c]);
    }

    #[test]
    fn skipped_dependencies_count_as_satisfied() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let steps = vec![
            step(a, vec![], StepStatus::Skipped),
            step(b, vec![a], StepStatus::Pending),
        ];
        assert_eq!(ready_set(&steps), vec![b]);
    }

    #[test]
    fn blocked_and_in_progress_steps_are_not_ready() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let steps = vec![
            step(a, vec![], StepStatus::Blocked),
            step(b, vec![], StepStatus::InProgress),
        ];
        assert!(ready_set(&steps).is_empty());
    }

}
