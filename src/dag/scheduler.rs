//! Wave batching and cycle detection over the task dependency graph.
//!
//! Batch `k` contains every task whose dependencies are all satisfied by
//! batches `0..k`, the greedy maximum-parallelism schedule. Ties inside a
//! batch break lexicographically by task id so the same input always yields
//! the same batching.

use super::parser::PlannedTask;
use crate::errors::{QuorumError, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Compute parallel waves over `(task id → dependency ids)`.
pub fn compute_batches(deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<Vec<String>>> {
    for (task, dependencies) in deps {
        for dependency in dependencies {
            if !deps.contains_key(dependency) {
                return Err(QuorumError::DanglingDependency {
                    task: task.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut remaining: BTreeSet<&str> = deps.keys().map(String::as_str).collect();
    let mut done: HashSet<&str> = HashSet::new();
    let mut batches: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        // BTreeSet iteration keeps the lexicographic tie-break for free.
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| deps[*id].iter().all(|d| done.contains(d.as_str())))
            .collect();
        if ready.is_empty() {
            let cycle = offending_set(deps, &remaining);
            return Err(QuorumError::CyclicDependency { cycle });
        }
        for id in &ready {
            remaining.remove(id);
            done.insert(id);
        }
        batches.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(batches)
}

/// Batch planned tasks (plan-phase entry point).
pub fn batch_planned(tasks: &[PlannedTask]) -> Result<Vec<Vec<String>>> {
    let deps: BTreeMap<String, Vec<String>> = tasks
        .iter()
        .map(|t| (t.id.clone(), t.depends_on.clone()))
        .collect();
    compute_batches(&deps)
}

/// Trim nodes that merely depend on a cycle, leaving the minimal offending
/// set: within the stalled subgraph, repeatedly drop nodes nothing else in
/// the subgraph depends on.
fn offending_set(deps: &BTreeMap<String, Vec<String>>, stalled: &BTreeSet<&str>) -> Vec<String> {
    let mut members: BTreeSet<&str> = stalled.clone();
    loop {
        let depended_on: HashSet<&str> = members
            .iter()
            .flat_map(|id| deps[*id].iter())
            .map(String::as_str)
            .filter(|d| members.contains(d))
            .collect();
        let removable: Vec<&str> = members
            .iter()
            .copied()
            .filter(|id| !depended_on.contains(id))
            .collect();
        if removable.is_empty() || removable.len() == members.len() {
            break;
        }
        for id in removable {
            members.remove(id);
        }
    }
    members.into_iter().map(str::to_string).collect()
}

/// Human-readable execution graph for `plan-phase/execution-graph.md`.
pub fn render_execution_graph(tasks: &[PlannedTask], batches: &[Vec<String>]) -> String {
    let mut out = String::from("# Execution graph\n\n");
    for (index, batch) in batches.iter().enumerate() {
        out.push_str(&format!("## Batch {} (parallel)\n\n", index + 1));
        for id in batch {
            let task = tasks.iter().find(|t| &t.id == id);
            let (name, agent, deps) = task
                .map(|t| (t.name.as_str(), t.agent.as_str(), t.depends_on.join(", ")))
                .unwrap_or((id.as_str(), "?", String::new()));
            if deps.is_empty() {
                out.push_str(&format!("- `{id}` {name} (agent: {agent})\n"));
            } else {
                out.push_str(&format!("- `{id}` {name} (agent: {agent}, after: {deps})\n"));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_batches_respect_dependencies() {
        let deps = graph(&[
            ("t1", &[]),
            ("t2", &["t1"]),
            ("t3", &["t1"]),
            ("t4", &["t2", "t3"]),
        ]);
        let batches = compute_batches(&deps).unwrap();
        assert_eq!(
            batches,
            vec![
                vec!["t1".to_string()],
                vec!["t2".to_string(), "t3".to_string()],
                vec!["t4".to_string()],
            ]
        );
        // Property: every dependency lives in an earlier batch; no batch is
        // empty.
        let mut seen: HashSet<&str> = HashSet::new();
        for batch in &batches {
            assert!(!batch.is_empty());
            for id in batch {
                for dep in &deps[id] {
                    assert!(seen.contains(dep.as_str()), "{dep} must precede {id}");
                }
            }
            for id in batch {
                seen.insert(id);
            }
        }
    }

    #[test]
    fn test_deterministic_lexicographic_tie_break() {
        let deps = graph(&[("b", &[]), ("a", &[]), ("c", &[])]);
        let batches = compute_batches(&deps).unwrap();
        assert_eq!(batches, vec![vec!["a".to_string(), "b".into(), "c".into()]]);
    }

    #[test]
    fn test_cycle_detected_names_offenders() {
        let deps = graph(&[("t1", &["t3"]), ("t2", &["t1"]), ("t3", &["t2"])]);
        match compute_batches(&deps).unwrap_err() {
            QuorumError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["t1", "t2", "t3"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_set_excludes_mere_dependents() {
        // t4 depends on the cycle but is not part of it.
        let deps = graph(&[
            ("t1", &["t2"]),
            ("t2", &["t1"]),
            ("t4", &["t2"]),
        ]);
        match compute_batches(&deps).unwrap_err() {
            QuorumError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["t1", "t2"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let deps = graph(&[("t1", &["t1"])]);
        assert!(matches!(
            compute_batches(&deps),
            Err(QuorumError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let deps = graph(&[("t1", &["ghost"])]);
        match compute_batches(&deps).unwrap_err() {
            QuorumError::DanglingDependency { task, dependency } => {
                assert_eq!(task, "t1");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected DanglingDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_graph_is_no_batches() {
        let batches = compute_batches(&BTreeMap::new()).unwrap();
        assert!(batches.is_empty());
    }
}
