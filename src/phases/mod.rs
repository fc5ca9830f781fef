//! Per-phase orchestration: refine, analyze, plan, execute.
//!
//! Each phase executor borrows the project context and the live workflow
//! record, persists state at its commit points (after each agent output,
//! after each promoted round, after each task), and publishes progress
//! events. Unrecoverable errors propagate to the runner, which records them
//! and drives the terminal transition.

pub mod analyze;
pub mod execute;
pub mod plan;
pub mod prompts;
pub mod refine;

use crate::agent::AgentSet;
use crate::config::ConfigSnapshot;
use crate::consensus::ConsensusEngine;
use crate::errors::{QuorumError, Result};
use crate::event::{Event, EventBus, EventPayload};
use crate::report::ReportWriter;
use crate::runner::WorkflowControl;
use crate::state::{StateStore, TaskStatus, WorkflowState};
use crate::worktree::WorktreeManager;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a phase executor needs, borrowed from the runner for the life
/// of one workflow. Phases never close shared resources.
///
/// `cancel` is always a clone of `control.cancel`; it exists separately only
/// to keep subprocess call sites terse.
#[derive(Clone)]
pub struct PhaseContext {
    pub project_id: String,
    pub store: StateStore,
    pub bus: EventBus,
    pub writer: ReportWriter,
    pub config: Arc<ConfigSnapshot>,
    pub agents: AgentSet,
    pub worktrees: WorktreeManager,
    pub control: Arc<WorkflowControl>,
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn publish(&self, wf: &WorkflowState, payload: EventPayload) {
        self.bus
            .publish(Event::new(&self.project_id, &wf.id, payload));
    }

    pub fn save(&self, wf: &mut WorkflowState) -> Result<()> {
        self.store.save(wf)
    }

    pub fn consensus_engine(&self) -> ConsensusEngine {
        ConsensusEngine::new(
            self.agents.moderator_chain(),
            self.config.consensus.clone(),
            self.config.timeouts.moderator_timeout(),
        )
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(QuorumError::Cancelled);
        }
        Ok(())
    }
}

/// Narrow the pending task set to `selected` plus the transitive closure of
/// their dependencies; everything else pending becomes `skipped`. An empty
/// or unknown selection is rejected.
pub fn apply_task_selection(wf: &mut WorkflowState, selected: &[String]) -> Result<()> {
    if selected.is_empty() {
        return Err(QuorumError::InvalidArgument(
            "task selection must not be empty".to_string(),
        ));
    }
    for id in selected {
        if !wf.tasks.contains_key(id) {
            return Err(QuorumError::InvalidArgument(format!(
                "selected task {id} does not exist"
            )));
        }
    }

    let mut keep: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = selected.to_vec();
    while let Some(id) = stack.pop() {
        if !keep.insert(id.clone()) {
            continue;
        }
        if let Some(task) = wf.tasks.get(&id) {
            stack.extend(task.depends_on.iter().cloned());
        }
    }

    for (id, task) in wf.tasks.iter_mut() {
        if !keep.contains(id) && task.status == TaskStatus::Pending {
            task.status = TaskStatus::Skipped;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionMode, TaskState};

    fn task(id: &str, deps: &[&str]) -> TaskState {
        TaskState {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            agent: "a".to_string(),
            model: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Pending,
            optional: false,
            output: None,
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: None,
        }
    }

    fn wf_with_tasks() -> WorkflowState {
        let mut wf = WorkflowState::new("x", ExecutionMode::Interactive);
        wf.set_tasks(vec![
            task("t1", &[]),
            task("t2", &["t1"]),
            task("t3", &["t1"]),
            task("t4", &["t2"]),
        ]);
        wf
    }

    #[test]
    fn test_selection_keeps_dependency_closure() {
        let mut wf = wf_with_tasks();
        apply_task_selection(&mut wf, &["t4".to_string()]).unwrap();
        assert_eq!(wf.tasks["t4"].status, TaskStatus::Pending);
        assert_eq!(wf.tasks["t2"].status, TaskStatus::Pending);
        assert_eq!(wf.tasks["t1"].status, TaskStatus::Pending);
        assert_eq!(wf.tasks["t3"].status, TaskStatus::Skipped);
    }

    #[test]
    fn test_empty_selection_rejected() {
        let mut wf = wf_with_tasks();
        assert!(apply_task_selection(&mut wf, &[]).is_err());
    }

    #[test]
    fn test_unknown_selection_rejected() {
        let mut wf = wf_with_tasks();
        let err = apply_task_selection(&mut wf, &["ghost".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_selection_never_demotes_terminal_tasks() {
        let mut wf = wf_with_tasks();
        wf.tasks.get_mut("t1").unwrap().status = TaskStatus::Completed;
        apply_task_selection(&mut wf, &["t3".to_string()]).unwrap();
        assert_eq!(wf.tasks["t1"].status, TaskStatus::Completed);
        assert_eq!(wf.tasks["t2"].status, TaskStatus::Skipped);
        assert_eq!(wf.tasks["t4"].status, TaskStatus::Skipped);
    }
}
