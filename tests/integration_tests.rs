//! Integration tests for the Quorum workflow core.
//!
//! These drive the `Quorum` façade end-to-end with fake agents: real
//! subprocesses (`sh`/`cat`) whose canned output contains whatever the
//! pipeline needs (a judgment block for the moderator, a task manifest for
//! the planner) so every phase, the consensus loop, persistence, and the
//! event stream are exercised without any model CLI installed.

use quorum::state::TaskStatus;
use quorum::{
    AgentDefinition, ConfigSnapshot, EventKind, ExecutionMode, Quorum, QuorumOptions,
    ReviewAction, ReviewOptions, StartOptions, WorkflowPhase, WorkflowState, WorkflowStatus,
};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

/// Agent output with a judgment block (for the moderator) and a task
/// manifest (for the planner) assigning one task to `task_agent`.
fn combined_script(score: f64, task_agent: &str) -> String {
    format!(
        "cat >/dev/null; printf '%s\\n' 'Independent findings.' '```json' \
         '{{\"score\": {score}, \"agreements\": [\"shared view\"], \"divergences\": []}}' '```' \
         'Proposed plan:' '```json' \
         '{{\"tasks\": [{{\"id\": \"t1\", \"name\": \"Implement\", \"description\": \"do it\", \
         \"agent\": \"{task_agent}\", \"deps\": []}}]}}' '```'"
    )
}

fn sh_agent(name: &str, script: &str) -> AgentDefinition {
    AgentDefinition::new(name, "sh").with_args(&["-c", script])
}

/// Two analyzer/planner agents, a dedicated (disabled) moderator, and a
/// worker the plans assign tasks to.
fn two_agent_config(score: f64, worker_script: &str) -> ConfigSnapshot {
    let mut config = ConfigSnapshot::default();
    config.agents = vec![
        sh_agent("alpha", &combined_script(score, "worker")),
        sh_agent("beta", &combined_script(score, "worker")),
        {
            let mut moderator = sh_agent("arbiter", &combined_script(score, "worker"));
            moderator.enabled = false;
            moderator
        },
        {
            let mut worker = sh_agent("worker", worker_script);
            worker.enabled = false;
            worker
        },
    ];
    config.moderator.primary = "arbiter".into();
    config.consensus.threshold = 0.9;
    config.execution.worktrees_enabled = false;
    config.timeouts.agent_timeout_secs = 30;
    config
}

struct Harness {
    _dir: TempDir,
    quorum: Quorum,
}

fn harness(config: &ConfigSnapshot) -> Harness {
    harness_in(TempDir::new().unwrap(), config)
}

fn harness_in(dir: TempDir, config: &ConfigSnapshot) -> Harness {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });

    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join(".quorum")).unwrap();
    std::fs::write(
        project.join(".quorum/config.yaml"),
        serde_yaml::to_string(config).unwrap(),
    )
    .unwrap();

    let quorum = Quorum::new(QuorumOptions {
        registry_path: Some(dir.path().join("projects.yaml")),
        ..QuorumOptions::default()
    })
    .unwrap();
    quorum.add_project("proj", &project, "Test project").unwrap();
    Harness { _dir: dir, quorum }
}

fn runs_dir(h: &Harness, workflow_id: &str) -> std::path::PathBuf {
    h._dir
        .path()
        .join("project/.quorum/runs")
        .join(workflow_id)
}

async fn wait_for(
    h: &Harness,
    workflow_id: &str,
    pred: impl Fn(&WorkflowState) -> bool,
    what: &str,
) -> WorkflowState {
    for _ in 0..300 {
        let wf = h.quorum.get("proj", workflow_id).unwrap();
        if pred(&wf) {
            return wf;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// End-to-end pipeline
// =============================================================================

#[tokio::test]
async fn test_two_agent_single_round_consensus() {
    let h = harness(&two_agent_config(0.92, "cat >/dev/null; echo task done"));
    let mut events = h.quorum.subscribe_events("proj", None).unwrap();

    let id = h
        .quorum
        .start("proj", "improve the cache layer", StartOptions::default())
        .unwrap();

    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.current_phase, WorkflowPhase::Done);
    assert!((wf.consensus_score.unwrap() - 0.92).abs() < 1e-9);
    assert_eq!(wf.tasks["t1"].status, TaskStatus::Completed);
    assert!(wf.tasks["t1"].output.as_deref().unwrap().contains("task done"));

    // One round was written and promoted; the synthesizer consolidated.
    let runs = runs_dir(&h, &id);
    assert!(runs.join("analyze-phase/v1/alpha.md").exists());
    assert!(runs.join("analyze-phase/v1/beta.md").exists());
    assert!(runs.join("analyze-phase/consensus/round-1.md").exists());
    assert!(!runs.join("analyze-phase/consensus/round-2.md").exists());
    assert!(runs.join("analyze-phase/consolidated.md").exists());
    assert!(runs.join("plan-phase/final-plan.md").exists());
    assert!(runs.join("plan-phase/execution-graph.md").exists());
    assert!(runs.join("execute-phase/tasks/t1.md").exists());
    assert!(runs.join("workflow-summary.md").exists());

    // The event stream brackets the run and carries the consensus score.
    // Drain until the terminal event arrives (publication follows the final
    // persist by a hair).
    let mut kinds = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(event)) => {
                let kind = event.kind();
                kinds.push(kind);
                if kind == EventKind::WorkflowCompleted {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for workflow_completed event"),
        }
    }
    assert_eq!(kinds.first(), Some(&EventKind::WorkflowStarted));
    assert_eq!(kinds.last(), Some(&EventKind::WorkflowCompleted));
    assert!(kinds.contains(&EventKind::ConsensusScore));
    assert!(kinds.contains(&EventKind::TaskCompleted));
    assert!(
        kinds.iter().filter(|k| **k == EventKind::PhaseStarted).count() >= 4,
        "all four phases should have started"
    );

    // The active pointer is advisory but points at the workflow.
    let active = h.quorum.active("proj").unwrap().unwrap();
    assert_eq!(active.id, id);

    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_empty_plan_completes_without_worktrees() {
    let mut config = two_agent_config(0.95, "cat >/dev/null; echo unused");
    // Planners emit an explicitly empty manifest.
    let empty = "cat >/dev/null; printf '%s\\n' 'Nothing to do.' '```json' \
                 '{\"score\": 0.95, \"agreements\": []}' '```' '```json' '{\"tasks\": []}' '```'";
    config.agents[0] = sh_agent("alpha", empty);
    config.agents[1] = sh_agent("beta", empty);
    let h = harness(&config);

    let id = h
        .quorum
        .start("proj", "noop request", StartOptions::default())
        .unwrap();
    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;

    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert!(wf.tasks.is_empty());
    let summary = runs_dir(&h, &id).join("execute-phase/execution-summary.md");
    assert!(summary.exists());
    let worktrees = h._dir.path().join("project/.quorum/worktrees");
    assert!(!worktrees.exists());
    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_threshold_miss_then_recovery() {
    // The moderator scores 0.70 on its first consultation and 0.92 after,
    // so round 1 misses the threshold and round 2 recovers.
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("round-seen");
    let moderator_script = format!(
        "cat >/dev/null; if [ -e {marker} ]; then \
         printf '%s\\n' '```json' '{{\"score\": 0.92, \"agreements\": [\"aligned\"]}}' '```'; \
         else touch {marker}; \
         printf '%s\\n' '```json' '{{\"score\": 0.70, \"divergences\": \
         [{{\"description\": \"different designs\", \"type\": \"approach\", \"agents\": [\"alpha\", \"beta\"]}}]}}' '```'; fi",
        marker = marker.display()
    );

    let mut config = two_agent_config(0.92, "cat >/dev/null; echo task done");
    config.agents[2] = {
        let mut moderator = sh_agent("arbiter", &moderator_script);
        moderator.enabled = false;
        moderator
    };
    let h = harness_in(dir, &config);

    let id = h
        .quorum
        .start("proj", "contended design question", StartOptions::default())
        .unwrap();
    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;

    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert!((wf.consensus_score.unwrap() - 0.92).abs() < 1e-9);

    // Both rounds left artifacts: v1 and v2 analyses, both promoted rounds.
    let runs = runs_dir(&h, &id);
    assert!(runs.join("analyze-phase/v1/alpha.md").exists());
    assert!(runs.join("analyze-phase/v2/alpha.md").exists());
    assert!(runs.join("analyze-phase/consensus/round-1.md").exists());
    assert!(runs.join("analyze-phase/consensus/round-2.md").exists());
    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_cyclic_plan_fails_workflow() {
    let cyclic = "cat >/dev/null; printf '%s\\n' '```json' \
                  '{\"score\": 0.95, \"agreements\": []}' '```' '```json' \
                  '{\"tasks\": [ \
                  {\"id\": \"t1\", \"agent\": \"worker\", \"deps\": [\"t3\"]}, \
                  {\"id\": \"t2\", \"agent\": \"worker\", \"deps\": [\"t1\"]}, \
                  {\"id\": \"t3\", \"agent\": \"worker\", \"deps\": [\"t2\"]}]}' '```'";
    let mut config = two_agent_config(0.95, "cat >/dev/null; echo unused");
    config.agents[0] = sh_agent("alpha", cyclic);
    config.agents[1] = sh_agent("beta", cyclic);
    let h = harness(&config);

    let id = h
        .quorum
        .start("proj", "impossible plan", StartOptions::default())
        .unwrap();
    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;

    assert_eq!(wf.status, WorkflowStatus::Failed);
    let error = wf.error.unwrap();
    assert!(error.contains("cyclic"), "unexpected error: {error}");
    assert!(error.contains("t1") && error.contains("t2") && error.contains("t3"));
    // The planner rejected the DAG before any worktree was opened.
    assert!(!h._dir.path().join("project/.quorum/worktrees").exists());
    h.quorum.shutdown().await;
}

// =============================================================================
// Interactive review gates
// =============================================================================

#[tokio::test]
async fn test_interactive_gates_approve_path() {
    let h = harness(&two_agent_config(0.93, "cat >/dev/null; echo task done"));
    let id = h
        .quorum
        .start(
            "proj",
            "interactive run",
            StartOptions {
                mode: ExecutionMode::Interactive,
            },
        )
        .unwrap();

    // Gate 1: after analyze.
    wait_for(
        &h,
        &id,
        |wf| wf.status == WorkflowStatus::AwaitingReview,
        "analyze gate",
    )
    .await;
    h.quorum
        .review(
            "proj",
            &id,
            WorkflowPhase::Analyze,
            ReviewAction::Approve,
            ReviewOptions::default(),
        )
        .unwrap();

    // Gate 2: after plan, approving with an explicit selection.
    wait_for(
        &h,
        &id,
        |wf| wf.status == WorkflowStatus::AwaitingReview && wf.current_phase == WorkflowPhase::Plan,
        "plan gate",
    )
    .await;
    h.quorum
        .review(
            "proj",
            &id,
            WorkflowPhase::Plan,
            ReviewAction::Approve,
            ReviewOptions {
                feedback: None,
                selected_task_ids: Some(vec!["t1".to_string()]),
            },
        )
        .unwrap();

    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.tasks["t1"].status, TaskStatus::Completed);
    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_review_validation_rules() {
    let h = harness(&two_agent_config(0.92, "cat >/dev/null; echo ok"));

    // Selection with a rejection is illegal.
    let err = h
        .quorum
        .review(
            "proj",
            "wf-unknown",
            WorkflowPhase::Plan,
            ReviewAction::Reject,
            ReviewOptions {
                feedback: None,
                selected_task_ids: Some(vec!["t1".into()]),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    // Selection on the analyze gate is illegal.
    let err = h
        .quorum
        .review(
            "proj",
            "wf-unknown",
            WorkflowPhase::Analyze,
            ReviewAction::Approve,
            ReviewOptions {
                feedback: None,
                selected_task_ids: Some(vec!["t1".into()]),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    // Empty selection is illegal.
    let err = h
        .quorum
        .review(
            "proj",
            "wf-unknown",
            WorkflowPhase::Plan,
            ReviewAction::Approve,
            ReviewOptions {
                feedback: None,
                selected_task_ids: Some(vec![]),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    h.quorum.shutdown().await;
}

// =============================================================================
// Lifecycle: pause, resume, cancel, locking
// =============================================================================

#[tokio::test]
async fn test_pause_then_resume_completes() {
    let h = harness(&two_agent_config(0.94, "cat >/dev/null; echo done"));
    let id = h
        .quorum
        .start("proj", "pausable work", StartOptions::default())
        .unwrap();
    h.quorum.pause("proj", &id).unwrap();

    let paused = wait_for(
        &h,
        &id,
        |wf| wf.status == WorkflowStatus::Paused || wf.status.is_terminal(),
        "pause or finish",
    )
    .await;

    if paused.status == WorkflowStatus::Paused {
        h.quorum.resume("proj", &id).unwrap();
    }
    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;
    assert_eq!(wf.status, WorkflowStatus::Completed);
    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_cancel_mid_run_and_resume_conflicts() {
    let h = harness(&two_agent_config(0.92, "cat >/dev/null; sleep 30"));
    let id = h
        .quorum
        .start("proj", "long run", StartOptions::default())
        .unwrap();

    // While the runner is live in this process, resume is refused.
    let err = h.quorum.resume("proj", &id).unwrap_err();
    assert_eq!(err.kind(), "locked");

    wait_for(
        &h,
        &id,
        |wf| wf.current_phase == WorkflowPhase::Execute,
        "execute phase",
    )
    .await;
    h.quorum.cancel("proj", &id).unwrap();

    let wf = wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;
    assert_eq!(wf.status, WorkflowStatus::Cancelled);

    // Cancelled is final: neither resume nor a second cancel applies.
    assert_eq!(h.quorum.resume("proj", &id).unwrap_err().kind(), "conflict");
    assert_eq!(h.quorum.cancel("proj", &id).unwrap_err().kind(), "conflict");
    h.quorum.shutdown().await;
}

#[tokio::test]
async fn test_list_and_delete() {
    let h = harness(&two_agent_config(0.92, "cat >/dev/null; echo done"));
    let id = h
        .quorum
        .start("proj", "listed work", StartOptions::default())
        .unwrap();
    wait_for(&h, &id, |wf| wf.status.is_terminal(), "terminal status").await;

    let list = h.quorum.list("proj").unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, id);
    assert_eq!(list[0].status, WorkflowStatus::Completed);

    h.quorum.delete("proj", &id).unwrap();
    assert!(h.quorum.list("proj").unwrap().is_empty());
    assert!(h.quorum.active("proj").unwrap().is_none());
    h.quorum.shutdown().await;
}

// =============================================================================
// Project pool surface
// =============================================================================

#[tokio::test]
async fn test_unknown_project_and_registry_round_trip() {
    let h = harness(&two_agent_config(0.92, "cat >/dev/null; echo done"));
    assert_eq!(
        h.quorum
            .start("ghost", "x", StartOptions::default())
            .unwrap_err()
            .kind(),
        "invalid_argument"
    );

    let projects = h.quorum.list_projects();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].id, "proj");

    h.quorum.remove_project("proj").unwrap();
    assert!(h.quorum.list_projects().is_empty());
    h.quorum.shutdown().await;
}
