//! Execute phase: run the planned task DAG in parallel waves.
//!
//! Tasks inside a batch start concurrently under a configurable cap; each
//! task gets a fresh worktree (when the project is a git repository and
//! worktrees are enabled) and its assigned agent. Every task completion is
//! persisted before the next event goes out. A failed non-optional task
//! fails the workflow once its batch has drained; optional failures only
//! skip their dependents. Interactive mode halts between batches.

use super::prompts::build_task_prompt;
use super::{PhaseContext, apply_task_selection};
use crate::agent::{AgentRequest, AgentResult};
use crate::dag;
use crate::errors::{QuorumError, Result};
use crate::event::EventPayload;
use crate::report::split_frontmatter;
use crate::runner::ReviewDecision;
use crate::state::{ReviewAction, TaskStatus, WorkflowPhase, WorkflowState};
use crate::worktree::WorktreeHandle;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// How the execute phase ended, short of an error.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed,
    /// A between-batch rejection: the runner resets the phase to plan.
    Replan,
    /// A cooperative pause took effect at a batch boundary.
    Paused,
}

struct TaskRun {
    id: String,
    result: Result<AgentResult>,
    worktree: Option<WorktreeHandle>,
    duration_ms: u64,
}

pub async fn run(ctx: &PhaseContext, wf: &mut WorkflowState) -> Result<ExecuteOutcome> {
    if wf.task_order.is_empty() {
        // Nothing planned: complete immediately without opening a worktree.
        ctx.writer
            .write_execution_summary("No tasks were planned; nothing to execute.\n")?;
        return Ok(ExecuteOutcome::Completed);
    }

    let deps: BTreeMap<String, Vec<String>> = wf
        .tasks
        .values()
        .map(|t| (t.id.clone(), t.depends_on.clone()))
        .collect();
    let batches = dag::compute_batches(&deps)?;

    let use_worktrees =
        ctx.config.execution.worktrees_enabled && ctx.worktrees.is_git_repo().await;
    if !use_worktrees {
        debug!(workflow_id = %wf.id, "running tasks in the project root (no worktrees)");
    }
    let semaphore = Arc::new(Semaphore::new(ctx.config.execution.max_parallel_tasks));
    let plan_context = match ctx.writer.read_final_plan()? {
        Some(text) => split_frontmatter(&text).1.to_string(),
        None => wf.effective_prompt().to_string(),
    };

    for (batch_index, batch) in batches.iter().enumerate() {
        if ctx.control.pause_requested() {
            return Ok(ExecuteOutcome::Paused);
        }
        ctx.check_cancelled()?;

        let runnable = prepare_batch(ctx, wf, batch)?;
        if runnable.is_empty() {
            continue;
        }

        let batch_failed = run_batch(ctx, wf, &runnable, &semaphore, use_worktrees, &plan_context)
            .await?;

        if let Some(failed_task) = batch_failed {
            let error = wf
                .tasks
                .get(&failed_task)
                .and_then(|t| t.error.clone())
                .unwrap_or_else(|| "task failed".to_string());
            return Err(QuorumError::AgentFailed {
                agent: failed_task,
                message: error,
            });
        }

        let more_pending = batches[batch_index + 1..].iter().any(|later| {
            later
                .iter()
                .any(|id| wf.tasks.get(id).is_some_and(|t| t.status == TaskStatus::Pending))
        });
        if more_pending && ctx.control.is_interactive() {
            match between_batches_gate(ctx, wf).await? {
                ReviewAction::Approve => {}
                ReviewAction::Reject => return Ok(ExecuteOutcome::Replan),
            }
        }
    }

    ctx.writer.write_execution_summary(&execution_summary(wf))?;
    info!(workflow_id = %wf.id, "execute phase complete");
    Ok(ExecuteOutcome::Completed)
}

/// Decide what actually runs from one topological batch: pending tasks whose
/// dependencies all completed. Tasks downstream of a skipped or
/// failed-optional dependency are skipped, never run.
fn prepare_batch(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    batch: &[String],
) -> Result<Vec<String>> {
    let mut runnable = Vec::new();
    let mut skipped = Vec::new();
    for id in batch {
        let Some(task) = wf.tasks.get(id) else { continue };
        if task.status != TaskStatus::Pending {
            continue;
        }
        let deps_ok = task.depends_on.iter().all(|dep| {
            wf.tasks
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        });
        if deps_ok {
            runnable.push(id.clone());
        } else {
            skipped.push(id.clone());
        }
    }
    for id in &skipped {
        if let Some(task) = wf.tasks.get_mut(id) {
            warn!(task_id = %id, "skipping task with unmet dependencies");
            task.status = TaskStatus::Skipped;
        }
    }
    if !skipped.is_empty() {
        ctx.save(wf)?;
    }
    Ok(runnable)
}

/// Run one batch to completion. Returns the id of a failed non-optional
/// task, if any. Every completion is persisted as it happens.
async fn run_batch(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    runnable: &[String],
    semaphore: &Arc<Semaphore>,
    use_worktrees: bool,
    plan_context: &str,
) -> Result<Option<String>> {
    for id in runnable {
        if let Some(task) = wf.tasks.get_mut(id) {
            task.status = TaskStatus::Running;
        }
    }
    ctx.save(wf)?;
    for id in runnable {
        let agent = wf.tasks.get(id).map(|t| t.agent.clone()).unwrap_or_default();
        ctx.publish(
            wf,
            EventPayload::TaskStarted {
                task_id: id.clone(),
                agent,
            },
        );
    }

    let mut in_flight = FuturesUnordered::new();
    for id in runnable {
        let Some(task) = wf.tasks.get(id) else { continue };
        let invoker = ctx.agents.resolve_or_default(&task.agent);
        let prompt = build_task_prompt(task, plan_context);
        let model = task.model.clone();
        let timeout = ctx.config.timeouts.agent_timeout();
        let cancel = ctx.cancel.clone();
        let semaphore = Arc::clone(semaphore);
        let worktrees = ctx.worktrees.clone();
        let project_id = ctx.project_id.clone();
        let workflow_id = wf.id.clone();
        let task_id = id.clone();

        in_flight.push(async move {
            let started = Instant::now();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskRun {
                        id: task_id,
                        result: Err(QuorumError::Cancelled),
                        worktree: None,
                        duration_ms: 0,
                    };
                }
            };

            let worktree = if use_worktrees {
                match worktrees.create(&project_id, &workflow_id, &task_id).await {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        return TaskRun {
                            id: task_id,
                            result: Err(err),
                            worktree: None,
                            duration_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                }
            } else {
                None
            };

            let mut request = AgentRequest::new(&prompt, timeout).with_model(model);
            if let Some(handle) = &worktree {
                request = request.with_working_dir(&handle.path);
            }
            let result = invoker.run(request, &cancel).await;
            TaskRun {
                id: task_id,
                result,
                worktree,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        });
    }

    let mut failed_required: Option<String> = None;
    while let Some(run) = in_flight.next().await {
        let cancelled = matches!(run.result, Err(QuorumError::Cancelled));
        let mut optional = false;

        if let Some(task) = wf.tasks.get_mut(&run.id) {
            optional = task.optional;
            if !task.status.is_terminal() {
                match run.result {
                    Ok(res) => {
                        task.tokens_in = res.tokens_in;
                        task.tokens_out = res.tokens_out;
                        task.duration_ms = Some(run.duration_ms);
                        if res.succeeded() {
                            task.status = TaskStatus::Completed;
                            task.output = Some(res.text);
                        } else {
                            task.status = TaskStatus::Failed;
                            task.error = res.error;
                        }
                        wf.record_usage(res.tokens_in, res.tokens_out, res.cost_usd);
                    }
                    Err(QuorumError::Cancelled) => {
                        task.status = TaskStatus::Failed;
                        task.error = Some("cancelled".to_string());
                        task.duration_ms = Some(run.duration_ms);
                    }
                    Err(err) => {
                        task.status = TaskStatus::Failed;
                        task.error = Some(err.to_string());
                        task.duration_ms = Some(run.duration_ms);
                    }
                }
            }
        }

        // Commit point: the task's terminal state lands before its event.
        if let Some(task) = wf.tasks.get(&run.id) {
            ctx.writer.write_task_result(task)?;
        }
        ctx.save(wf)?;

        let (status, error) = wf
            .tasks
            .get(&run.id)
            .map(|t| (t.status, t.error.clone()))
            .unwrap_or((TaskStatus::Failed, None));
        match status {
            TaskStatus::Completed => {
                ctx.publish(wf, EventPayload::TaskCompleted { task_id: run.id.clone() });
            }
            _ => {
                ctx.publish(
                    wf,
                    EventPayload::TaskFailed {
                        task_id: run.id.clone(),
                        error: error.clone().unwrap_or_default(),
                    },
                );
                if !optional && failed_required.is_none() {
                    failed_required = Some(run.id.clone());
                }
            }
        }
        ctx.publish(
            wf,
            EventPayload::TokenUpdate {
                tokens_in: wf.tokens_in,
                tokens_out: wf.tokens_out,
                cost_usd: wf.cost_usd,
            },
        );

        // Worktrees of cancelled tasks are destroyed best-effort; finished
        // tasks keep theirs for inspection until orphan cleanup.
        if cancelled {
            if let Some(handle) = &run.worktree {
                if let Err(err) = ctx.worktrees.destroy(handle).await {
                    warn!(task_id = %run.id, %err, "failed to destroy cancelled worktree");
                }
            }
        }
    }

    ctx.check_cancelled()?;
    Ok(failed_required)
}

async fn between_batches_gate(ctx: &PhaseContext, wf: &mut WorkflowState) -> Result<ReviewAction> {
    let rx = ctx.control.gate.register(WorkflowPhase::Execute)?;
    wf.status = crate::state::WorkflowStatus::AwaitingReview;
    if let Err(err) = ctx.save(wf) {
        ctx.control.gate.clear_pending();
        return Err(err);
    }
    ctx.publish(
        wf,
        EventPayload::ReviewRequested {
            phase: WorkflowPhase::Execute,
        },
    );

    let decision: ReviewDecision = ctx.control.gate.wait_on(rx, &ctx.cancel).await?;

    wf.status = crate::state::WorkflowStatus::Running;
    if decision.action == ReviewAction::Approve {
        if let Some(selected) = &decision.selected_task_ids {
            apply_task_selection(wf, selected)?;
        }
    }
    ctx.save(wf)?;
    ctx.publish(
        wf,
        EventPayload::ReviewResolved {
            phase: WorkflowPhase::Execute,
            action: decision.action,
        },
    );
    Ok(decision.action)
}

fn execution_summary(wf: &WorkflowState) -> String {
    let mut completed = 0;
    let mut failed = 0;
    let mut skipped = 0;
    for task in wf.tasks.values() {
        match task.status {
            TaskStatus::Completed => completed += 1,
            TaskStatus::Failed => failed += 1,
            TaskStatus::Skipped => skipped += 1,
            _ => {}
        }
    }
    let mut out = format!(
        "# Execution summary\n\n- completed: {completed}\n- failed: {failed}\n- skipped: {skipped}\n\n"
    );
    for id in &wf.task_order {
        if let Some(task) = wf.tasks.get(id) {
            out.push_str(&format!(
                "- `{}` {}: {:?}{}\n",
                task.id,
                task.name,
                task.status,
                task.duration_ms
                    .map(|ms| format!(" ({ms}ms)"))
                    .unwrap_or_default(),
            ));
        }
    }
    out
}
