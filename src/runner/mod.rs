//! Top-level state machine for one workflow.
//!
//! The runner owns the workflow lock for the life of the run: phases execute
//! in order with checkpoints after every commit point, a heartbeat task
//! keeps the lock and the running-registry row fresh, and every exit path
//! (completion, failure, cancellation, pause) releases the lock and removes
//! the workflow from the running registry. Interactive gates suspend the
//! runner on the review gate until an external `review()` resolves it.

mod control;

pub use control::{ReviewDecision, ReviewGate, WorkflowControl};

use crate::errors::{QuorumError, Result};
use crate::event::EventPayload;
use crate::phases::analyze::AnalyzeOutcome;
use crate::phases::execute::ExecuteOutcome;
use crate::phases::{self, PhaseContext};
use crate::state::{
    ReviewAction, StateStore, TaskStatus, WorkflowPhase, WorkflowState, WorkflowStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tokio_util::sync::CancellationToken;

/// Handle to a live (or recently live) runner, owned by the registry.
pub struct RunnerHandle {
    pub project_id: String,
    pub workflow_id: String,
    pub control: Arc<WorkflowControl>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerHandle {
    /// Wait for the runner task to finish. Used by shutdown draining.
    pub async fn wait(&self) {
        let join = self
            .join
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// Process-local registry of live runners, keyed by project and workflow.
#[derive(Default)]
pub struct RunnerRegistry {
    handles: Mutex<HashMap<String, Arc<RunnerHandle>>>,
}

impl RunnerRegistry {
    fn key(project_id: &str, workflow_id: &str) -> String {
        format!("{project_id}/{workflow_id}")
    }

    pub fn insert(&self, handle: Arc<RunnerHandle>) {
        self.lock()
            .insert(Self::key(&handle.project_id, &handle.workflow_id), handle);
    }

    pub fn remove(&self, project_id: &str, workflow_id: &str) {
        self.lock().remove(&Self::key(project_id, workflow_id));
    }

    pub fn get(&self, project_id: &str, workflow_id: &str) -> Option<Arc<RunnerHandle>> {
        self.lock().get(&Self::key(project_id, workflow_id)).cloned()
    }

    pub fn for_project(&self, project_id: &str) -> Vec<Arc<RunnerHandle>> {
        self.lock()
            .values()
            .filter(|h| h.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<RunnerHandle>> {
        self.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RunnerHandle>>> {
        self.handles.lock().unwrap_or_else(|p| p.into_inner())
    }
}

enum DriveOutcome {
    Completed,
    Paused,
}

/// Drives one workflow to a terminal (or paused) state.
pub struct WorkflowRunner {
    ctx: PhaseContext,
    control: Arc<WorkflowControl>,
    registry: Arc<RunnerRegistry>,
}

impl WorkflowRunner {
    /// `ctx.cancel` must be a clone of `control.cancel` so cancellation
    /// reaches every in-flight subprocess.
    pub fn new(
        ctx: PhaseContext,
        control: Arc<WorkflowControl>,
        registry: Arc<RunnerRegistry>,
    ) -> Self {
        Self {
            ctx,
            control,
            registry,
        }
    }

    /// Register a handle and drive the workflow on a background task. The
    /// caller has already acquired the lock, marked the workflow running,
    /// and persisted that state.
    pub fn spawn(self, wf: WorkflowState) -> Arc<RunnerHandle> {
        let handle = Arc::new(RunnerHandle {
            project_id: self.ctx.project_id.clone(),
            workflow_id: wf.id.clone(),
            control: Arc::clone(&self.control),
            join: Mutex::new(None),
        });
        self.registry.insert(Arc::clone(&handle));
        let join = tokio::spawn(self.drive(wf));
        *handle.join.lock().unwrap_or_else(|p| p.into_inner()) = Some(join);
        handle
    }

    async fn drive(self, mut wf: WorkflowState) {
        // Workflow-level artifacts exist from the first heartbeat on.
        let _ = self.ctx.writer.write_original_prompt(&wf.prompt);
        let _ = self.ctx.writer.write_metadata(&wf);

        let heartbeat = spawn_heartbeat(
            self.ctx.store.clone(),
            wf.id.clone(),
            self.ctx.config.timeouts.heartbeat_interval(),
            self.ctx.config.timeouts.lock_ttl(),
            self.control.cancel.child_token(),
        );

        let outcome = self.run_phases(&mut wf).await;
        heartbeat.abort();

        // A mid-run interactive switch becomes durable at the next persist.
        if self.control.is_interactive() {
            wf.mode = crate::state::ExecutionMode::Interactive;
        }

        match outcome {
            Ok(DriveOutcome::Completed) => {
                wf.mark_completed();
                self.persist_terminal(&mut wf);
                let duration_ms = wf
                    .started_at
                    .zip(wf.completed_at)
                    .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.ctx.publish(
                    &wf,
                    EventPayload::WorkflowCompleted {
                        duration_ms,
                        cost_usd: wf.cost_usd,
                    },
                );
                info!(workflow_id = %wf.id, "workflow completed");
            }
            Ok(DriveOutcome::Paused) => {
                wf.status = WorkflowStatus::Paused;
                if let Err(err) = self.ctx.save(&mut wf) {
                    error!(workflow_id = %wf.id, %err, "failed to persist paused state");
                }
                info!(workflow_id = %wf.id, "workflow paused");
            }
            Err(err) if err.is_cancelled() => {
                wf.mark_cancelled();
                self.persist_terminal(&mut wf);
                self.cleanup_incomplete_worktrees(&wf).await;
                self.ctx.publish(&wf, EventPayload::WorkflowCancelled);
                info!(workflow_id = %wf.id, "workflow cancelled");
            }
            Err(err) => {
                wf.mark_failed(&err.to_string());
                self.persist_terminal(&mut wf);
                self.ctx.publish(
                    &wf,
                    EventPayload::WorkflowFailed {
                        error: err.to_string(),
                    },
                );
                warn!(workflow_id = %wf.id, %err, "workflow failed");
            }
        }

        if let Err(err) = self.ctx.store.unmark_running(&wf.id) {
            warn!(workflow_id = %wf.id, %err, "failed to unmark running");
        }
        if let Err(err) = self.ctx.store.release_lock(&wf.id) {
            warn!(workflow_id = %wf.id, %err, "failed to release lock");
        }
        self.registry.remove(&self.ctx.project_id, &wf.id);
    }

    fn persist_terminal(&self, wf: &mut WorkflowState) {
        if let Err(err) = self.ctx.save(wf) {
            error!(workflow_id = %wf.id, %err, "failed to persist terminal state");
        }
        if let Err(err) = self.ctx.writer.write_workflow_summary(wf) {
            warn!(workflow_id = %wf.id, %err, "failed to write workflow summary");
        }
    }

    async fn run_phases(&self, wf: &mut WorkflowState) -> Result<DriveOutcome> {
        // `Some(feedback)` forces the phase to re-enter through its
        // rejection path instead of resuming from artifacts.
        let mut analyze_rejection: Option<Option<String>> = None;
        let mut plan_rejection: Option<Option<String>> = None;

        loop {
            if self.control.pause_requested() && wf.current_phase != WorkflowPhase::Done {
                return Ok(DriveOutcome::Paused);
            }
            self.ctx.check_cancelled()?;

            match wf.current_phase {
                WorkflowPhase::Refine => {
                    self.phase_started(wf, WorkflowPhase::Refine);
                    phases::refine::run(&self.ctx, wf).await?;
                    self.phase_completed(wf, WorkflowPhase::Refine);
                    self.advance(wf, WorkflowPhase::Analyze)?;
                }

                WorkflowPhase::Analyze => {
                    self.phase_started(wf, WorkflowPhase::Analyze);
                    let outcome = match analyze_rejection.take() {
                        Some(feedback) => {
                            phases::analyze::rerun_after_rejection(&self.ctx, wf, feedback).await
                        }
                        None => phases::analyze::run(&self.ctx, wf).await,
                    };
                    match outcome {
                        Ok(AnalyzeOutcome::Advanced) => {
                            self.phase_completed(wf, WorkflowPhase::Analyze);
                            if self.control.is_interactive() {
                                let decision = self.gate(wf, WorkflowPhase::Analyze).await?;
                                match decision.action {
                                    ReviewAction::Approve => {
                                        self.advance(wf, WorkflowPhase::Plan)?
                                    }
                                    ReviewAction::Reject => {
                                        analyze_rejection = Some(decision.feedback);
                                    }
                                }
                            } else {
                                self.advance(wf, WorkflowPhase::Plan)?;
                            }
                        }
                        Ok(AnalyzeOutcome::NeedsReview {
                            outputs,
                            score,
                            rounds,
                        }) => {
                            warn!(
                                workflow_id = %wf.id,
                                score,
                                rounds,
                                "no consensus; surfacing review gate"
                            );
                            let decision = self.gate(wf, WorkflowPhase::Analyze).await?;
                            match decision.action {
                                ReviewAction::Approve => {
                                    phases::analyze::consolidate(&self.ctx, wf, &outputs).await?;
                                    self.phase_completed(wf, WorkflowPhase::Analyze);
                                    self.advance(wf, WorkflowPhase::Plan)?;
                                }
                                ReviewAction::Reject => {
                                    analyze_rejection = Some(decision.feedback);
                                }
                            }
                        }
                        Err(err) => {
                            self.phase_failed(wf, WorkflowPhase::Analyze, &err);
                            return Err(err);
                        }
                    }
                }

                WorkflowPhase::Plan => {
                    self.phase_started(wf, WorkflowPhase::Plan);
                    let result = match plan_rejection.take() {
                        Some(feedback) => {
                            phases::plan::rerun_after_rejection(&self.ctx, wf, feedback).await
                        }
                        None => phases::plan::run(&self.ctx, wf).await,
                    };
                    match result {
                        Ok(()) => {
                            self.phase_completed(wf, WorkflowPhase::Plan);
                            if self.control.is_interactive() {
                                let decision = self.gate(wf, WorkflowPhase::Plan).await?;
                                match decision.action {
                                    ReviewAction::Approve => {
                                        if let Some(selected) = &decision.selected_task_ids {
                                            phases::apply_task_selection(wf, selected)?;
                                            self.ctx.save(wf)?;
                                        }
                                        self.advance(wf, WorkflowPhase::Execute)?;
                                    }
                                    ReviewAction::Reject => {
                                        plan_rejection = Some(decision.feedback);
                                    }
                                }
                            } else {
                                self.advance(wf, WorkflowPhase::Execute)?;
                            }
                        }
                        Err(err) => {
                            self.phase_failed(wf, WorkflowPhase::Plan, &err);
                            return Err(err);
                        }
                    }
                }

                WorkflowPhase::Execute => {
                    self.phase_started(wf, WorkflowPhase::Execute);
                    match phases::execute::run(&self.ctx, wf).await {
                        Ok(ExecuteOutcome::Completed) => {
                            self.phase_completed(wf, WorkflowPhase::Execute);
                            self.advance(wf, WorkflowPhase::Done)?;
                        }
                        Ok(ExecuteOutcome::Replan) => {
                            // The documented backward reset: a between-batch
                            // rejection sends the workflow back to planning.
                            info!(workflow_id = %wf.id, "execution rejected, replanning");
                            wf.tasks.clear();
                            wf.task_order.clear();
                            wf.current_phase = WorkflowPhase::Plan;
                            plan_rejection = Some(None);
                            self.ctx.save(wf)?;
                        }
                        Ok(ExecuteOutcome::Paused) => return Ok(DriveOutcome::Paused),
                        Err(err) => {
                            self.phase_failed(wf, WorkflowPhase::Execute, &err);
                            return Err(err);
                        }
                    }
                }

                WorkflowPhase::Done => return Ok(DriveOutcome::Completed),
            }
        }
    }

    /// Suspend on the review gate with the workflow visibly awaiting review.
    /// The gate is registered before the status is persisted so an observer
    /// of `awaiting_review` can always resolve it.
    async fn gate(&self, wf: &mut WorkflowState, phase: WorkflowPhase) -> Result<ReviewDecision> {
        let rx = self.control.gate.register(phase)?;
        wf.status = WorkflowStatus::AwaitingReview;
        if let Err(err) = self.ctx.save(wf) {
            self.control.gate.clear_pending();
            return Err(err);
        }
        self.ctx
            .publish(wf, EventPayload::ReviewRequested { phase });

        let decision = self.control.gate.wait_on(rx, &self.ctx.cancel).await?;

        wf.status = WorkflowStatus::Running;
        self.ctx.save(wf)?;
        self.ctx.publish(
            wf,
            EventPayload::ReviewResolved {
                phase,
                action: decision.action,
            },
        );
        Ok(decision)
    }

    fn advance(&self, wf: &mut WorkflowState, next: WorkflowPhase) -> Result<()> {
        wf.current_phase = next;
        self.ctx.save(wf)
    }

    fn phase_started(&self, wf: &WorkflowState, phase: WorkflowPhase) {
        self.ctx.publish(wf, EventPayload::PhaseStarted { phase });
    }

    fn phase_completed(&self, wf: &WorkflowState, phase: WorkflowPhase) {
        self.ctx.publish(wf, EventPayload::PhaseCompleted { phase });
    }

    fn phase_failed(&self, wf: &WorkflowState, phase: WorkflowPhase, err: &QuorumError) {
        self.ctx.publish(
            wf,
            EventPayload::PhaseFailed {
                phase,
                error: err.to_string(),
            },
        );
    }

    async fn cleanup_incomplete_worktrees(&self, wf: &WorkflowState) {
        for task in wf.tasks.values() {
            if task.status != TaskStatus::Completed {
                if let Err(err) = self
                    .ctx
                    .worktrees
                    .destroy_task(&self.ctx.project_id, &wf.id, &task.id)
                    .await
                {
                    warn!(task_id = %task.id, %err, "failed to clean up worktree");
                }
            }
        }
    }
}

fn spawn_heartbeat(
    store: StateStore,
    workflow_id: String,
    interval: Duration,
    lock_ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = store.update_heartbeat(&workflow_id) {
                        warn!(%workflow_id, %err, "heartbeat update failed");
                    }
                    if let Err(err) = store.refresh_lock(&workflow_id, lock_ttl) {
                        warn!(%workflow_id, %err, "lock refresh failed");
                    }
                }
            }
        }
    })
}
