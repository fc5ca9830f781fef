//! The `Quorum` façade exposed to CLI/TUI/HTTP shells.
//!
//! One `Quorum` per process owns the project pool, the registry of live
//! runners, and the background sweeper. Shells hold this handle and never
//! touch internal maps directly.

use crate::agent::AgentSet;
use crate::config::ConfigLoader;
use crate::errors::{QuorumError, Result};
use crate::event::{Event, EventFilter, EventKind, EventPayload, Subscription};
use crate::phases::PhaseContext;
use crate::pool::{ProjectContext, ProjectEntry, ProjectPool, ProjectRegistry};
use crate::runner::{ReviewDecision, RunnerRegistry, WorkflowControl, WorkflowRunner};
use crate::state::{
    ExecutionMode, ReviewAction, WorkflowPhase, WorkflowState, WorkflowStatus, WorkflowSummary,
};
use crate::sweeper;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction options for the façade.
pub struct QuorumOptions {
    /// Location of `projects.yaml`; defaults to the user config directory.
    pub registry_path: Option<PathBuf>,
    pub max_projects: usize,
    pub config_loader: Arc<dyn ConfigLoader>,
    pub sweep_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for QuorumOptions {
    fn default() -> Self {
        Self {
            registry_path: None,
            max_projects: crate::config::ConfigSnapshot::default().max_projects,
            config_loader: Arc::new(crate::config::YamlConfigLoader),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Options for starting a workflow.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub mode: ExecutionMode,
}

/// Options for resolving a review gate.
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub feedback: Option<String>,
    pub selected_task_ids: Option<Vec<String>>,
}

/// Process-wide orchestrator handle.
pub struct Quorum {
    pool: Arc<ProjectPool>,
    runners: Arc<RunnerRegistry>,
    drain_timeout: Duration,
    sweeper_cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Quorum {
    /// Build the façade and start the sweeper. Must be called from within a
    /// tokio runtime.
    pub fn new(options: QuorumOptions) -> Result<Self> {
        let registry_path = options
            .registry_path
            .unwrap_or_else(ProjectRegistry::default_path);
        let pool = Arc::new(ProjectPool::new(
            registry_path,
            options.max_projects,
            options.config_loader,
        )?);
        let runners = Arc::new(RunnerRegistry::default());
        let sweeper_cancel = CancellationToken::new();
        let sweeper = sweeper::spawn(
            Arc::clone(&pool),
            Arc::clone(&runners),
            options.sweep_interval,
            sweeper_cancel.clone(),
        );
        Ok(Self {
            pool,
            runners,
            drain_timeout: options.drain_timeout,
            sweeper_cancel,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    // ------------------------------------------------------------------
    // Project registry pass-throughs
    // ------------------------------------------------------------------

    pub fn add_project(&self, id: &str, path: &Path, name: &str) -> Result<()> {
        self.pool.add_project(id, path, name)
    }

    pub fn remove_project(&self, id: &str) -> Result<()> {
        self.pool.remove_project(id)
    }

    pub fn list_projects(&self) -> Vec<ProjectEntry> {
        self.pool.list_projects()
    }

    pub fn default_project(&self) -> Option<String> {
        self.pool.default_project()
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Create and start a workflow; returns its id. `<Locked>` or admission
    /// failures surface before any runner state is mutated.
    pub fn start(&self, project_id: &str, prompt: &str, options: StartOptions) -> Result<String> {
        let ctx = self.pool.get(project_id)?;

        if let Some(cap) = ctx.config.execution.max_concurrent_workflows {
            if ctx.store.list_running()?.len() >= cap {
                return Err(QuorumError::PoolExhausted);
            }
        }

        // Validates the agent/moderator configuration before anything is
        // persisted.
        let agents = AgentSet::from_config(&ctx.config)?;

        let mut wf = WorkflowState::new(prompt, options.mode);
        ctx.store.save(&mut wf)?;
        ctx.store.set_active(&wf.id)?;
        ctx.store
            .acquire_lock(&wf.id, ctx.config.timeouts.lock_ttl())?;
        ctx.store.mark_running(&wf.id)?;
        wf.status = WorkflowStatus::Running;
        wf.started_at = Some(Utc::now());
        ctx.store.save(&mut wf)?;

        ctx.bus.publish(Event::new(
            project_id,
            &wf.id,
            EventPayload::WorkflowStarted { mode: wf.mode },
        ));
        info!(%project_id, workflow_id = %wf.id, mode = ?wf.mode, "workflow started");
        self.spawn_runner(&ctx, wf, agents)
    }

    /// Resume a paused, interrupted, or zombie-failed workflow from its last
    /// checkpoint. Fails with `<Locked>` while a live process holds the
    /// lock, and `<Conflict>` for completed/cancelled workflows.
    pub fn resume(&self, project_id: &str, workflow_id: &str) -> Result<()> {
        let ctx = self.pool.get(project_id)?;
        if self.runners.get(project_id, workflow_id).is_some() {
            return Err(QuorumError::Locked {
                workflow_id: workflow_id.to_string(),
                holder: "this process".to_string(),
            });
        }

        let agents = AgentSet::from_config(&ctx.config)?;

        // The lock comes first so `<Locked>` surfaces without mutating
        // state; reopening a zombie-failed workflow is a state change.
        ctx.store
            .acquire_lock(workflow_id, ctx.config.timeouts.lock_ttl())?;
        let mut wf = match ctx.store.reopen(workflow_id) {
            Ok(wf) => wf,
            Err(err) => {
                let _ = ctx.store.release_lock(workflow_id);
                return Err(err);
            }
        };
        ctx.store.mark_running(workflow_id)?;
        wf.status = WorkflowStatus::Running;
        if wf.started_at.is_none() {
            wf.started_at = Some(Utc::now());
        }
        ctx.store.save(&mut wf)?;
        info!(%project_id, %workflow_id, phase = %wf.current_phase, "workflow resumed");

        self.spawn_runner(&ctx, wf, agents)?;
        Ok(())
    }

    /// Cancel a workflow. A locally running workflow is cancelled
    /// cooperatively; a non-running one is transitioned directly.
    pub fn cancel(&self, project_id: &str, workflow_id: &str) -> Result<()> {
        if let Some(handle) = self.runners.get(project_id, workflow_id) {
            handle.control.cancel.cancel();
            return Ok(());
        }

        let ctx = self.pool.get(project_id)?;
        let mut wf = ctx
            .store
            .load(workflow_id)?
            .ok_or_else(|| {
                QuorumError::InvalidArgument(format!("unknown workflow {workflow_id}"))
            })?;
        if wf.status.is_terminal() {
            return Err(QuorumError::Conflict {
                workflow_id: workflow_id.to_string(),
                status: wf.status.to_string(),
            });
        }
        ctx.store
            .acquire_lock(workflow_id, ctx.config.timeouts.lock_ttl())?;
        wf.mark_cancelled();
        ctx.store.save(&mut wf)?;
        ctx.store.unmark_running(workflow_id)?;
        ctx.store.release_lock(workflow_id)?;
        ctx.bus.publish(Event::new(
            project_id,
            workflow_id,
            EventPayload::WorkflowCancelled,
        ));
        Ok(())
    }

    /// Request a cooperative pause; it takes effect at the next commit
    /// point.
    pub fn pause(&self, project_id: &str, workflow_id: &str) -> Result<()> {
        let handle = self
            .runners
            .get(project_id, workflow_id)
            .ok_or_else(|| {
                QuorumError::InvalidArgument(format!(
                    "workflow {workflow_id} is not running in this process"
                ))
            })?;
        handle.control.request_pause();
        Ok(())
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<WorkflowSummary>> {
        let ctx = self.pool.get(project_id)?;
        ctx.store.list()
    }

    pub fn get(&self, project_id: &str, workflow_id: &str) -> Result<WorkflowState> {
        let ctx = self.pool.get(project_id)?;
        ctx.store.load(workflow_id)?.ok_or_else(|| {
            QuorumError::InvalidArgument(format!("unknown workflow {workflow_id}"))
        })
    }

    /// The workflow the advisory active pointer names, if any.
    pub fn active(&self, project_id: &str) -> Result<Option<WorkflowState>> {
        let ctx = self.pool.get(project_id)?;
        ctx.store.load_active()
    }

    /// Delete a non-running workflow and its advisory pointer entry.
    pub fn delete(&self, project_id: &str, workflow_id: &str) -> Result<()> {
        let ctx = self.pool.get(project_id)?;
        ctx.store.delete(workflow_id)
    }

    /// Subscribe to a project's progress events.
    pub fn subscribe_events(
        &self,
        project_id: &str,
        kinds: Option<Vec<EventKind>>,
    ) -> Result<Subscription> {
        let ctx = self.pool.get(project_id)?;
        let mut filter = EventFilter::for_project(project_id);
        if let Some(kinds) = kinds {
            filter = filter.with_kinds(kinds);
        }
        ctx.bus.subscribe(filter)
    }

    /// Resolve a pending interactive review gate.
    pub fn review(
        &self,
        project_id: &str,
        workflow_id: &str,
        phase: WorkflowPhase,
        action: ReviewAction,
        options: ReviewOptions,
    ) -> Result<()> {
        if let Some(selected) = &options.selected_task_ids {
            if action == ReviewAction::Reject {
                return Err(QuorumError::InvalidArgument(
                    "task selection is only valid on approval".to_string(),
                ));
            }
            if phase == WorkflowPhase::Analyze {
                return Err(QuorumError::InvalidArgument(
                    "task selection is not valid on the analyze gate".to_string(),
                ));
            }
            if selected.is_empty() {
                return Err(QuorumError::InvalidArgument(
                    "task selection must not be empty".to_string(),
                ));
            }
        }

        let handle = self
            .runners
            .get(project_id, workflow_id)
            .ok_or_else(|| {
                QuorumError::InvalidArgument(format!(
                    "workflow {workflow_id} is not awaiting review in this process"
                ))
            })?;
        let decision = ReviewDecision {
            action,
            feedback: options.feedback,
            selected_task_ids: options.selected_task_ids,
        };
        handle.control.gate.resolve(phase, decision)
    }

    /// Flip a live workflow into interactive mode. Takes effect at the next
    /// gate point and becomes durable at the next persist.
    pub fn switch_to_interactive(&self, project_id: &str, workflow_id: &str) -> Result<()> {
        let handle = self
            .runners
            .get(project_id, workflow_id)
            .ok_or_else(|| {
                QuorumError::InvalidArgument(format!(
                    "workflow {workflow_id} is not running in this process"
                ))
            })?;
        handle.control.set_interactive();
        Ok(())
    }

    /// Remove worktrees whose owning workflow no longer exists in state.
    pub async fn cleanup_orphan_worktrees(&self, project_id: &str) -> Result<usize> {
        let ctx = self.pool.get(project_id)?;
        let live: HashSet<String> = ctx
            .store
            .list()?
            .into_iter()
            .map(|summary| summary.id)
            .collect();
        ctx.worktrees.cleanup_orphans(&live).await
    }

    /// Stop the sweeper, drain in-flight workflows (bounded), close every
    /// project context.
    pub async fn shutdown(&self) {
        self.sweeper_cancel.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.pool.shutdown(&self.runners, self.drain_timeout).await;
    }

    fn spawn_runner(
        &self,
        ctx: &Arc<ProjectContext>,
        wf: WorkflowState,
        agents: AgentSet,
    ) -> Result<String> {
        let control = Arc::new(WorkflowControl::new(wf.mode));
        let phase_ctx = PhaseContext {
            project_id: ctx.project_id.clone(),
            store: ctx.store.clone(),
            bus: ctx.bus.clone(),
            writer: ctx.reports.for_workflow(&wf.id),
            config: Arc::clone(&ctx.config),
            agents,
            worktrees: ctx.worktrees.clone(),
            control: Arc::clone(&control),
            cancel: control.cancel.clone(),
        };
        let workflow_id = wf.id.clone();
        WorkflowRunner::new(phase_ctx, control, Arc::clone(&self.runners)).spawn(wf);
        Ok(workflow_id)
    }

    /// Test/diagnostic seam: the live runner registry.
    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }
}
