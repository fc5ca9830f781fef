//! Heartbeat refresh and zombie reclamation.
//!
//! One long-running task per process. Every interval it refreshes the locks
//! and heartbeats of locally owned running workflows, then reclaims running
//! registry entries whose heartbeat has gone stale (crashed process, dead
//! runner): the workflow transitions to `failed("zombie reclaimed")`, its
//! lock is force-released, and `workflow_failed` is published. The sweeper
//! never revives a workflow; only an explicit resume does.

use crate::event::{Event, EventPayload};
use crate::pool::{ProjectContext, ProjectPool};
use crate::runner::RunnerRegistry;
use crate::state::WorkflowStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ZOMBIE_ERROR: &str = "zombie reclaimed";

/// Start the per-process sweeper loop.
pub fn spawn(
    pool: Arc<ProjectPool>,
    runners: Arc<RunnerRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.tick().await; // consume the immediate tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sweep_once(&pool, &runners),
            }
        }
        debug!("sweeper stopped");
    })
}

/// One sweep over every resident project context.
pub fn sweep_once(pool: &ProjectPool, runners: &RunnerRegistry) {
    for ctx in pool.contexts() {
        refresh_local(&ctx, runners);
        reclaim_zombies(&ctx, runners);
    }
}

fn refresh_local(ctx: &ProjectContext, runners: &RunnerRegistry) {
    let ttl = ctx.config.timeouts.lock_ttl();
    for handle in runners.for_project(&ctx.project_id) {
        if let Err(err) = ctx.store.update_heartbeat(&handle.workflow_id) {
            warn!(workflow_id = %handle.workflow_id, %err, "sweeper heartbeat failed");
        }
        if let Err(err) = ctx.store.refresh_lock(&handle.workflow_id, ttl) {
            warn!(workflow_id = %handle.workflow_id, %err, "sweeper lock refresh failed");
        }
    }
}

fn reclaim_zombies(ctx: &ProjectContext, runners: &RunnerRegistry) {
    let threshold = ctx.config.timeouts.zombie_threshold();
    let zombies = match ctx.store.find_zombies(threshold) {
        Ok(zombies) => zombies,
        Err(err) => {
            warn!(project_id = %ctx.project_id, %err, "zombie scan failed");
            return;
        }
    };
    for workflow_id in zombies {
        // A locally owned runner was refreshed just above; a stale row for
        // it means clock skew, not death.
        if runners.get(&ctx.project_id, &workflow_id).is_some() {
            continue;
        }
        info!(project_id = %ctx.project_id, %workflow_id, "reclaiming zombie workflow");
        match ctx.store.load(&workflow_id) {
            Ok(Some(mut wf)) if !wf.status.is_terminal() => {
                wf.mark_failed(ZOMBIE_ERROR);
                if let Err(err) = ctx.store.save(&mut wf) {
                    warn!(%workflow_id, %err, "failed to persist zombie state");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%workflow_id, %err, "failed to load zombie workflow");
            }
        }
        if let Err(err) = ctx.store.force_release_lock(&workflow_id) {
            warn!(%workflow_id, %err, "failed to release zombie lock");
        }
        if let Err(err) = ctx.store.unmark_running(&workflow_id) {
            warn!(%workflow_id, %err, "failed to unmark zombie");
        }
        ctx.bus.publish(Event::new(
            &ctx.project_id,
            &workflow_id,
            EventPayload::WorkflowFailed {
                error: ZOMBIE_ERROR.to_string(),
            },
        ));
    }
}

/// Returns true when the stored status shows the reclaim happened.
pub fn was_reclaimed(status: WorkflowStatus, error: Option<&str>) -> bool {
    status == WorkflowStatus::Failed && error == Some(ZOMBIE_ERROR)
}
