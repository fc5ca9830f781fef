//! Control surface shared between a live runner and the façade: cooperative
//! cancellation and pause, the interactive switch, and the review gate an
//! external `review()` call resolves.

use crate::errors::{QuorumError, Result};
use crate::state::{ExecutionMode, ReviewAction, WorkflowPhase};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A reviewer's response at an interactive gate.
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    pub feedback: Option<String>,
    /// Approve-only: narrow execution to these tasks plus their dependency
    /// closure. Illegal on rejection and on the analyze gate.
    pub selected_task_ids: Option<Vec<String>>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            action: ReviewAction::Approve,
            feedback: None,
            selected_task_ids: None,
        }
    }

    pub fn reject(feedback: Option<String>) -> Self {
        Self {
            action: ReviewAction::Reject,
            feedback,
            selected_task_ids: None,
        }
    }

    pub fn with_selection(mut self, selected: Vec<String>) -> Self {
        self.selected_task_ids = Some(selected);
        self
    }
}

struct PendingReview {
    phase: WorkflowPhase,
    tx: oneshot::Sender<ReviewDecision>,
}

/// Single-slot rendezvous between a suspended runner and `review()`.
#[derive(Default)]
pub struct ReviewGate {
    pending: Mutex<Option<PendingReview>>,
}

impl ReviewGate {
    /// Register a pending review so `resolve` can find it. Registering
    /// before the `awaiting_review` status is persisted means an external
    /// `review()` can never observe the status without a resolvable gate.
    pub fn register(&self, phase: WorkflowPhase) -> Result<oneshot::Receiver<ReviewDecision>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.is_some() {
            return Err(QuorumError::InvalidArgument(
                "a review is already pending for this workflow".to_string(),
            ));
        }
        *pending = Some(PendingReview { phase, tx });
        Ok(rx)
    }

    /// Suspend on a registered review until a decision or cancellation.
    pub async fn wait_on(
        &self,
        rx: oneshot::Receiver<ReviewDecision>,
        cancel: &CancellationToken,
    ) -> Result<ReviewDecision> {
        tokio::select! {
            decision = rx => decision.map_err(|_| QuorumError::Cancelled),
            _ = cancel.cancelled() => {
                self.lock().take();
                Err(QuorumError::Cancelled)
            }
        }
    }

    /// Drop a registered review that will never be waited on.
    pub fn clear_pending(&self) {
        self.lock().take();
    }

    /// Register-and-wait in one step.
    pub async fn wait(
        &self,
        phase: WorkflowPhase,
        cancel: &CancellationToken,
    ) -> Result<ReviewDecision> {
        let rx = self.register(phase)?;
        self.wait_on(rx, cancel).await
    }

    /// Resolve the pending review. Fails when nothing is pending or the
    /// phase does not match what the workflow is waiting on.
    pub fn resolve(&self, phase: WorkflowPhase, decision: ReviewDecision) -> Result<()> {
        let mut guard = self.lock();
        match guard.take() {
            Some(pending) if pending.phase == phase => {
                // A dropped receiver means the runner went away; the caller
                // learns nothing actionable from that distinction.
                let _ = pending.tx.send(decision);
                Ok(())
            }
            Some(pending) => {
                let waiting = pending.phase;
                *guard = Some(pending);
                Err(QuorumError::InvalidArgument(format!(
                    "workflow is awaiting review of {waiting}, not {phase}"
                )))
            }
            None => Err(QuorumError::InvalidArgument(
                "workflow is not awaiting review".to_string(),
            )),
        }
    }

    pub fn pending_phase(&self) -> Option<WorkflowPhase> {
        self.lock().as_ref().map(|p| p.phase)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingReview>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared control block for one live workflow.
pub struct WorkflowControl {
    pub cancel: CancellationToken,
    pause: AtomicBool,
    interactive: AtomicBool,
    pub gate: ReviewGate,
}

impl WorkflowControl {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: AtomicBool::new(false),
            interactive: AtomicBool::new(mode == ExecutionMode::Interactive),
            gate: ReviewGate::default(),
        }
    }

    /// Request a cooperative pause; takes effect at the next commit point.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Flip a running workflow into interactive mode mid-flight.
    pub fn set_interactive(&self) {
        self.interactive.store(true, Ordering::SeqCst);
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_wait_then_resolve() {
        let gate = std::sync::Arc::new(ReviewGate::default());
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(WorkflowPhase::Plan, &cancel).await })
        };
        // Let the waiter register.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(gate.pending_phase(), Some(WorkflowPhase::Plan));

        gate.resolve(WorkflowPhase::Plan, ReviewDecision::approve())
            .unwrap();
        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.action, ReviewAction::Approve);
        assert_eq!(gate.pending_phase(), None);
    }

    #[tokio::test]
    async fn test_resolve_wrong_phase_keeps_gate_pending() {
        let gate = std::sync::Arc::new(ReviewGate::default());
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(WorkflowPhase::Execute, &cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = gate
            .resolve(WorkflowPhase::Analyze, ReviewDecision::approve())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert_eq!(gate.pending_phase(), Some(WorkflowPhase::Execute));

        gate.resolve(WorkflowPhase::Execute, ReviewDecision::approve())
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_fails() {
        let gate = ReviewGate::default();
        assert!(
            gate.resolve(WorkflowPhase::Plan, ReviewDecision::approve())
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_cancel_unblocks_wait() {
        let gate = std::sync::Arc::new(ReviewGate::default());
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait(WorkflowPhase::Plan, &cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(gate.pending_phase(), None);
    }

    #[test]
    fn test_control_flags() {
        let control = WorkflowControl::new(ExecutionMode::MultiAgent);
        assert!(!control.is_interactive());
        assert!(!control.pause_requested());
        control.set_interactive();
        control.request_pause();
        assert!(control.is_interactive());
        assert!(control.pause_requested());

        let interactive = WorkflowControl::new(ExecutionMode::Interactive);
        assert!(interactive.is_interactive());
    }
}
