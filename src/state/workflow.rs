//! Workflow and task data model.
//!
//! A [`WorkflowState`] is the unit of persistence: the store serializes the
//! whole record as one JSON payload, so everything a resume needs must live
//! here. Status and phase transitions are expressed as methods to keep the
//! invariants (terminal immutability, monotonic phases, task-order
//! consistency) in one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Pipeline position of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Refine,
    Analyze,
    Plan,
    Execute,
    Done,
}

impl WorkflowPhase {
    pub fn next(self) -> Self {
        match self {
            Self::Refine => Self::Analyze,
            Self::Analyze => Self::Plan,
            Self::Plan => Self::Execute,
            Self::Execute | Self::Done => Self::Done,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    AwaitingReview,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are immutable: any further save of the same id is
    /// rejected by the store.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workflow drives its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    SingleAgent,
    #[default]
    MultiAgent,
    /// Multi-agent plus human review gates before plan and execute and
    /// between execute batches.
    Interactive,
}

/// Action a reviewer takes at an interactive gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

/// Status of one execute-phase task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// A task in a terminal state is never demoted; a retry creates a new
    /// task state instead.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One unit of work inside the execute phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Agent handle assigned by the plan.
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// A failed optional task does not fail its batch.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// One workflow: the unit of execution and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub prompt: String,
    #[serde(default)]
    pub refined_prompt: Option<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub current_phase: WorkflowPhase,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub tasks: HashMap<String, TaskState>,
    #[serde(default)]
    pub task_order: Vec<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub consensus_score: Option<f64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(prompt: &str, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: new_workflow_id(now),
            created_at: now,
            updated_at: now,
            prompt: prompt.to_string(),
            refined_prompt: None,
            mode,
            current_phase: WorkflowPhase::Refine,
            status: WorkflowStatus::Pending,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            consensus_score: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Prompt the later phases should work from.
    pub fn effective_prompt(&self) -> &str {
        self.refined_prompt.as_deref().unwrap_or(&self.prompt)
    }

    /// Accumulate usage from one agent invocation. Tokens in and out come
    /// separately from the adapter; neither is ever derived from the other.
    pub fn record_usage(&mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.cost_usd += cost_usd;
    }

    pub fn mark_completed(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.current_phase = WorkflowPhase::Done;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = WorkflowStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = WorkflowStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Replace the task set (plan phase output). Order follows the given
    /// list; every entry must be present in `tasks`.
    pub fn set_tasks(&mut self, tasks: Vec<TaskState>) {
        self.task_order = tasks.iter().map(|t| t.id.clone()).collect();
        self.tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    /// Every id in `task_order` resolves in the task map.
    pub fn task_order_consistent(&self) -> bool {
        self.task_order.iter().all(|id| self.tasks.contains_key(id))
    }

    pub fn summary(&self) -> WorkflowSummary {
        const EXCERPT_LEN: usize = 80;
        let excerpt = if self.prompt.chars().count() > EXCERPT_LEN {
            let cut: String = self.prompt.chars().take(EXCERPT_LEN).collect();
            format!("{cut}…")
        } else {
            self.prompt.clone()
        };
        WorkflowSummary {
            id: self.id.clone(),
            status: self.status,
            current_phase: self.current_phase,
            mode: self.mode,
            prompt_excerpt: excerpt,
            created_at: self.created_at,
            updated_at: self.updated_at,
            consensus_score: self.consensus_score,
            cost_usd: self.cost_usd,
            task_count: self.task_order.len(),
        }
    }
}

/// Listing row returned by `StateStore::list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub status: WorkflowStatus,
    pub current_phase: WorkflowPhase,
    pub mode: ExecutionMode,
    pub prompt_excerpt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub consensus_score: Option<f64>,
    pub cost_usd: f64,
    pub task_count: usize,
}

/// Workflow ids look like `wf-<unix-millis>-<8-hex-nonce>`.
pub fn new_workflow_id(now: DateTime<Utc>) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("wf-{}-{}", now.timestamp_millis(), &nonce[..8])
}
