//! Progress events published by the workflow core.
//!
//! Every observable step of a workflow (phase transitions, agent activity,
//! consensus scores, task updates, review gates) is published as an
//! [`Event`] on the owning project's [`EventBus`]. Events are serializable so
//! shells can forward them verbatim over SSE/websocket transports.

mod bus;

pub use bus::{EventBus, Subscription};

use crate::state::{ExecutionMode, ReviewAction, WorkflowPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stable event kinds, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    AgentStarted,
    AgentFinished,
    TokenUpdate,
    ConsensusScore,
    ConsensusWarning,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    ReviewRequested,
    ReviewResolved,
}

/// Kind-specific payload. The serde tag doubles as the wire-level `kind`
/// field so a serialized [`Event`] carries `kind`, `timestamp`,
/// `workflow_id`, `project_id`, and the payload fields in one flat object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStarted {
        mode: ExecutionMode,
    },
    WorkflowCompleted {
        duration_ms: u64,
        cost_usd: f64,
    },
    WorkflowFailed {
        error: String,
    },
    WorkflowCancelled,
    PhaseStarted {
        phase: WorkflowPhase,
    },
    PhaseCompleted {
        phase: WorkflowPhase,
    },
    PhaseFailed {
        phase: WorkflowPhase,
        error: String,
    },
    AgentStarted {
        agent: String,
        model: Option<String>,
        round: u32,
    },
    AgentFinished {
        agent: String,
        round: u32,
        success: bool,
        duration_ms: u64,
    },
    TokenUpdate {
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    },
    ConsensusScore {
        round: u32,
        score: f64,
        moderator: String,
    },
    ConsensusWarning {
        round: u32,
        score: f64,
        threshold: f64,
    },
    TaskStarted {
        task_id: String,
        agent: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    ReviewRequested {
        phase: WorkflowPhase,
    },
    ReviewResolved {
        phase: WorkflowPhase,
        action: ReviewAction,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowCancelled => EventKind::WorkflowCancelled,
            Self::PhaseStarted { .. } => EventKind::PhaseStarted,
            Self::PhaseCompleted { .. } => EventKind::PhaseCompleted,
            Self::PhaseFailed { .. } => EventKind::PhaseFailed,
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentFinished { .. } => EventKind::AgentFinished,
            Self::TokenUpdate { .. } => EventKind::TokenUpdate,
            Self::ConsensusScore { .. } => EventKind::ConsensusScore,
            Self::ConsensusWarning { .. } => EventKind::ConsensusWarning,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::ReviewRequested { .. } => EventKind::ReviewRequested,
            Self::ReviewResolved { .. } => EventKind::ReviewResolved,
        }
    }
}

/// A single progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub project_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(project_id: &str, workflow_id: &str, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_id: workflow_id.to_string(),
            project_id: project_id.to_string(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Subscriber-side filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub kinds: Option<HashSet<EventKind>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            kinds: None,
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(project_id) = &self.project_id {
            if project_id != &event.project_id {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        true
    }
}
