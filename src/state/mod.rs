//! Workflow data model and the durable per-project state store.

mod store;
mod workflow;

pub use store::{RunningWorkflow, StateStore, StoreTx};
pub use workflow::{
    ExecutionMode, ReviewAction, TaskState, TaskStatus, WorkflowPhase, WorkflowState,
    WorkflowStatus, WorkflowSummary, new_workflow_id,
};
