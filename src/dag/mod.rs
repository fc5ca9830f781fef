//! Task DAG planning: plan parsing, wave batching, cycle detection.
//!
//! The planner turns `final-plan.md` into typed tasks and groups them into
//! parallel waves the execute phase runs with a concurrency cap. Cycles and
//! unknown dependencies are rejected before any worktree is created.

mod parser;
mod scheduler;

pub use parser::{PlannedTask, parse_plan};
pub use scheduler::{batch_planned, compute_batches, render_execution_graph};
