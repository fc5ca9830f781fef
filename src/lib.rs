//! Quorum: the multi-agent workflow orchestration core.
//!
//! Quorum drives several locally installed LLM command-line tools through a
//! fixed pipeline (*refine*, *analyze*, *plan*, *execute*) and uses a
//! semantic moderator to decide when the agents agree closely enough to
//! advance. This crate is the execution core behind the CLI/TUI/HTTP
//! shells: the per-workflow state machine, the subprocess agent adapters,
//! the iterative consensus loop with fallback moderators, the task DAG
//! planner and parallel executor with isolated worktrees, the multi-project
//! state pool, and the event bus that fans progress out to subscribers.
//!
//! ## Entry point
//!
//! ```no_run
//! use quorum::{Quorum, QuorumOptions, StartOptions};
//!
//! # async fn example() -> quorum::Result<()> {
//! let quorum = Quorum::new(QuorumOptions::default())?;
//! quorum.add_project("api", std::path::Path::new("/work/api"), "API service")?;
//!
//! let workflow_id = quorum.start("api", "harden the retry logic", StartOptions::default())?;
//! let mut events = quorum.subscribe_events("api", None)?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", workflow_id, event.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod consensus;
pub mod dag;
pub mod errors;
pub mod event;
pub mod phases;
pub mod pool;
pub mod report;
pub mod runner;
pub mod state;
pub mod sweeper;
pub mod worktree;

pub use api::{Quorum, QuorumOptions, ReviewOptions, StartOptions};
pub use config::{AgentDefinition, ConfigLoader, ConfigSnapshot, YamlConfigLoader};
pub use errors::{QuorumError, Result};
pub use event::{Event, EventFilter, EventKind, EventPayload};
pub use state::{
    ExecutionMode, ReviewAction, TaskStatus, WorkflowPhase, WorkflowState, WorkflowStatus,
};
