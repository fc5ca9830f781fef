//! Typed error taxonomy for the Quorum core.
//!
//! One enum covers the whole crate so that shells (CLI, TUI, HTTP) can match
//! on stable kinds without knowing which subsystem produced the failure. The
//! mapping rules live in the component that translates (e.g. a phase executor
//! turning an agent timeout into a phase outcome); this module only defines
//! the vocabulary.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuorumError>;

/// Stable error kinds surfaced by the workflow core.
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("i/o failure: {0}")]
    Io(String),

    #[error("workflow {workflow_id} is locked by {holder}")]
    Locked { workflow_id: String, holder: String },

    #[error("workflow {workflow_id} is {status} and can no longer be modified")]
    Conflict { workflow_id: String, status: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("agent {agent} failed: {message}")]
    AgentFailed { agent: String, message: String },

    #[error("no moderator produced a parseable judgment for round {round}")]
    ModeratorUnavailable { round: u32 },

    #[error(
        "no consensus after {rounds} round(s): score {score:.3} below threshold {threshold:.3}"
    )]
    NoConsensus {
        rounds: u32,
        score: f64,
        threshold: f64,
    },

    #[error("only {succeeded} usable agent output(s), {required} required")]
    InsufficientAgents { succeeded: usize, required: usize },

    #[error("cyclic task dependencies between {}", cycle.join(", "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("task {task} depends on unknown task {dependency}")]
    DanglingDependency { task: String, dependency: String },

    #[error("path {path} escapes the execution directory {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("project {project_id} no longer exists on disk")]
    ProjectGone { project_id: String },

    #[error("project pool exhausted: every resident project has live workflows")]
    PoolExhausted,

    #[error("incompatible state schema: found v{found}, this build supports up to v{supported}")]
    Incompatible { found: i64, supported: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl QuorumError {
    /// Stable machine-readable kind, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Locked { .. } => "locked",
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::AgentFailed { .. } => "agent_failed",
            Self::ModeratorUnavailable { .. } => "moderator_unavailable",
            Self::NoConsensus { .. } => "no_consensus",
            Self::InsufficientAgents { .. } => "insufficient_agents",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::DanglingDependency { .. } => "dangling_dependency",
            Self::PathEscape { .. } => "path_escape",
            Self::ProjectGone { .. } => "project_gone",
            Self::PoolExhausted => "pool_exhausted",
            Self::Incompatible { .. } => "incompatible",
            Self::InvalidArgument(_) => "invalid_argument",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for errors worth retrying at the storage layer (SQLite busy/locked
    /// contention). Everything else is permanent from the store's view.
    pub(crate) fn is_transient_io(&self) -> bool {
        match self {
            Self::Io(message) => {
                message.contains("database is locked") || message.contains("database is busy")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for QuorumError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for QuorumError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QuorumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}

impl From<serde_yaml::Error> for QuorumError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Io(format!("yaml: {err}"))
    }
}
