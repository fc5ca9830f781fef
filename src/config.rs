//! Immutable configuration snapshot consumed by the workflow core.
//!
//! The core never parses configuration files on its own initiative: a shell
//! (or the [`YamlConfigLoader`]) hands each project an immutable
//! [`ConfigSnapshot`] at pool-admission time, and everything downstream reads
//! from that snapshot for the life of the project context. All durations are
//! stored as whole seconds so the snapshot stays trivially serializable.

use crate::errors::{QuorumError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default consensus threshold a round must reach to advance.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.85;

/// Default score below which a `consensus_warning` event is published.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.5;

const DEFAULT_MIN_ROUNDS: u32 = 1;
const DEFAULT_MAX_ROUNDS: u32 = 3;
const DEFAULT_MIN_SUCCESSFUL_AGENTS: usize = 2;

const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MODERATOR_TIMEOUT_SECS: u64 = 300;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_LOCK_TTL_SECS: u64 = 60;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

const DEFAULT_MAX_PARALLEL_TASKS: usize = 4;
const DEFAULT_MAX_PROJECTS: usize = 8;
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// How an agent CLI reports its output on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Newline-delimited JSON events (the Claude CLI `stream-json` format).
    StreamJson,
    /// Plain text; token counts parsed from a best-effort trailer.
    #[default]
    Plain,
}

/// One locally installed agent CLI the orchestrator may drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Stable handle used in plans, reports, and the moderator chain.
    pub name: String,
    /// Binary to execute (resolved via `PATH`).
    pub command: String,
    /// Fixed arguments passed before any model flag.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag that selects a model, e.g. `--model`. Omitted when the CLI has
    /// no model selection.
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Default model passed with `model_flag`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Disabled agents stay resolvable (a moderator chain may name them) but
    /// are excluded from analysis/planning fan-out.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AgentDefinition {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            model_flag: None,
            model: None,
            output_format: OutputFormat::default(),
            enabled: true,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_model(mut self, flag: &str, model: &str) -> Self {
        self.model_flag = Some(flag.to_string());
        self.model = Some(model.to_string());
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Profile for the Claude CLI in non-interactive stream-json mode.
    pub fn claude() -> Self {
        Self::new("claude", "claude")
            .with_args(&["-p", "--output-format", "stream-json", "--verbose"])
            .with_output_format(OutputFormat::StreamJson)
    }

    /// Profile for the Codex CLI.
    pub fn codex() -> Self {
        Self::new("codex", "codex").with_args(&["exec", "--json"])
    }

    /// Profile for the Gemini CLI.
    pub fn gemini() -> Self {
        Self::new("gemini", "gemini").with_args(&["-p"])
    }
}

/// Primary moderator plus ordered fallbacks, all referencing agent names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorConfig {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl Default for ModeratorConfig {
    fn default() -> Self {
        Self {
            primary: "claude".to_string(),
            fallbacks: Vec::new(),
        }
    }
}

impl ModeratorConfig {
    /// Primary followed by fallbacks, in consultation order.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(|s| s.as_str()))
    }
}

/// Thresholds and round limits for the consensus loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_min_rounds")]
    pub min_rounds: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_min_successful_agents")]
    pub min_successful_agents: usize,
}

fn default_threshold() -> f64 {
    DEFAULT_CONSENSUS_THRESHOLD
}
fn default_warning_threshold() -> f64 {
    DEFAULT_WARNING_THRESHOLD
}
fn default_min_rounds() -> u32 {
    DEFAULT_MIN_ROUNDS
}
fn default_max_rounds() -> u32 {
    DEFAULT_MAX_ROUNDS
}
fn default_min_successful_agents() -> usize {
    DEFAULT_MIN_SUCCESSFUL_AGENTS
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONSENSUS_THRESHOLD,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            min_rounds: DEFAULT_MIN_ROUNDS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            min_successful_agents: DEFAULT_MIN_SUCCESSFUL_AGENTS,
        }
    }
}

impl ConsensusConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_rounds(mut self, min: u32, max: u32) -> Self {
        self.min_rounds = min;
        self.max_rounds = max;
        self
    }

    pub fn with_min_successful_agents(mut self, min: usize) -> Self {
        self.min_successful_agents = min;
        self
    }
}

/// Every externally observable wait in the core, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_moderator_timeout")]
    pub moderator_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_agent_timeout() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}
fn default_moderator_timeout() -> u64 {
    DEFAULT_MODERATOR_TIMEOUT_SECS
}
fn default_grace_period() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            moderator_timeout_secs: DEFAULT_MODERATOR_TIMEOUT_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

impl TimeoutConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn moderator_timeout(&self) -> Duration {
        Duration::from_secs(self.moderator_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Heartbeats older than this denote zombies.
    pub fn zombie_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 3)
    }
}

/// Execute-phase concurrency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Cap on tasks running concurrently inside one batch.
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Cap on simultaneously running workflows per project. `None` means
    /// unlimited.
    #[serde(default)]
    pub max_concurrent_workflows: Option<usize>,
    /// When false, tasks run in the project root instead of isolated
    /// worktrees (useful for non-git projects).
    #[serde(default = "default_true")]
    pub worktrees_enabled: bool,
}

fn default_max_parallel_tasks() -> usize {
    DEFAULT_MAX_PARALLEL_TASKS
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: DEFAULT_MAX_PARALLEL_TASKS,
            max_concurrent_workflows: None,
            worktrees_enabled: true,
        }
    }
}

/// Secret scrubbing applied to prompts and anything logged or reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Regex patterns replaced with `[REDACTED]`.
    #[serde(default = "default_redaction_patterns")]
    pub patterns: Vec<String>,
}

fn default_redaction_patterns() -> Vec<String> {
    vec![
        r"sk-[A-Za-z0-9_-]{16,}".to_string(),
        r"(?i)\b(api[_-]?key|secret|token|password)\s*[:=]\s*\S+".to_string(),
        r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}".to_string(),
    ]
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            patterns: default_redaction_patterns(),
        }
    }
}

/// The full immutable snapshot handed to a project context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub moderator: ModeratorConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    /// Agent used to synthesize the consolidated analysis and plan. Defaults
    /// to the first enabled agent.
    #[serde(default)]
    pub synthesizer: Option<String>,
    /// Agent used for the refine phase. Defaults to the first enabled agent.
    #[serde(default)]
    pub refiner: Option<String>,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Cap on resident project contexts in the pool.
    #[serde(default = "default_max_projects")]
    pub max_projects: usize,
}

fn default_event_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE_CAPACITY
}
fn default_max_projects() -> usize {
    DEFAULT_MAX_PROJECTS
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            moderator: ModeratorConfig::default(),
            consensus: ConsensusConfig::default(),
            timeouts: TimeoutConfig::default(),
            execution: ExecutionConfig::default(),
            redaction: RedactionConfig::default(),
            synthesizer: None,
            refiner: None,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            max_projects: DEFAULT_MAX_PROJECTS,
        }
    }
}

impl ConfigSnapshot {
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Parse a snapshot from YAML text (the `.quorum/config.yaml` format).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let snapshot: Self = serde_yaml::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.consensus.threshold) {
            return Err(QuorumError::InvalidArgument(format!(
                "consensus threshold {} outside [0, 1]",
                self.consensus.threshold
            )));
        }
        if self.consensus.min_rounds == 0 || self.consensus.max_rounds < self.consensus.min_rounds
        {
            return Err(QuorumError::InvalidArgument(format!(
                "invalid round bounds: min {} max {}",
                self.consensus.min_rounds, self.consensus.max_rounds
            )));
        }
        if self.execution.max_parallel_tasks == 0 {
            return Err(QuorumError::InvalidArgument(
                "max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        for name in self.moderator.chain() {
            if self.agent(name).is_none() {
                return Err(QuorumError::InvalidArgument(format!(
                    "moderator chain references unknown agent {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Dependency-injected configuration source for the project pool.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, project_root: &Path) -> Result<ConfigSnapshot>;
}

/// Default loader: reads `<root>/.quorum/config.yaml`, falling back to a
/// snapshot with defaults (and a lone Claude profile) when the file is
/// absent.
#[derive(Debug, Default)]
pub struct YamlConfigLoader;

impl ConfigLoader for YamlConfigLoader {
    fn load(&self, project_root: &Path) -> Result<ConfigSnapshot> {
        let path = project_root.join(".quorum").join("config.yaml");
        if !path.exists() {
            let mut snapshot = ConfigSnapshot::default();
            snapshot.agents.push(AgentDefinition::claude());
            return Ok(snapshot);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", path.display())))?;
        ConfigSnapshot::from_yaml(&text)
    }
}
