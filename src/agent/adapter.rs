//! Agent adapter: one CLI agent as a child process.
//!
//! The adapter is a pure value producer: it writes the (redacted) prompt to
//! the agent's stdin, captures stdout until the process exits, and parses
//! tokens and cost out of whatever the CLI reports. It never touches the
//! state store or the event bus. Cancellation and timeout both terminate the
//! subprocess: SIGTERM first, then a hard kill once the grace period runs
//! out.

use super::redact::Redactor;
use super::stream::{ParsedOutput, parse_plain_output, parse_stream_output};
use crate::config::{AgentDefinition, OutputFormat};
use crate::errors::{QuorumError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One prompt for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Overrides the agent's default model when set.
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(prompt: &str, timeout: Duration) -> Self {
        Self {
            prompt: prompt.to_string(),
            model: None,
            working_dir: None,
            timeout,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_working_dir(mut self, dir: &std::path::Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }
}

/// Outcome of one agent invocation. `error` is set for in-band failures
/// (non-zero exit, CLI-reported error); spawn failures, timeouts and
/// cancellation surface as `Err` instead.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub duration: Duration,
    pub error: Option<String>,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Contract every agent variant implements. The set of variants is closed:
/// adding an agent is a code change, not a configuration trick.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self) -> Option<&str> {
        None
    }

    async fn run(&self, request: AgentRequest, cancel: &CancellationToken) -> Result<AgentResult>;
}

/// Subprocess-backed agent built from an [`AgentDefinition`] profile.
pub struct CliAgent {
    definition: AgentDefinition,
    redactor: Arc<Redactor>,
    grace: Duration,
}

impl CliAgent {
    pub fn new(definition: AgentDefinition, redactor: Arc<Redactor>, grace: Duration) -> Self {
        Self {
            definition,
            redactor,
            grace,
        }
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(agent = %self.definition.name, "agent ignored SIGTERM, killing");
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl AgentInvoker for CliAgent {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn default_model(&self) -> Option<&str> {
        self.definition.model.as_deref()
    }

    async fn run(&self, request: AgentRequest, cancel: &CancellationToken) -> Result<AgentResult> {
        let prompt = self.redactor.redact(&request.prompt);
        let start = Instant::now();

        let mut cmd = Command::new(&self.definition.command);
        cmd.args(&self.definition.args);
        let model = request
            .model
            .clone()
            .or_else(|| self.definition.model.clone());
        if let (Some(flag), Some(model)) = (&self.definition.model_flag, &model) {
            cmd.arg(flag).arg(model);
        }
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(agent = %self.definition.name, command = %self.definition.command, "spawning agent");
        let mut child = cmd.spawn().map_err(|e| QuorumError::AgentFailed {
            agent: self.definition.name.clone(),
            message: format!("failed to spawn {}: {e}", self.definition.command),
        })?;

        // Stdin and stderr are serviced on their own tasks so a CLI that
        // exits early or floods stderr cannot wedge the stdout read.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let bytes = prompt.into_bytes();
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            })
        });
        let mut stderr = child.stderr.take().ok_or_else(|| QuorumError::AgentFailed {
            agent: self.definition.name.clone(),
            message: "failed to capture stderr".to_string(),
        })?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut stdout = child.stdout.take().ok_or_else(|| QuorumError::AgentFailed {
            agent: self.definition.name.clone(),
            message: "failed to capture stdout".to_string(),
        })?;
        let mut raw = String::new();
        let read = stdout.read_to_string(&mut raw);
        tokio::pin!(read);

        enum Outcome {
            Done(std::io::Result<usize>),
            Cancelled,
            TimedOut,
        }

        let outcome = tokio::select! {
            r = &mut read => Outcome::Done(r),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Cancelled => {
                self.terminate(&mut child).await;
                if let Some(t) = stdin_task {
                    t.abort();
                }
                stderr_task.abort();
                Err(QuorumError::Cancelled)
            }
            Outcome::TimedOut => {
                self.terminate(&mut child).await;
                if let Some(t) = stdin_task {
                    t.abort();
                }
                stderr_task.abort();
                Err(QuorumError::Timeout {
                    operation: format!("agent {}", self.definition.name),
                    secs: request.timeout.as_secs(),
                })
            }
            Outcome::Done(read_result) => {
                read_result.map_err(|e| QuorumError::AgentFailed {
                    agent: self.definition.name.clone(),
                    message: format!("reading agent output: {e}"),
                })?;
                let status = child.wait().await.map_err(|e| QuorumError::AgentFailed {
                    agent: self.definition.name.clone(),
                    message: format!("waiting for agent: {e}"),
                })?;
                let stderr_text = stderr_task.await.unwrap_or_default();

                let parsed: ParsedOutput = match self.definition.output_format {
                    OutputFormat::StreamJson => parse_stream_output(&raw),
                    OutputFormat::Plain => parse_plain_output(&raw),
                };

                let mut error = None;
                if parsed.is_error {
                    error = Some(truncate(&self.redactor.redact(&parsed.text), 400));
                } else if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    let detail = truncate(&self.redactor.redact(stderr_text.trim()), 400);
                    error = Some(if detail.is_empty() {
                        format!("exit status {code}")
                    } else {
                        format!("exit status {code}: {detail}")
                    });
                }

                Ok(AgentResult {
                    text: parsed.text,
                    tokens_in: parsed.tokens_in,
                    tokens_out: parsed.tokens_out,
                    cost_usd: parsed.cost_usd,
                    duration: start.elapsed(),
                    error,
                })
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedactionConfig;

    fn cli(definition: AgentDefinition) -> CliAgent {
        CliAgent::new(
            definition,
            Arc::new(Redactor::from_config(&RedactionConfig::default()).unwrap()),
            Duration::from_millis(200),
        )
    }

    fn sh(name: &str, script: &str) -> AgentDefinition {
        AgentDefinition::new(name, "sh").with_args(&["-c", script])
    }

    #[tokio::test]
    async fn test_run_echoes_prompt_through_cat() {
        let agent = cli(AgentDefinition::new("cat", "cat"));
        let result = agent
            .run(
                AgentRequest::new("hello agent", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.text.trim(), "hello agent");
        assert_eq!(result.tokens_in, 0);
    }

    #[tokio::test]
    async fn test_prompt_is_redacted_before_spawn() {
        let agent = cli(AgentDefinition::new("cat", "cat"));
        let result = agent
            .run(
                AgentRequest::new("key is sk-0123456789abcdef0123", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.text.contains("sk-0123456789abcdef0123"));
        assert!(result.text.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_timeout_kills_subprocess() {
        let agent = cli(sh("sleeper", "cat >/dev/null; sleep 30"));
        let started = Instant::now();
        let err = agent
            .run(
                AgentRequest::new("x", Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_promptly() {
        let agent = cli(sh("sleeper", "cat >/dev/null; sleep 30"));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let err = agent
            .run(AgentRequest::new("x", Duration::from_secs(30)), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_in_band_error() {
        let agent = cli(sh("failer", "cat >/dev/null; echo oops >&2; exit 3"));
        let result = agent
            .run(
                AgentRequest::new("x", Duration::from_secs(10)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.succeeded());
        let error = result.error.unwrap();
        assert!(error.contains("exit status 3"));
        assert!(error.contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_agent_failed() {
        let agent = cli(AgentDefinition::new("ghost", "definitely-not-a-binary-7f3a"));
        let err = agent
            .run(
                AgentRequest::new("x", Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_failed");
    }
}
