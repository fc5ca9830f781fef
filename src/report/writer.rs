//! Typed writers for the per-workflow run artifact tree.
//!
//! One writer per workflow, bound to `<runs>/<workflow_id>/`. Every write
//! resolves through a path guard that rejects anything escaping the
//! execution directory, parent directories are created lazily, and moderator
//! attempts only become the official `consensus/round-<n>.md` through an
//! atomic promotion (temp file + rename), so observers never read a
//! half-formed consensus file. The writer hands bytes to the OS; it does not
//! fsync every write.

use crate::errors::{QuorumError, Result};
use crate::state::{TaskState, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Structured metadata prepended to artifacts as a YAML frontmatter block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frontmatter {
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    pub generated_at: DateTime<Utc>,
}

impl Frontmatter {
    pub fn new(doc_type: &str) -> Self {
        Self {
            doc_type: doc_type.to_string(),
            generated_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn with_model(mut self, model: Option<&str>) -> Self {
        self.model = model.map(str::to_string);
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    fn render(&self, body: &str) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(format!("---\n{yaml}---\n\n{body}"))
    }
}

/// Split a document into its frontmatter (if any) and body.
pub fn split_frontmatter(text: &str) -> (Option<Frontmatter>, &str) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (None, text);
    };
    let Some(end) = rest.find("\n---\n") else {
        return (None, text);
    };
    let yaml = &rest[..end];
    let body = rest[end + 5..].trim_start_matches('\n');
    match serde_yaml::from_str::<Frontmatter>(yaml) {
        Ok(front) => (Some(front), body),
        Err(_) => (None, text),
    }
}

/// Binds report writers to one project's runs directory.
#[derive(Debug, Clone)]
pub struct ReportWriterFactory {
    runs_root: PathBuf,
}

impl ReportWriterFactory {
    pub fn new(runs_root: &Path) -> Self {
        Self {
            runs_root: runs_root.to_path_buf(),
        }
    }

    pub fn for_workflow(&self, workflow_id: &str) -> ReportWriter {
        ReportWriter {
            exec_dir: self.runs_root.join(workflow_id),
        }
    }
}

/// Artifact writer for one workflow run.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    exec_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(exec_dir: &Path) -> Self {
        Self {
            exec_dir: exec_dir.to_path_buf(),
        }
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir
    }

    // ------------------------------------------------------------------
    // Prompt artifacts
    // ------------------------------------------------------------------

    pub fn write_original_prompt(&self, prompt: &str) -> Result<PathBuf> {
        self.write_doc(
            "00-original-prompt.md",
            Frontmatter::new("original_prompt"),
            prompt,
        )
    }

    pub fn write_refined_prompt(&self, agent: &str, prompt: &str) -> Result<PathBuf> {
        self.write_doc(
            "01-refined-prompt.md",
            Frontmatter::new("refined_prompt").with_agent(agent),
            prompt,
        )
    }

    // ------------------------------------------------------------------
    // Analyze phase
    // ------------------------------------------------------------------

    /// Per-agent analysis for round `n`, written under `v<n>/`.
    pub fn write_analysis(
        &self,
        agent: &str,
        model: Option<&str>,
        round: u32,
        content: &str,
    ) -> Result<PathBuf> {
        let rel = format!(
            "analyze-phase/v{round}/{}.md",
            sanitize_component(agent)?
        );
        self.write_doc(
            &rel,
            Frontmatter::new("analysis")
                .with_agent(agent)
                .with_model(model)
                .with_round(round),
            content,
        )
    }

    pub fn write_moderator_attempt(
        &self,
        round: u32,
        attempt: u32,
        agent: &str,
        content: &str,
    ) -> Result<PathBuf> {
        let rel = self.attempt_rel(round, attempt, agent)?;
        self.write_doc(
            &rel,
            Frontmatter::new("moderator_attempt")
                .with_agent(agent)
                .with_round(round)
                .with_attempt(attempt),
            content,
        )
    }

    /// Atomically copy a validated attempt to the official round file.
    /// Idempotent: promoting the same `(round, attempt)` twice leaves the
    /// same bytes.
    pub fn promote_moderator_attempt(
        &self,
        round: u32,
        attempt: u32,
        agent: &str,
    ) -> Result<PathBuf> {
        let attempt_path = self.guarded(&self.attempt_rel(round, attempt, agent)?)?;
        let bytes = std::fs::read(&attempt_path)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", attempt_path.display())))?;
        if bytes.is_empty() {
            return Err(QuorumError::Io(format!(
                "attempt {} is empty, refusing to promote",
                attempt_path.display()
            )));
        }

        let official = self.guarded(&format!("analyze-phase/consensus/round-{round}.md"))?;
        let parent = official
            .parent()
            .ok_or_else(|| QuorumError::Io(format!("no parent for {}", official.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| QuorumError::Io(format!("create {}: {e}", parent.display())))?;
        let tmp = parent.join(format!(".round-{round}.md.tmp"));
        std::fs::write(&tmp, &bytes)
            .map_err(|e| QuorumError::Io(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &official)
            .map_err(|e| QuorumError::Io(format!("promote {}: {e}", official.display())))?;
        debug!(round, attempt, path = %official.display(), "moderator attempt promoted");
        Ok(official)
    }

    /// Whether `consensus/round-<n>.md` has been promoted.
    pub fn round_promoted(&self, round: u32) -> bool {
        self.exec_dir
            .join(format!("analyze-phase/consensus/round-{round}.md"))
            .exists()
    }

    /// The highest promoted round, if any.
    pub fn latest_promoted_round(&self) -> Option<u32> {
        let mut round = 0;
        for n in 1..=64 {
            if self.round_promoted(n) {
                round = n;
            }
        }
        (round > 0).then_some(round)
    }

    pub fn read_round(&self, round: u32) -> Result<Option<String>> {
        let path = self
            .exec_dir
            .join(format!("analyze-phase/consensus/round-{round}.md"));
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", path.display())))?;
        Ok(Some(text))
    }

    /// Agent analyses persisted for round `n`, as `(agent, body)` pairs.
    pub fn read_round_analyses(&self, round: u32) -> Result<Vec<(String, String)>> {
        let dir = self.exec_dir.join(format!("analyze-phase/v{round}"));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut outputs = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", dir.display())))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|e| QuorumError::Io(format!("read {}: {e}", path.display())))?;
            let (front, body) = split_frontmatter(&text);
            let agent = front
                .and_then(|f| f.agent)
                .or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                })
                .unwrap_or_default();
            outputs.push((agent, body.to_string()));
        }
        Ok(outputs)
    }

    pub fn write_consolidated_analysis(&self, agent: &str, content: &str) -> Result<PathBuf> {
        self.write_doc(
            "analyze-phase/consolidated.md",
            Frontmatter::new("consolidated_analysis").with_agent(agent),
            content,
        )
    }

    pub fn consolidated_analysis_exists(&self) -> bool {
        self.exec_dir.join("analyze-phase/consolidated.md").exists()
    }

    pub fn read_consolidated_analysis(&self) -> Result<Option<String>> {
        self.read_optional("analyze-phase/consolidated.md")
    }

    /// Remove the consolidated artifact after a reviewer rejection so the
    /// re-entered phase does not short-circuit on it. The per-round files
    /// stay: rejection resets the conclusion, not the history.
    pub fn discard_consolidated_analysis(&self) -> Result<()> {
        let path = self.guarded("analyze-phase/consolidated.md")?;
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| QuorumError::Io(format!("remove {}: {e}", path.display())))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plan phase
    // ------------------------------------------------------------------

    pub fn write_plan(&self, agent: &str, content: &str) -> Result<PathBuf> {
        let rel = format!("plan-phase/v1/{}.md", sanitize_component(agent)?);
        self.write_doc(&rel, Frontmatter::new("plan").with_agent(agent), content)
    }

    pub fn write_consolidated_plan(&self, agent: &str, content: &str) -> Result<PathBuf> {
        self.write_doc(
            "plan-phase/consolidated-plan.md",
            Frontmatter::new("consolidated_plan").with_agent(agent),
            content,
        )
    }

    pub fn write_final_plan(&self, content: &str) -> Result<PathBuf> {
        self.write_doc(
            "plan-phase/final-plan.md",
            Frontmatter::new("final_plan"),
            content,
        )
    }

    pub fn read_final_plan(&self) -> Result<Option<String>> {
        self.read_optional("plan-phase/final-plan.md")
    }

    pub fn write_task_plan(&self, task: &TaskState) -> Result<PathBuf> {
        let rel = format!("plan-phase/tasks/{}.md", sanitize_component(&task.id)?);
        let body = format!(
            "# {}\n\n{}\n\n- agent: {}\n- depends on: {}\n",
            task.name,
            task.description,
            task.agent,
            if task.depends_on.is_empty() {
                "(none)".to_string()
            } else {
                task.depends_on.join(", ")
            },
        );
        self.write_doc(
            &rel,
            Frontmatter::new("task_plan")
                .with_agent(&task.agent)
                .with_model(task.model.as_deref()),
            &body,
        )
    }

    pub fn write_execution_graph(&self, content: &str) -> Result<PathBuf> {
        self.write_doc(
            "plan-phase/execution-graph.md",
            Frontmatter::new("execution_graph"),
            content,
        )
    }

    // ------------------------------------------------------------------
    // Execute phase
    // ------------------------------------------------------------------

    /// Task run record plus, when output was captured, the raw output file.
    pub fn write_task_result(&self, task: &TaskState) -> Result<PathBuf> {
        let id = sanitize_component(&task.id)?;
        if let Some(output) = &task.output {
            self.write_doc(
                &format!("execute-phase/outputs/{id}.md"),
                Frontmatter::new("task_output").with_agent(&task.agent),
                output,
            )?;
        }
        let mut front = Frontmatter::new("task_result")
            .with_agent(&task.agent)
            .with_model(task.model.as_deref());
        front.tokens_in = Some(task.tokens_in);
        front.tokens_out = Some(task.tokens_out);
        let body = format!(
            "# {}\n\n- status: {:?}\n- duration: {}\n{}",
            task.name,
            task.status,
            task.duration_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "n/a".to_string()),
            task.error
                .as_deref()
                .map(|e| format!("- error: {e}\n"))
                .unwrap_or_default(),
        );
        self.write_doc(&format!("execute-phase/tasks/{id}.md"), front, &body)
    }

    pub fn write_execution_summary(&self, content: &str) -> Result<PathBuf> {
        self.write_doc(
            "execute-phase/execution-summary.md",
            Frontmatter::new("execution_summary"),
            content,
        )
    }

    // ------------------------------------------------------------------
    // Workflow-level artifacts
    // ------------------------------------------------------------------

    pub fn write_metadata(&self, wf: &WorkflowState) -> Result<PathBuf> {
        let body = format!(
            "# Workflow {}\n\n- created: {}\n- mode: {:?}\n- prompt chars: {}\n",
            wf.id,
            wf.created_at.to_rfc3339(),
            wf.mode,
            wf.prompt.chars().count(),
        );
        self.write_doc("metadata.md", Frontmatter::new("metadata"), &body)
    }

    pub fn write_workflow_summary(&self, wf: &WorkflowState) -> Result<PathBuf> {
        let mut front = Frontmatter::new("workflow_summary");
        front.tokens_in = Some(wf.tokens_in);
        front.tokens_out = Some(wf.tokens_out);
        front.score = wf.consensus_score;
        let body = format!(
            "# Workflow {}\n\n- status: {}\n- phase: {}\n- tasks: {}\n- cost: ${:.4}\n{}",
            wf.id,
            wf.status,
            wf.current_phase,
            wf.task_order.len(),
            wf.cost_usd,
            wf.error
                .as_deref()
                .map(|e| format!("- error: {e}\n"))
                .unwrap_or_default(),
        );
        self.write_doc("workflow-summary.md", front, &body)
    }

    // ------------------------------------------------------------------

    fn attempt_rel(&self, round: u32, attempt: u32, agent: &str) -> Result<String> {
        Ok(format!(
            "analyze-phase/consensus/attempts/round-{round}/attempt-{attempt}-{}.md",
            sanitize_component(agent)?
        ))
    }

    fn write_doc(&self, relative: &str, front: Frontmatter, body: &str) -> Result<PathBuf> {
        let path = self.guarded(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QuorumError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let rendered = front.render(body)?;
        std::fs::write(&path, rendered)
            .map_err(|e| QuorumError::Io(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    fn read_optional(&self, relative: &str) -> Result<Option<String>> {
        let path = self.guarded(relative)?;
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| QuorumError::Io(format!("read {}: {e}", path.display())))?;
        Ok(Some(text))
    }

    /// Resolve a relative path and reject anything that would land outside
    /// the execution directory.
    fn guarded(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let mut depth: i64 = 0;
        for component in relative.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(QuorumError::PathEscape {
                            path: relative.to_path_buf(),
                            root: self.exec_dir.clone(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(QuorumError::PathEscape {
                        path: relative.to_path_buf(),
                        root: self.exec_dir.clone(),
                    });
                }
            }
        }
        Ok(self.exec_dir.join(relative))
    }
}

/// File-name component derived from an agent or task handle.
fn sanitize_component(name: &str) -> Result<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.').to_string();
    if trimmed.is_empty() {
        return Err(QuorumError::InvalidArgument(format!(
            "unusable artifact name {name:?}"
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionMode, TaskStatus};
    use tempfile::TempDir;

    fn writer() -> (TempDir, ReportWriter) {
        let dir = TempDir::new().unwrap();
        let factory = ReportWriterFactory::new(&dir.path().join("runs"));
        let writer = factory.for_workflow("wf-test");
        (dir, writer)
    }

    #[test]
    fn test_write_creates_parents_lazily() {
        let (_dir, writer) = writer();
        let path = writer.write_analysis("claude", Some("opus"), 1, "findings").unwrap();
        assert!(path.ends_with("analyze-phase/v1/claude.md"));
        assert!(path.exists());
        let text = std::fs::read_to_string(path).unwrap();
        let (front, body) = split_frontmatter(&text);
        let front = front.unwrap();
        assert_eq!(front.doc_type, "analysis");
        assert_eq!(front.agent.as_deref(), Some("claude"));
        assert_eq!(front.round, Some(1));
        assert_eq!(body.trim(), "findings");
    }

    #[test]
    fn test_round_file_absent_until_promotion() {
        let (_dir, writer) = writer();
        writer
            .write_moderator_attempt(1, 1, "claude", "score 0.9")
            .unwrap();
        assert!(!writer.round_promoted(1));

        writer.promote_moderator_attempt(1, 1, "claude").unwrap();
        assert!(writer.round_promoted(1));
        let round = writer.read_round(1).unwrap().unwrap();
        assert!(round.contains("score 0.9"));
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let (_dir, writer) = writer();
        writer
            .write_moderator_attempt(2, 1, "claude", "judgment")
            .unwrap();
        let first = writer.promote_moderator_attempt(2, 1, "claude").unwrap();
        let bytes_first = std::fs::read(&first).unwrap();
        let second = writer.promote_moderator_attempt(2, 1, "claude").unwrap();
        let bytes_second = std::fs::read(&second).unwrap();
        assert_eq!(first, second);
        assert_eq!(bytes_first, bytes_second);
    }

    #[test]
    fn test_path_guard_rejects_escape() {
        let (_dir, writer) = writer();
        let err = writer.guarded("../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), "path_escape");
        let err = writer.guarded("/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), "path_escape");
        // Interior `..` that stays inside the tree is fine.
        assert!(writer.guarded("a/b/../c.md").is_ok());
    }

    #[test]
    fn test_agent_name_sanitized_in_paths() {
        let (_dir, writer) = writer();
        let path = writer
            .write_analysis("../sneaky/agent", None, 1, "x")
            .unwrap();
        assert!(path.starts_with(writer.exec_dir()));
        assert!(!path.to_string_lossy().contains("sneaky/agent"));
    }

    #[test]
    fn test_read_round_analyses_strips_frontmatter() {
        let (_dir, writer) = writer();
        writer.write_analysis("alpha", None, 1, "alpha says").unwrap();
        writer.write_analysis("beta", None, 1, "beta says").unwrap();
        let outputs = writer.read_round_analyses(1).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].0, "alpha");
        assert_eq!(outputs[0].1.trim(), "alpha says");
    }

    #[test]
    fn test_task_result_writes_record_and_output() {
        let (_dir, writer) = writer();
        let task = TaskState {
            id: "t1".into(),
            name: "build".into(),
            description: "build it".into(),
            agent: "claude".into(),
            model: None,
            depends_on: vec![],
            status: TaskStatus::Completed,
            optional: false,
            output: Some("did the thing".into()),
            error: None,
            tokens_in: 5,
            tokens_out: 7,
            duration_ms: Some(1200),
        };
        writer.write_task_result(&task).unwrap();
        assert!(writer.exec_dir().join("execute-phase/tasks/t1.md").exists());
        assert!(writer.exec_dir().join("execute-phase/outputs/t1.md").exists());
    }

    #[test]
    fn test_workflow_summary_contains_status() {
        let (_dir, writer) = writer();
        let mut wf = WorkflowState::new("p", ExecutionMode::MultiAgent);
        wf.mark_completed();
        let path = writer.write_workflow_summary(&wf).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("completed"));
    }
}
