//! Parsing the final plan artifact into typed tasks.
//!
//! Planner agents are instructed to end `final-plan.md` with a fenced JSON
//! task manifest. Extraction mirrors the moderator-judgment parser: fenced
//! blocks first, then the first bare JSON object containing a `tasks` array.

use crate::errors::{QuorumError, Result};
use crate::state::{TaskState, TaskStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// One task as declared by the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "deps")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

impl PlannedTask {
    pub fn into_task_state(self) -> TaskState {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name
        };
        TaskState {
            id: self.id,
            name,
            description: self.description,
            agent: self.agent,
            model: self.model,
            depends_on: self.depends_on,
            status: TaskStatus::Pending,
            optional: self.optional,
            output: None,
            error: None,
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskManifest {
    tasks: Vec<PlannedTask>,
}

static FENCED_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

/// Parse the plan text into tasks. An explicit empty `tasks` array is valid
/// (the workflow completes immediately); a plan without any manifest is not.
pub fn parse_plan(plan_text: &str) -> Result<Vec<PlannedTask>> {
    let mut manifest: Option<TaskManifest> = None;
    for caps in FENCED_BLOCK_REGEX.captures_iter(plan_text) {
        if let Ok(parsed) = serde_json::from_str::<TaskManifest>(&caps[1]) {
            manifest = Some(parsed);
            break;
        }
    }
    if manifest.is_none() {
        if let (Some(start), Some(end)) = (plan_text.find('{'), plan_text.rfind('}')) {
            if start < end {
                manifest = serde_json::from_str::<TaskManifest>(&plan_text[start..=end]).ok();
            }
        }
    }
    let manifest = manifest.ok_or_else(|| {
        QuorumError::InvalidArgument("final plan contains no task manifest".to_string())
    })?;

    let mut seen = HashSet::new();
    for task in &manifest.tasks {
        if task.id.trim().is_empty() {
            return Err(QuorumError::InvalidArgument(
                "plan contains a task with an empty id".to_string(),
            ));
        }
        if !seen.insert(task.id.clone()) {
            return Err(QuorumError::InvalidArgument(format!(
                "plan contains duplicate task id {}",
                task.id
            )));
        }
    }
    Ok(manifest.tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
# Final plan

First build the parser, then the two consumers in parallel.

```json
{
  "tasks": [
    {"id": "t1", "name": "Parser", "description": "build parser", "agent": "claude", "deps": []},
    {"id": "t2", "name": "CLI", "agent": "claude", "deps": ["t1"]},
    {"id": "t3", "name": "Docs", "agent": "gemini", "deps": ["t1"], "optional": true}
  ]
}
```
"#;

    #[test]
    fn test_parse_plan_extracts_tasks() {
        let tasks = parse_plan(PLAN).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "t1");
        assert_eq!(tasks[1].depends_on, vec!["t1"]);
        assert!(tasks[2].optional);
    }

    #[test]
    fn test_parse_plan_empty_manifest_is_valid() {
        let tasks = parse_plan("nothing to do\n```json\n{\"tasks\": []}\n```").unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_parse_plan_without_manifest_fails() {
        let err = parse_plan("just prose, no tasks").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_parse_plan_duplicate_ids_rejected() {
        let text = r#"```json
{"tasks": [{"id": "t1"}, {"id": "t1"}]}
```"#;
        assert!(parse_plan(text).is_err());
    }

    #[test]
    fn test_into_task_state_defaults_name_to_id() {
        let tasks = parse_plan(r#"```json
{"tasks": [{"id": "t9", "agent": "claude"}]}
```"#)
        .unwrap();
        let state = tasks.into_iter().next().unwrap().into_task_state();
        assert_eq!(state.name, "t9");
        assert_eq!(state.status, TaskStatus::Pending);
    }
}
