//! Prompt construction for every phase.
//!
//! Prompts are plain strings handed to agent CLIs over stdin. Structured
//! replies (task manifests, judgments) are requested as fenced JSON so the
//! parsers in `dag` and `consensus` can extract them.

use crate::agent::AgentOutput;
use crate::state::TaskState;

pub fn build_refine_prompt(prompt: &str) -> String {
    format!(
        r#"Rewrite the following request as a precise, self-contained engineering prompt. Preserve every stated requirement, make implicit assumptions explicit, and keep it under 400 words. Reply with the refined prompt only.

## Request

{prompt}"#
    )
}

pub fn build_analysis_prompt(prompt: &str) -> String {
    format!(
        r#"Analyze the following engineering request. Cover: the core problem, key claims about the current behavior, risks, and concrete recommendations. Be specific; cite files or components when you can.

## Request

{prompt}"#
    )
}

/// Round n+1 prompt: the agent sees its own prior output plus the
/// moderator's divergences, never the other agents' raw outputs.
pub fn build_revision_prompt(
    prompt: &str,
    own_prior: &str,
    divergences: &str,
    round: u32,
) -> String {
    format!(
        r#"This is analysis round {round}. A moderator compared your previous analysis with the other agents' and found the divergences below. Produce a revised analysis of the original request: keep what you still believe, address each divergence explicitly, and change your position only where the disagreement reveals a real gap.

## Original request

{prompt}

## Your previous analysis

{own_prior}

## Moderator divergences

{divergences}"#
    )
}

pub fn build_synthesis_prompt(prompt: &str, outputs: &[AgentOutput]) -> String {
    let mut sections = String::new();
    for output in outputs {
        sections.push_str(&format!(
            "## Analysis from `{}`\n\n{}\n\n",
            output.agent, output.text
        ));
    }
    format!(
        r#"Consolidate the following agent analyses of one request into a single authoritative analysis. Merge agreements, resolve divergences with explicit reasoning, and drop redundancy.

## Request

{prompt}

{sections}"#
    )
}

pub fn build_plan_prompt(analysis: &str, agents: &[String]) -> String {
    let agent_list = agents.join("`, `");
    format!(
        r#"Turn the analysis below into an implementation plan. Decompose the work into tasks with explicit dependencies; independent tasks will run in parallel, so prefer small, isolated tasks.

End your reply with exactly one fenced JSON manifest:

```json
{{
  "tasks": [
    {{"id": "t1", "name": "<short name>", "description": "<what to do>", "agent": "<one of: `{agent_list}`>", "deps": [], "optional": false}}
  ]
}}
```

Task ids must be unique; `deps` lists ids that must complete first. Mark a task optional only when its failure should not fail the run.

## Analysis

{analysis}"#
    )
}

pub fn build_plan_consolidation_prompt(plans: &[AgentOutput]) -> String {
    let mut sections = String::new();
    for plan in plans {
        sections.push_str(&format!(
            "## Plan from `{}`\n\n{}\n\n",
            plan.agent, plan.text
        ));
    }
    format!(
        r#"Merge the following candidate plans into one final plan. Keep the best decomposition, reconcile conflicting task breakdowns, and end with exactly one fenced JSON task manifest in the same format the candidate plans use.

{sections}"#
    )
}

pub fn build_task_prompt(task: &TaskState, context: &str) -> String {
    format!(
        r#"Execute the following task from an approved implementation plan. Work in the current directory. When done, summarize what you changed.

## Task: {name}

{description}

## Plan context

{context}"#,
        name = task.name,
        description = task.description,
        context = context,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_prompt_contains_prior_and_divergences() {
        let prompt = build_revision_prompt("fix the bug", "my old take", "- design: differs", 2);
        assert!(prompt.contains("round 2"));
        assert!(prompt.contains("my old take"));
        assert!(prompt.contains("design: differs"));
    }

    #[test]
    fn test_plan_prompt_lists_agents_and_manifest() {
        let prompt = build_plan_prompt("the analysis", &["claude".into(), "gemini".into()]);
        assert!(prompt.contains("`claude`, `gemini`"));
        assert!(prompt.contains("```json"));
    }

    #[test]
    fn test_synthesis_prompt_includes_all_agents() {
        let outputs = vec![
            AgentOutput {
                agent: "a".into(),
                text: "first".into(),
            },
            AgentOutput {
                agent: "b".into(),
                text: "second".into(),
            },
        ];
        let prompt = build_synthesis_prompt("req", &outputs);
        assert!(prompt.contains("Analysis from `a`"));
        assert!(prompt.contains("second"));
    }
}
