//! Plan phase: planner agents produce candidate plans, a consolidation step
//! merges them, and the DAG planner turns `final-plan.md` into typed tasks.
//!
//! Output artifacts: `plan-phase/v1/<agent>.md`, `consolidated-plan.md` (in
//! multi-agent mode), `final-plan.md`, per-task plans under `tasks/`, and
//! `execution-graph.md` for human inspection. The parsed tasks land in the
//! workflow record, which is the source of truth the execute phase batches
//! from. A reviewer rejection re-enters through [`rerun_after_rejection`],
//! which regenerates the plan with the feedback folded into the prompt.

use super::PhaseContext;
use super::prompts::{build_plan_consolidation_prompt, build_plan_prompt};
use crate::agent::{AgentOutput, AgentRequest};
use crate::dag;
use crate::errors::{QuorumError, Result};
use crate::event::EventPayload;
use crate::report::split_frontmatter;
use crate::state::WorkflowState;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(ctx: &PhaseContext, wf: &mut WorkflowState) -> Result<()> {
    run_with(ctx, wf, None, false).await
}

/// Re-enter the phase after a reviewer rejected the plan (or after an
/// execute-phase rejection reset): regenerate instead of resuming.
pub async fn rerun_after_rejection(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    feedback: Option<String>,
) -> Result<()> {
    run_with(ctx, wf, feedback, true).await
}

async fn run_with(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    feedback: Option<String>,
    force: bool,
) -> Result<()> {
    if !force {
        // Resume: a parsed final plan plus tasks in state means the phase is
        // done; a final plan without tasks is re-parsed rather than
        // re-planned.
        if let Some(text) = ctx.writer.read_final_plan()? {
            if !wf.tasks.is_empty() && wf.task_order_consistent() {
                return Ok(());
            }
            let (_, body) = split_frontmatter(&text);
            return adopt_plan(ctx, wf, body.to_string()).await;
        }
    }

    let analysis = match ctx.writer.read_consolidated_analysis()? {
        Some(text) => split_frontmatter(&text).1.to_string(),
        None => wf.effective_prompt().to_string(),
    };

    let pool = ctx.agents.pool_for(wf.mode);
    let agent_names: Vec<String> = pool.iter().map(|a| a.name().to_string()).collect();
    let mut prompt = build_plan_prompt(&analysis, &agent_names);
    if let Some(feedback) = &feedback {
        prompt.push_str(&format!(
            "\n\n## Reviewer feedback on the previous plan\n\n{feedback}\n"
        ));
    }
    let timeout = ctx.config.timeouts.agent_timeout();

    let mut futures = Vec::new();
    for invoker in &pool {
        ctx.publish(
            wf,
            EventPayload::AgentStarted {
                agent: invoker.name().to_string(),
                model: invoker.default_model().map(str::to_string),
                round: 1,
            },
        );
        let invoker = Arc::clone(invoker);
        let cancel = ctx.cancel.clone();
        let prompt = prompt.clone();
        futures.push(async move {
            let name = invoker.name().to_string();
            let result = invoker
                .run(AgentRequest::new(&prompt, timeout), &cancel)
                .await;
            (name, result)
        });
    }

    let mut plans: Vec<AgentOutput> = Vec::new();
    for (name, result) in join_all(futures).await {
        match result {
            Ok(res) => {
                ctx.publish(
                    wf,
                    EventPayload::AgentFinished {
                        agent: name.clone(),
                        round: 1,
                        success: res.succeeded(),
                        duration_ms: res.duration.as_millis() as u64,
                    },
                );
                wf.record_usage(res.tokens_in, res.tokens_out, res.cost_usd);
                if res.succeeded() && !res.text.trim().is_empty() {
                    ctx.writer.write_plan(&name, &res.text)?;
                    plans.push(AgentOutput {
                        agent: name,
                        text: res.text,
                    });
                } else {
                    warn!(agent = %name, "planner produced no usable plan");
                }
            }
            Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
            Err(err) => {
                warn!(agent = %name, %err, "planner failed");
                ctx.publish(
                    wf,
                    EventPayload::AgentFinished {
                        agent: name,
                        round: 1,
                        success: false,
                        duration_ms: 0,
                    },
                );
            }
        }
    }
    ctx.check_cancelled()?;
    ctx.save(wf)?;

    if plans.is_empty() {
        return Err(QuorumError::InsufficientAgents {
            succeeded: 0,
            required: 1,
        });
    }

    let final_text = if plans.len() == 1 {
        plans.remove(0).text
    } else {
        consolidate_plans(ctx, wf, &plans).await?
    };

    ctx.writer.write_final_plan(&final_text)?;
    adopt_plan(ctx, wf, final_text).await
}

/// Merge candidate plans through the synthesizer, falling back to the first
/// candidate when the synthesizer fails (its manifest already parsed on the
/// planner side, so it is the safest survivor).
async fn consolidate_plans(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    plans: &[AgentOutput],
) -> Result<String> {
    let synthesizer = ctx.agents.synthesizer();
    let prompt = build_plan_consolidation_prompt(plans);
    let request = AgentRequest::new(&prompt, ctx.config.timeouts.agent_timeout());
    match synthesizer.run(request, &ctx.cancel).await {
        Ok(res) if res.succeeded() && !res.text.trim().is_empty() => {
            wf.record_usage(res.tokens_in, res.tokens_out, res.cost_usd);
            ctx.writer
                .write_consolidated_plan(synthesizer.name(), &res.text)?;
            Ok(res.text)
        }
        Err(QuorumError::Cancelled) => Err(QuorumError::Cancelled),
        other => {
            let detail = match other {
                Ok(res) => res.error.unwrap_or_else(|| "empty output".to_string()),
                Err(err) => err.to_string(),
            };
            warn!(workflow_id = %wf.id, %detail, "plan consolidation failed, keeping first plan");
            ctx.writer
                .write_consolidated_plan("aggregate", &plans[0].text)?;
            Ok(plans[0].text.clone())
        }
    }
}

/// Parse and validate the final plan, then commit tasks to the workflow.
async fn adopt_plan(ctx: &PhaseContext, wf: &mut WorkflowState, final_text: String) -> Result<()> {
    let planned = dag::parse_plan(&final_text)?;
    let batches = dag::batch_planned(&planned)?;

    let tasks: Vec<_> = planned
        .iter()
        .cloned()
        .map(|t| t.into_task_state())
        .collect();
    for task in &tasks {
        ctx.writer.write_task_plan(task)?;
    }
    ctx.writer
        .write_execution_graph(&dag::render_execution_graph(&planned, &batches))?;

    wf.set_tasks(tasks);
    ctx.save(wf)?;
    info!(
        workflow_id = %wf.id,
        tasks = wf.task_order.len(),
        batches = batches.len(),
        "plan adopted"
    );
    Ok(())
}
