//! Refine phase: one agent call that sharpens the user prompt.
//!
//! Refinement is best-effort. Any failure falls back to the original prompt
//! with a warning; the phase never fails the workflow. Only cancellation
//! propagates.

use super::PhaseContext;
use super::prompts::build_refine_prompt;
use crate::agent::AgentRequest;
use crate::errors::{QuorumError, Result};
use crate::event::EventPayload;
use crate::state::WorkflowState;
use tracing::{info, warn};

pub async fn run(ctx: &PhaseContext, wf: &mut WorkflowState) -> Result<()> {
    if wf.refined_prompt.is_some() {
        // Resume: the artifact already exists.
        return Ok(());
    }

    let refiner = ctx.agents.refiner();
    let request = AgentRequest::new(
        &build_refine_prompt(&wf.prompt),
        ctx.config.timeouts.agent_timeout(),
    );

    ctx.publish(
        wf,
        EventPayload::AgentStarted {
            agent: refiner.name().to_string(),
            model: refiner.default_model().map(str::to_string),
            round: 0,
        },
    );

    match refiner.run(request, &ctx.cancel).await {
        Ok(result) => {
            ctx.publish(
                wf,
                EventPayload::AgentFinished {
                    agent: refiner.name().to_string(),
                    round: 0,
                    success: result.succeeded(),
                    duration_ms: result.duration.as_millis() as u64,
                },
            );
            wf.record_usage(result.tokens_in, result.tokens_out, result.cost_usd);
            if result.succeeded() && !result.text.trim().is_empty() {
                let refined = result.text.trim().to_string();
                ctx.writer.write_refined_prompt(refiner.name(), &refined)?;
                wf.refined_prompt = Some(refined);
                info!(workflow_id = %wf.id, "prompt refined");
            } else {
                warn!(
                    workflow_id = %wf.id,
                    error = result.error.as_deref().unwrap_or("empty output"),
                    "refinement failed, using original prompt"
                );
            }
            ctx.save(wf)?;
            Ok(())
        }
        Err(QuorumError::Cancelled) => Err(QuorumError::Cancelled),
        Err(err) => {
            warn!(workflow_id = %wf.id, %err, "refinement errored, using original prompt");
            ctx.save(wf)?;
            Ok(())
        }
    }
}
