//! Analyze phase: parallel agent analyses graded by the consensus moderator.
//!
//! Within a round every enabled agent runs concurrently; rounds themselves
//! are sequential. The moderator's promoted judgment decides whether to
//! advance (synthesize a consolidated analysis), run round n+1 with the
//! divergences fed back, or give up, which in interactive mode becomes a
//! review gate instead of a phase failure.
//!
//! Commit points: after a round's outputs are collected, and after each
//! promoted judgment. Resume inspects the artifact tree and continues after
//! the last promoted round rather than repeating it. A reviewer rejection
//! re-enters through [`rerun_after_rejection`], which forces a fresh round
//! instead of short-circuiting on the existing consolidated artifact.

use super::PhaseContext;
use super::prompts::{build_analysis_prompt, build_revision_prompt, build_synthesis_prompt};
use crate::agent::{AgentInvoker, AgentOutput, AgentRequest};
use crate::consensus::{RoundDecision, parse_judgment};
use crate::errors::{QuorumError, Result};
use crate::event::EventPayload;
use crate::report::split_frontmatter;
use crate::state::WorkflowState;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the analyze phase ended, short of an error.
pub enum AnalyzeOutcome {
    /// Consensus reached and the consolidated analysis was written.
    Advanced,
    /// Rounds exhausted below threshold in interactive mode; the runner
    /// surfaces a review gate. `outputs` is the final round's set so an
    /// approval can still synthesize.
    NeedsReview {
        outputs: Vec<AgentOutput>,
        score: f64,
        rounds: u32,
    },
}

struct RevisionContext {
    prior_by_agent: HashMap<String, String>,
    divergences: String,
}

impl RevisionContext {
    fn from_outputs(outputs: &[AgentOutput], divergences: String) -> Self {
        Self {
            prior_by_agent: outputs
                .iter()
                .map(|o| (o.agent.clone(), o.text.clone()))
                .collect(),
            divergences,
        }
    }
}

pub async fn run(ctx: &PhaseContext, wf: &mut WorkflowState) -> Result<AnalyzeOutcome> {
    if ctx.writer.consolidated_analysis_exists() {
        // Resume: analysis already concluded.
        return Ok(AnalyzeOutcome::Advanced);
    }

    let engine = ctx.consensus_engine();
    let mut start_round: u32 = 1;
    let mut revision: Option<RevisionContext> = None;

    // Resume mid-phase: pick up after the last promoted round.
    if let Some(last) = ctx.writer.latest_promoted_round() {
        if let Some(text) = ctx.writer.read_round(last)? {
            let (_, body) = split_frontmatter(&text);
            if let Some(judgment) = parse_judgment(body) {
                let score = judgment.score.clamp(0.0, 1.0);
                let outputs = stored_outputs(ctx, last)?;
                match engine.decide(score, last) {
                    RoundDecision::Advance => {
                        debug!(workflow_id = %wf.id, round = last, "resume: consensus already reached");
                        consolidate(ctx, wf, &outputs).await?;
                        return Ok(AnalyzeOutcome::Advanced);
                    }
                    RoundDecision::Iterate => {
                        revision = Some(RevisionContext::from_outputs(
                            &outputs,
                            judgment.divergence_summary(),
                        ));
                        start_round = last + 1;
                    }
                    RoundDecision::Fail => {
                        return finish_without_consensus(ctx, wf, outputs, score, last);
                    }
                }
            }
        }
    }

    run_rounds(ctx, wf, start_round, revision).await
}

/// Re-enter the phase after a reviewer rejected the analysis: discard the
/// consolidated artifact and run a fresh round seeded with the reviewer's
/// feedback as the divergence to address.
pub async fn rerun_after_rejection(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    feedback: Option<String>,
) -> Result<AnalyzeOutcome> {
    ctx.writer.discard_consolidated_analysis()?;
    let last = ctx.writer.latest_promoted_round().unwrap_or(0);
    let divergences = feedback
        .unwrap_or_else(|| "a human reviewer rejected the analysis as-is".to_string());
    let revision = if last > 0 {
        let outputs = stored_outputs(ctx, last)?;
        Some(RevisionContext::from_outputs(
            &outputs,
            format!("- review: {divergences}"),
        ))
    } else {
        None
    };
    run_rounds(ctx, wf, last + 1, revision).await
}

async fn run_rounds(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    start_round: u32,
    mut revision: Option<RevisionContext>,
) -> Result<AnalyzeOutcome> {
    let pool = ctx.agents.pool_for(wf.mode);
    // A single-agent workflow cannot satisfy a multi-agent floor; the
    // effective floor never exceeds the pool size.
    let mut settings = ctx.config.consensus.clone();
    settings.min_successful_agents = settings.min_successful_agents.min(pool.len().max(1));
    let engine = crate::consensus::ConsensusEngine::new(
        ctx.agents.moderator_chain(),
        settings,
        ctx.config.timeouts.moderator_timeout(),
    );
    let mut round = start_round;

    loop {
        ctx.check_cancelled()?;
        let outputs = run_round(ctx, wf, &pool, round, revision.as_ref()).await?;

        let judged = engine
            .judge_round(round, &outputs, &ctx.writer, &ctx.cancel)
            .await?;
        let score = judged.judgment.score;
        wf.consensus_score = Some(score);
        wf.record_usage(judged.tokens_in, judged.tokens_out, judged.cost_usd);
        ctx.save(wf)?;

        ctx.publish(
            wf,
            EventPayload::ConsensusScore {
                round,
                score,
                moderator: judged.moderator.clone(),
            },
        );
        if engine.below_warning(score) {
            warn!(workflow_id = %wf.id, round, score, "consensus score below warning threshold");
            ctx.publish(
                wf,
                EventPayload::ConsensusWarning {
                    round,
                    score,
                    threshold: engine.settings().warning_threshold,
                },
            );
        }

        match engine.decide(score, round) {
            RoundDecision::Advance => {
                info!(workflow_id = %wf.id, round, score, "consensus reached");
                consolidate(ctx, wf, &outputs).await?;
                return Ok(AnalyzeOutcome::Advanced);
            }
            RoundDecision::Iterate => {
                debug!(workflow_id = %wf.id, round, score, "starting another round");
                revision = Some(RevisionContext::from_outputs(
                    &outputs,
                    judged.judgment.divergence_summary(),
                ));
                round += 1;
            }
            RoundDecision::Fail => {
                return finish_without_consensus(ctx, wf, outputs, score, round);
            }
        }
    }
}

fn finish_without_consensus(
    ctx: &PhaseContext,
    wf: &WorkflowState,
    outputs: Vec<AgentOutput>,
    score: f64,
    rounds: u32,
) -> Result<AnalyzeOutcome> {
    if ctx.control.is_interactive() {
        return Ok(AnalyzeOutcome::NeedsReview {
            outputs,
            score,
            rounds,
        });
    }
    Err(QuorumError::NoConsensus {
        rounds,
        score,
        threshold: ctx.config.consensus.threshold,
    })
}

/// Run every agent in the pool concurrently for one round, write the
/// per-agent `v<n>` artifacts, and return the usable outputs.
async fn run_round(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    pool: &[Arc<dyn AgentInvoker>],
    round: u32,
    revision: Option<&RevisionContext>,
) -> Result<Vec<AgentOutput>> {
    let prompt = wf.effective_prompt().to_string();
    let timeout = ctx.config.timeouts.agent_timeout();

    let mut futures = Vec::new();
    for invoker in pool {
        let agent_prompt = match revision {
            Some(rev) => match rev.prior_by_agent.get(invoker.name()) {
                Some(prior) => build_revision_prompt(&prompt, prior, &rev.divergences, round),
                None => build_analysis_prompt(&prompt),
            },
            None => build_analysis_prompt(&prompt),
        };
        ctx.publish(
            wf,
            EventPayload::AgentStarted {
                agent: invoker.name().to_string(),
                model: invoker.default_model().map(str::to_string),
                round,
            },
        );
        let invoker = Arc::clone(invoker);
        let cancel = ctx.cancel.clone();
        futures.push(async move {
            let name = invoker.name().to_string();
            let model = invoker.default_model().map(str::to_string);
            let result = invoker
                .run(AgentRequest::new(&agent_prompt, timeout), &cancel)
                .await;
            (name, model, result)
        });
    }

    let mut outputs = Vec::new();
    for (name, model, result) in join_all(futures).await {
        match result {
            Ok(res) => {
                ctx.publish(
                    wf,
                    EventPayload::AgentFinished {
                        agent: name.clone(),
                        round,
                        success: res.succeeded(),
                        duration_ms: res.duration.as_millis() as u64,
                    },
                );
                wf.record_usage(res.tokens_in, res.tokens_out, res.cost_usd);
                if res.succeeded() && !res.text.trim().is_empty() {
                    ctx.writer
                        .write_analysis(&name, model.as_deref(), round, &res.text)?;
                    outputs.push(AgentOutput {
                        agent: name,
                        text: res.text,
                    });
                } else {
                    warn!(
                        agent = %name,
                        round,
                        error = res.error.as_deref().unwrap_or("empty output"),
                        "agent produced no usable analysis"
                    );
                }
            }
            Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
            Err(err) => {
                // A timed-out or failed agent costs the round one voice; the
                // round proceeds if enough others succeeded.
                warn!(agent = %name, round, %err, "agent failed in round");
                ctx.publish(
                    wf,
                    EventPayload::AgentFinished {
                        agent: name,
                        round,
                        success: false,
                        duration_ms: 0,
                    },
                );
            }
        }
    }

    ctx.check_cancelled()?;
    ctx.save(wf)?;
    ctx.publish(
        wf,
        EventPayload::TokenUpdate {
            tokens_in: wf.tokens_in,
            tokens_out: wf.tokens_out,
            cost_usd: wf.cost_usd,
        },
    );
    Ok(outputs)
}

/// Ask the synthesizer for the consolidated analysis. A synthesizer failure
/// degrades to a mechanical concatenation rather than failing the phase.
pub async fn consolidate(
    ctx: &PhaseContext,
    wf: &mut WorkflowState,
    outputs: &[AgentOutput],
) -> Result<()> {
    let synthesizer = ctx.agents.synthesizer();
    let prompt = build_synthesis_prompt(wf.effective_prompt(), outputs);
    let request = AgentRequest::new(&prompt, ctx.config.timeouts.agent_timeout());

    match synthesizer.run(request, &ctx.cancel).await {
        Ok(res) if res.succeeded() && !res.text.trim().is_empty() => {
            wf.record_usage(res.tokens_in, res.tokens_out, res.cost_usd);
            ctx.writer
                .write_consolidated_analysis(synthesizer.name(), &res.text)?;
        }
        Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
        other => {
            let detail = match other {
                Ok(res) => res.error.unwrap_or_else(|| "empty output".to_string()),
                Err(err) => err.to_string(),
            };
            warn!(workflow_id = %wf.id, %detail, "synthesizer failed, concatenating analyses");
            let mut body = String::new();
            for output in outputs {
                body.push_str(&format!("## {}\n\n{}\n\n", output.agent, output.text));
            }
            ctx.writer.write_consolidated_analysis("aggregate", &body)?;
        }
    }
    ctx.save(wf)?;
    Ok(())
}

fn stored_outputs(ctx: &PhaseContext, round: u32) -> Result<Vec<AgentOutput>> {
    Ok(ctx
        .writer
        .read_round_analyses(round)?
        .into_iter()
        .map(|(agent, text)| AgentOutput { agent, text })
        .collect())
}
