//! The consensus round engine.
//!
//! Given N parallel agent outputs for one round, consult the moderator chain
//! (primary first, fallbacks in order) until one produces a parseable
//! judgment, and atomically promote that attempt to the official round file.
//! A round moves `idle → round_running → parsing → promoted → decided`; the
//! promotion is the commit point, so the official `round-<n>.md` only ever
//! exists for a judgment that parsed and validated. Each moderator is
//! single-shot within a round: a failed invocation moves to the next
//! fallback, never retries the same moderator.

use super::judgment::{ModeratorJudgment, parse_judgment};
use crate::agent::{AgentInvoker, AgentOutput, AgentRequest};
use crate::config::ConsensusConfig;
use crate::errors::{QuorumError, Result};
use crate::report::ReportWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed epsilon for all score comparisons.
pub const SCORE_EPSILON: f64 = 1e-9;

/// What the engine says to do after a judged round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDecision {
    /// Score met the threshold with the minimum rounds satisfied.
    Advance,
    /// Run another round with the moderator's divergences fed back.
    Iterate,
    /// Out of rounds below threshold; the phase fails (or surfaces a review
    /// gate in interactive mode, which is the caller's translation).
    Fail,
}

/// A promoted judgment for one round.
#[derive(Debug, Clone)]
pub struct RoundJudgment {
    pub round: u32,
    pub judgment: ModeratorJudgment,
    pub moderator: String,
    pub attempt: u32,
    pub official_path: PathBuf,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Drives moderator attempts and decisions for one workflow's rounds.
pub struct ConsensusEngine {
    chain: Vec<Arc<dyn AgentInvoker>>,
    settings: ConsensusConfig,
    timeout: Duration,
}

impl ConsensusEngine {
    pub fn new(
        chain: Vec<Arc<dyn AgentInvoker>>,
        settings: ConsensusConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            chain,
            settings,
            timeout,
        }
    }

    pub fn settings(&self) -> &ConsensusConfig {
        &self.settings
    }

    /// Ask the moderator chain to grade one round of agent outputs.
    ///
    /// Refuses to judge an incomplete set: fewer than
    /// `min_successful_agents` usable outputs abandons the round with
    /// `<InsufficientAgents>` before any moderator is consulted.
    pub async fn judge_round(
        &self,
        round: u32,
        outputs: &[AgentOutput],
        writer: &ReportWriter,
        cancel: &CancellationToken,
    ) -> Result<RoundJudgment> {
        if outputs.len() < self.settings.min_successful_agents {
            return Err(QuorumError::InsufficientAgents {
                succeeded: outputs.len(),
                required: self.settings.min_successful_agents,
            });
        }

        let prompt = build_moderator_prompt(round, outputs);
        for (index, moderator) in self.chain.iter().enumerate() {
            let attempt = (index + 1) as u32;
            if cancel.is_cancelled() {
                return Err(QuorumError::Cancelled);
            }
            let name = moderator.name().to_string();
            debug!(round, attempt, moderator = %name, "consulting moderator");

            let request = AgentRequest::new(&prompt, self.timeout);
            let result = match moderator.run(request, cancel).await {
                Ok(result) => result,
                Err(QuorumError::Cancelled) => return Err(QuorumError::Cancelled),
                Err(err) => {
                    warn!(round, moderator = %name, %err, "moderator invocation failed");
                    writer.write_moderator_attempt(
                        round,
                        attempt,
                        &name,
                        &format!("moderator invocation failed: {err}"),
                    )?;
                    continue;
                }
            };

            // Raw response is recorded whether or not it parses.
            writer.write_moderator_attempt(round, attempt, &name, &result.text)?;

            if let Some(error) = &result.error {
                warn!(round, moderator = %name, %error, "moderator reported an error");
                continue;
            }

            let Some(mut judgment) = parse_judgment(&result.text) else {
                warn!(round, moderator = %name, "moderator response was unparseable");
                continue;
            };

            if judgment.score < 0.0 || judgment.score > 1.0 {
                warn!(
                    round,
                    moderator = %name,
                    score = judgment.score,
                    "moderator score outside [0, 1], clamping"
                );
                judgment.score = judgment.score.clamp(0.0, 1.0);
            }

            // Commit point: from here the official round file exists.
            let official_path = writer.promote_moderator_attempt(round, attempt, &name)?;
            return Ok(RoundJudgment {
                round,
                judgment,
                moderator: name,
                attempt,
                official_path,
                tokens_in: result.tokens_in,
                tokens_out: result.tokens_out,
                cost_usd: result.cost_usd,
            });
        }

        Err(QuorumError::ModeratorUnavailable { round })
    }

    /// Decision rule over `(score, round)`.
    pub fn decide(&self, score: f64, round: u32) -> RoundDecision {
        if self.meets_threshold(score) && round >= self.settings.min_rounds {
            RoundDecision::Advance
        } else if round < self.settings.max_rounds {
            RoundDecision::Iterate
        } else {
            RoundDecision::Fail
        }
    }

    /// Score comparison with the fixed epsilon: exactly-at-threshold passes.
    pub fn meets_threshold(&self, score: f64) -> bool {
        score + SCORE_EPSILON >= self.settings.threshold
    }

    /// Whether a round should raise a `consensus_warning` (without changing
    /// control flow).
    pub fn below_warning(&self, score: f64) -> bool {
        score + SCORE_EPSILON < self.settings.warning_threshold
    }
}

/// Prompt asking a moderator to grade a round of analyses.
pub fn build_moderator_prompt(round: u32, outputs: &[AgentOutput]) -> String {
    let mut sections = String::new();
    for output in outputs {
        sections.push_str(&format!(
            "## Output from agent `{}`\n\n{}\n\n",
            output.agent, output.text
        ));
    }
    format!(
        r#"You are the consensus moderator for round {round}. {count} agents analyzed the same problem independently. Grade how closely they agree.

{sections}## Your judgment

Respond with exactly one fenced JSON object:

```json
{{
  "score": <overall consensus in [0,1]>,
  "agreements": ["<point both/all agents share>", ...],
  "divergences": [
    {{"description": "<what differs>", "type": "<claim|risk|recommendation|approach>", "agents": ["<name>", ...]}}
  ],
  "category_scores": {{"claims": <0..1>, "risks": <0..1>, "recommendations": <0..1>}}
}}
```

Score 1.0 means the outputs are interchangeable; 0.0 means they contradict on fundamentals."#,
        round = round,
        count = outputs.len(),
        sections = sections,
    )
}
