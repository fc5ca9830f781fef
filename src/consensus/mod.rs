//! Consensus moderation: structured judgments, the fallback moderator chain,
//! and the iterative round decision rule.

mod judgment;
mod moderator;

pub use judgment::{CategoryScores, Divergence, ModeratorJudgment, parse_judgment};
pub use moderator::{
    ConsensusEngine, RoundDecision, RoundJudgment, SCORE_EPSILON, build_moderator_prompt,
};
