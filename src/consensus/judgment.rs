//! Structured moderator judgments and their extraction from raw output.
//!
//! Moderators are asked for a fenced JSON object, but model output is not a
//! protocol: extraction degrades from fenced JSON, to the first bare JSON
//! object, to a `CONSENSUS_SCORE: <x>` line that yields a score-only
//! judgment. A `None` from [`parse_judgment`] means the attempt is discarded
//! and the fallback chain continues.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// One disagreement between two or more agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Divergence {
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "type")]
    pub divergence_type: String,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Per-category sub-scores.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    #[serde(default)]
    pub claims: Option<f64>,
    #[serde(default)]
    pub risks: Option<f64>,
    #[serde(default)]
    pub recommendations: Option<f64>,
}

/// The moderator's verdict for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorJudgment {
    #[serde(alias = "consensus_score")]
    pub score: f64,
    #[serde(default)]
    pub agreements: Vec<String>,
    #[serde(default)]
    pub divergences: Vec<Divergence>,
    #[serde(default)]
    pub category_scores: CategoryScores,
}

impl ModeratorJudgment {
    pub fn score_only(score: f64) -> Self {
        Self {
            score,
            agreements: Vec::new(),
            divergences: Vec::new(),
            category_scores: CategoryScores::default(),
        }
    }

    /// Render divergences for the next-round revision prompt.
    pub fn divergence_summary(&self) -> String {
        if self.divergences.is_empty() {
            return "(no divergences reported)".to_string();
        }
        self.divergences
            .iter()
            .map(|d| {
                let agents = if d.agents.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", d.agents.join(", "))
                };
                format!("- {}{agents}: {}", d.divergence_type, d.description)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

static FENCED_JSON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

static SCORE_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*consensus[_ -]?score\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)\s*$").unwrap()
});

/// Extract a judgment from raw moderator output. Returns `None` when nothing
/// parseable is present; the caller treats that as a failed attempt.
pub fn parse_judgment(text: &str) -> Option<ModeratorJudgment> {
    if let Some(caps) = FENCED_JSON_REGEX.captures(text) {
        if let Ok(judgment) = serde_json::from_str::<ModeratorJudgment>(&caps[1]) {
            if judgment.score.is_finite() {
                return Some(judgment);
            }
        }
    }

    // Bare JSON object somewhere in the text.
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(judgment) = serde_json::from_str::<ModeratorJudgment>(&text[start..=end]) {
                if judgment.score.is_finite() {
                    return Some(judgment);
                }
            }
        }
    }

    // Last resort: a bare score line.
    if let Some(caps) = SCORE_LINE_REGEX.captures(text) {
        if let Ok(score) = caps[1].parse::<f64>() {
            if score.is_finite() {
                return Some(ModeratorJudgment::score_only(score));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_json() {
        let text = r#"
Here is my assessment.

```json
{
  "score": 0.87,
  "agreements": ["both flag the retry bug"],
  "divergences": [
    {"description": "disagree on cache design", "type": "approach", "agents": ["claude", "gemini"]}
  ],
  "category_scores": {"claims": 0.9, "risks": 0.8, "recommendations": 0.85}
}
```
"#;
        let judgment = parse_judgment(text).unwrap();
        assert!((judgment.score - 0.87).abs() < 1e-12);
        assert_eq!(judgment.agreements.len(), 1);
        assert_eq!(judgment.divergences[0].divergence_type, "approach");
        assert_eq!(judgment.divergences[0].agents, vec!["claude", "gemini"]);
        assert_eq!(judgment.category_scores.claims, Some(0.9));
    }

    #[test]
    fn test_parse_bare_json() {
        let text = r#"assessment: {"consensus_score": 0.72, "agreements": []}"#;
        let judgment = parse_judgment(text).unwrap();
        assert!((judgment.score - 0.72).abs() < 1e-12);
    }

    #[test]
    fn test_parse_score_line_fallback() {
        let judgment = parse_judgment("blah blah\nCONSENSUS_SCORE: 0.65\nmore prose").unwrap();
        assert!((judgment.score - 0.65).abs() < 1e-12);
        assert!(judgment.divergences.is_empty());
    }

    #[test]
    fn test_unparseable_returns_none() {
        assert!(parse_judgment("I think they mostly agree.").is_none());
        assert!(parse_judgment("").is_none());
        assert!(parse_judgment("{\"notascore\": true}").is_none());
    }

    #[test]
    fn test_divergence_summary_renders_agents() {
        let judgment = ModeratorJudgment {
            score: 0.5,
            agreements: vec![],
            divergences: vec![Divergence {
                description: "different error models".into(),
                divergence_type: "design".into(),
                agents: vec!["a".into(), "b".into()],
            }],
            category_scores: CategoryScores::default(),
        };
        let summary = judgment.divergence_summary();
        assert!(summary.contains("design"));
        assert!(summary.contains("[a, b]"));
    }
}
