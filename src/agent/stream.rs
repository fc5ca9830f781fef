//! Parsing of agent CLI output.
//!
//! Two shapes are supported: the Claude CLI's newline-delimited stream-json
//! events, and plain text with a best-effort token/cost trailer. Both reduce
//! to a [`ParsedOutput`]; missing usage fields default to zero rather than
//! failing the call.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

/// Events from the Claude CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Normalized result of one CLI invocation's stdout.
#[derive(Debug, Default)]
pub struct ParsedOutput {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub is_error: bool,
}

/// Parse stream-json output: text blocks accumulate, and the final `result`
/// event supplies the authoritative text plus usage. Lines that are not
/// valid events are kept as plain text.
pub fn parse_stream_output(raw: &str) -> ParsedOutput {
    let mut accumulated = String::new();
    let mut parsed = ParsedOutput::default();
    let mut final_result: Option<String> = None;

    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error,
                usage,
                total_cost_usd,
            }) => {
                final_result = result;
                parsed.is_error = is_error;
                if let Some(usage) = usage {
                    parsed.tokens_in = usage.input_tokens;
                    parsed.tokens_out = usage.output_tokens;
                }
                parsed.cost_usd = total_cost_usd.unwrap_or(0.0);
            }
            Ok(StreamEvent::User {}) | Ok(StreamEvent::System { .. }) => {}
            Err(_) => {
                accumulated.push_str(line);
                accumulated.push('\n');
            }
        }
    }

    parsed.text = final_result.unwrap_or(accumulated);
    parsed
}

static TOKENS_IN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*tokens?[ _-]?in\s*[:=]\s*(\d+)\s*$").unwrap());
static TOKENS_OUT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*tokens?[ _-]?out\s*[:=]\s*(\d+)\s*$").unwrap());
static COST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*cost\s*[:=]\s*\$?([0-9]+(?:\.[0-9]+)?)\s*$").unwrap());

/// Parse plain output: the whole stdout is the text; token counts and cost
/// come from trailer lines like `tokens_in: 120` when the CLI prints them.
pub fn parse_plain_output(raw: &str) -> ParsedOutput {
    let capture_u64 = |re: &Regex| {
        re.captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cost = COST_REGEX
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    ParsedOutput {
        text: raw.to_string(),
        tokens_in: capture_u64(&TOKENS_IN_REGEX),
        tokens_out: capture_u64(&TOKENS_OUT_REGEX),
        cost_usd: cost,
        is_error: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_output_prefers_result_text() {
        let raw = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]}}"#,
            "\n",
            r#"{"type":"result","result":"final answer","is_error":false,"usage":{"input_tokens":120,"output_tokens":45},"total_cost_usd":0.0134}"#,
        );
        let parsed = parse_stream_output(raw);
        assert_eq!(parsed.text, "final answer");
        assert_eq!(parsed.tokens_in, 120);
        assert_eq!(parsed.tokens_out, 45);
        assert!((parsed.cost_usd - 0.0134).abs() < 1e-12);
        assert!(!parsed.is_error);
    }

    #[test]
    fn test_parse_stream_output_accumulates_without_result() {
        let raw = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"part one"}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"part two"}]}}"#,
        );
        let parsed = parse_stream_output(raw);
        assert!(parsed.text.contains("part one"));
        assert!(parsed.text.contains("part two"));
        assert_eq!(parsed.tokens_in, 0);
    }

    #[test]
    fn test_parse_stream_output_keeps_non_json_lines() {
        let parsed = parse_stream_output("not json at all\n");
        assert!(parsed.text.contains("not json at all"));
    }

    #[test]
    fn test_parse_stream_error_flag() {
        let raw = r#"{"type":"result","result":"boom","is_error":true}"#;
        let parsed = parse_stream_output(raw);
        assert!(parsed.is_error);
        assert_eq!(parsed.text, "boom");
    }

    #[test]
    fn test_parse_plain_output_trailer() {
        let raw = "Here is my analysis.\n\ntokens_in: 300\ntokens_out: 80\ncost: $0.05\n";
        let parsed = parse_plain_output(raw);
        assert!(parsed.text.contains("Here is my analysis."));
        assert_eq!(parsed.tokens_in, 300);
        assert_eq!(parsed.tokens_out, 80);
        assert!((parsed.cost_usd - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_parse_plain_output_missing_trailer_defaults_zero() {
        let parsed = parse_plain_output("just text");
        assert_eq!(parsed.tokens_in, 0);
        assert_eq!(parsed.tokens_out, 0);
        assert_eq!(parsed.cost_usd, 0.0);
    }
}
