//! Secret scrubbing for prompts, logs, and reports.
//!
//! The redactor runs before a subprocess ever sees a prompt and before any
//! agent text is logged or written to an artifact, so a leaked credential in
//! a user prompt never reaches a child process command line, a log line, or
//! a run directory.

use crate::config::RedactionConfig;
use crate::errors::{QuorumError, Result};
use regex::Regex;

const REPLACEMENT: &str = "[REDACTED]";

#[derive(Debug)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn from_config(config: &RedactionConfig) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.patterns.len());
        for raw in &config.patterns {
            let compiled = Regex::new(raw).map_err(|e| {
                QuorumError::InvalidArgument(format!("bad redaction pattern {raw:?}: {e}"))
            })?;
            patterns.push(compiled);
        }
        Ok(Self { patterns })
    }

    /// A redactor that scrubs nothing.
    pub fn noop() -> Self {
        Self { patterns: Vec::new() }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, REPLACEMENT).into_owned();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_scrub_common_secrets() {
        let redactor = Redactor::from_config(&RedactionConfig::default()).unwrap();
        let scrubbed = redactor.redact(
            "use api_key=abc123secret and sk-0123456789abcdef0123 plus Bearer abcdefghijklmnopqr",
        );
        assert!(!scrubbed.contains("abc123secret"));
        assert!(!scrubbed.contains("sk-0123456789abcdef0123"));
        assert!(!scrubbed.contains("abcdefghijklmnopqr"));
        assert!(scrubbed.contains(REPLACEMENT));
    }

    #[test]
    fn test_clean_text_passes_through() {
        let redactor = Redactor::from_config(&RedactionConfig::default()).unwrap();
        let text = "analyze the retry logic in src/net.rs";
        assert_eq!(redactor.redact(text), text);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = RedactionConfig {
            patterns: vec!["([unclosed".to_string()],
        };
        assert!(Redactor::from_config(&config).is_err());
    }
}
