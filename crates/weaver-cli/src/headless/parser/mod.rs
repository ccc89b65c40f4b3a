//! Per-provider stream-JSON parsers over a shared classification core.
//!
//! Every provider CLI writes newline-delimited JSON to stdout in its own
//! schema. Each parser normalizes those frames into [`OutputEvent`]s; the
//! shared [`BaseParser`] owns the context-window bookkeeping, the
//! exhaustion-message heuristics and the polymorphic error-field decoding
//! that several providers share.

mod amp;
mod claude;
mod codex;
mod gemini;
mod opencode;

pub use amp::AmpParser;
pub use claude::ClaudeParser;
pub use codex::CodexParser;
pub use gemini::GeminiParser;
pub use opencode::OpencodeParser;

use crate::headless::event::{ErrorInfo, ErrorReason, OutputEvent, UsageInfo};

/// Context window applied when a model family has no override.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Case-insensitive substrings that mark a context-window exhaustion,
/// regardless of which provider produced the message.
const EXHAUSTION_PATTERNS: &[&str] = &[
    "prompt is too long",
    "context window exceeded",
    "context exceeded",
    "context limit",
    "token limit",
    "maximum context length",
];

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized frame: {0}")]
    UnknownFrame(String),
}

/// Normalizes one provider's raw stdout lines.
pub trait EventParser: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Parse one stdout line into a normalized event. The caller stamps
    /// `raw` and `timestamp`; parsers fill everything else.
    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError>;

    /// Called on every event. Providers that only announce the session in
    /// later frames return it from whichever frame carries it; the first
    /// non-empty value wins upstream.
    fn extract_session_ref(&self, event: &OutputEvent, raw: &[u8]) -> Option<String> {
        let _ = raw;
        event.session_ref.clone().filter(|s| !s.is_empty())
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool;
}

/// Shared parser state and heuristics.
#[derive(Debug, Clone)]
pub struct BaseParser {
    context_window: u64,
}

impl BaseParser {
    pub fn new(context_window: u64) -> Self {
        Self { context_window }
    }

    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    pub fn matches_exhaustion(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        EXHAUSTION_PATTERNS.iter().any(|p| lower.contains(p))
    }

    pub fn classify_reason(&self, message: &str, code: &str) -> ErrorReason {
        let lower_code = code.to_lowercase();
        if self.matches_exhaustion(message) {
            ErrorReason::ContextExceeded
        } else if lower_code.contains("rate_limit") || message.to_lowercase().contains("rate limit")
        {
            ErrorReason::RateLimited
        } else if lower_code.contains("invalid_request") {
            ErrorReason::InvalidRequest
        } else {
            ErrorReason::Unknown
        }
    }

    /// Decode an error field that providers ship in three shapes: an object
    /// `{"message": ..., "code": ...}`, a plain string, or the
    /// `"<http-code> {nested-json-error}"` string at least one provider
    /// produces on HTTP failures.
    pub fn parse_error_value(&self, value: &serde_json::Value) -> ErrorInfo {
        let (message, code) = match value {
            serde_json::Value::Object(map) => {
                let message = map
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let code = map
                    .get("code")
                    .or_else(|| map.get("type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (message, code)
            },
            serde_json::Value::String(s) => self.parse_wire_error_string(s),
            other => (other.to_string(), String::new()),
        };
        let reason = self.classify_reason(&message, &code);
        ErrorInfo { message, code, reason }
    }

    /// Handle `"413 {\"type\":\"error\",\"error\":{...}}"` strings. Falls
    /// back to the whole string as the message.
    fn parse_wire_error_string(&self, s: &str) -> (String, String) {
        if let Some((head, rest)) = s.split_once(' ') {
            let rest = rest.trim_start();
            if head.parse::<u16>().is_ok() && rest.starts_with('{') {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(rest) {
                    let nested = value.get("error").unwrap_or(&value);
                    let message = nested
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or(s)
                        .to_string();
                    let code = nested
                        .get("type")
                        .or_else(|| nested.get("code"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    return (message, code);
                }
            }
        }
        (s.to_string(), String::new())
    }

    /// Shared exhaustion check: an already-classified error reason, an
    /// error message matching the pattern set, or reported usage at or past
    /// the window.
    pub fn event_exhausted(&self, event: &OutputEvent) -> bool {
        if let Some(error) = &event.error {
            if error.reason == ErrorReason::ContextExceeded || self.matches_exhaustion(&error.message) {
                return true;
            }
        }
        if let Some(usage) = &event.usage {
            if usage.tokens_used >= self.context_window {
                return true;
            }
        }
        false
    }

    /// Normalize provider token counts. `total_tokens` is pinned to the
    /// parser's context window.
    pub fn usage(&self, input_tokens: u64, output_tokens: u64) -> UsageInfo {
        UsageInfo {
            tokens_used: input_tokens + output_tokens,
            total_tokens: self.context_window,
            output_tokens,
        }
    }
}

impl Default for BaseParser {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_WINDOW)
    }
}
