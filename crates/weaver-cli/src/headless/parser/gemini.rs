//! Parser for Gemini CLI stream-JSON frames.

use serde::Deserialize;

use super::{BaseParser, EventParser, ParseError};
use crate::headless::event::{
    ContentBlock,
    MessageContent,
    OutputEvent,
    OutputEventKind,
    ToolContent,
};

#[derive(Debug, Deserialize)]
struct GeminiFrame {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cwd: Option<String>,
    model: Option<String>,
    content: Option<String>,
    tool: Option<GeminiTool>,
    stats: Option<GeminiStats>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiTool {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiStats {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    duration_ms: Option<u64>,
}

pub struct GeminiParser {
    base: BaseParser,
}

impl GeminiParser {
    pub fn new(base: BaseParser) -> Self {
        Self { base }
    }
}

impl Default for GeminiParser {
    fn default() -> Self {
        // Gemini models ship a 1M window; the parser still defaults
        // conservatively and relies on the per-model override.
        Self::new(BaseParser::new(1_000_000))
    }
}

impl EventParser for GeminiParser {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError> {
        let frame: GeminiFrame = serde_json::from_slice(line)?;

        let kind = match frame.kind.as_str() {
            "system" => OutputEventKind::System,
            "assistant" => OutputEventKind::Assistant,
            "tool_use" => OutputEventKind::ToolUse,
            "tool_result" => OutputEventKind::ToolResult,
            "result" => OutputEventKind::Result,
            "error" => OutputEventKind::Error,
            other => return Err(ParseError::UnknownFrame(other.to_string())),
        };

        let mut event = OutputEvent::new(kind);
        event.subkind = frame.subtype;
        event.session_ref = frame.session_id.filter(|s| !s.is_empty());
        event.working_dir = frame.cwd;

        if let Some(content) = frame.content {
            event.message = Some(MessageContent {
                role: "assistant".to_string(),
                model: frame.model.unwrap_or_default(),
                blocks: vec![ContentBlock::Text(content)],
            });
        }
        if let Some(tool) = frame.tool {
            event.tool = Some(ToolContent {
                id: tool.id,
                name: tool.name,
                input: tool.args,
                output: tool.result,
            });
        }
        if let Some(stats) = frame.stats {
            event.usage = Some(self.base.usage(stats.prompt_tokens, stats.completion_tokens));
            event.duration_ms = stats.duration_ms;
        }
        if let Some(raw_error) = frame.error {
            event.error = Some(self.base.parse_error_value(&raw_error));
            if event.kind == OutputEventKind::Result {
                event.is_error_result = true;
            }
        }

        Ok(event)
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool {
        self.base.event_exhausted(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_with_stats() {
        let parser = GeminiParser::default();
        let line = br#"{"type":"result","subtype":"success","sessionId":"g-1","stats":{"prompt_tokens":12000,"completion_tokens":900,"duration_ms":3100}}"#;
        let event = parser.parse_event(line).unwrap();
        assert_eq!(event.kind, OutputEventKind::Result);
        assert_eq!(event.duration_ms, Some(3100));
        assert_eq!(event.usage.unwrap().tokens_used, 12900);
    }

    #[test]
    fn test_parse_error_object() {
        let parser = GeminiParser::default();
        let line = br#"{"type":"error","error":{"message":"quota exhausted","code":"rate_limit_exceeded"}}"#;
        let event = parser.parse_event(line).unwrap();
        assert_eq!(
            event.error.as_ref().unwrap().reason,
            crate::headless::event::ErrorReason::RateLimited
        );
    }
}
