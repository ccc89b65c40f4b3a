//! Parser for Amp CLI stream-JSON frames.
//!
//! Amp announces the owning thread via `threadID`, and not necessarily on
//! the first frame, so session extraction also scans the raw line.

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
struct AmpFrame {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    #[serde(rename = "threadID")]
    thread_id: Option<String>,
    cwd: Option<String>,
    message: Option<AmpMessage>,
    tool: Option<AmpTool>,
    usage: Option<AmpUsage>,
    error: Option<serde_json::Value>,
    cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct AmpMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AmpTool {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    input: serde_json::Value,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AmpUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct AmpParser {
    base: BaseParser,
}

impl AmpParser {
    pub fn new(base: BaseParser) -> Self {
        Self { base }
    }
}

impl Default for AmpParser {
    fn default() -> Self {
        Self::new(BaseParser::default())
    }
}

impl EventParser for AmpParser {
    fn provider(&self) -> &'static str {
        "amp"
    }

    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError> {
        let frame: AmpFrame = serde_json::from_slice(line)?;

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
        event.session_ref = frame.thread_id.filter(|s| !s.is_empty());
        event.working_dir = frame.cwd;
        event.cost_usd = frame.cost_usd;
        event.duration_ms = frame.duration_ms;
        event.is_error_result = frame.is_error;

        if let Some(message) = frame.message {
            event.message = Some(MessageContent {
                role: message.role,
                model: message.model,
                blocks: vec![ContentBlock::Text(message.text)],
            });
        }
        if let Some(tool) = frame.tool {
            event.tool = Some(ToolContent {
                id: tool.id,
                name: tool.name,
                input: tool.input,
                output: tool.output,
            });
        }
        if let Some(usage) = frame.usage {
            event.usage = Some(self.base.usage(usage.input_tokens, usage.output_tokens));
        }
        if let Some(raw_error) = frame.error {
            event.error = Some(self.base.parse_error_value(&raw_error));
        }

        Ok(event)
    }

    fn extract_session_ref(&self, event: &OutputEvent, raw: &[u8]) -> Option<String> {
        if let Some(session) = event.session_ref.clone().filter(|s| !s.is_empty()) {
            return Some(session);
        }
        // Late frames embed the thread id in nested payloads only.
        let value: serde_json::Value = serde_json::from_slice(raw).ok()?;
        find_thread_id(&value)
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool {
        self.base.event_exhausted(event)
    }
}

fn find_thread_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(id) = map.get("threadID").and_then(|v| v.as_str()) {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
            map.values().find_map(find_thread_id)
        },
        serde_json::Value::Array(items) => items.iter().find_map(find_thread_id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_frame() {
        let parser = AmpParser::default();
        let line = br#"{"type":"assistant","threadID":"T-42","message":{"role":"assistant","model":"amp-main","text":"done"}}"#;
        let event = parser.parse_event(line).unwrap();
        assert_eq!(event.kind, OutputEventKind::Assistant);
        assert_eq!(event.session_ref.as_deref(), Some("T-42"));
        assert_eq!(event.assistant_text().as_deref(), Some("done"));
    }

    #[test]
    fn test_session_ref_found_in_nested_payload() {
        let parser = AmpParser::default();
        let raw = br#"{"type":"result","subtype":"success","meta":{"threadID":"T-77"}}"#;
        let event = parser.parse_event(raw).unwrap();
        assert!(event.session_ref.is_none());
        assert_eq!(parser.extract_session_ref(&event, raw).as_deref(), Some("T-77"));
    }

    #[test]
    fn test_tool_result_frame() {
        let parser = AmpParser::default();
        let line = br#"{"type":"tool_result","tool":{"id":"c1","name":"edit_file","output":"applied"}}"#;
        let event = parser.parse_event(line).unwrap();
        assert_eq!(event.tool.as_ref().unwrap().output.as_deref(), Some("applied"));
    }
}
