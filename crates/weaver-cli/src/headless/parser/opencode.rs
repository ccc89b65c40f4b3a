//! Parser for OpenCode CLI `run --format json` frames.

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
struct OpencodeFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
    text: Option<String>,
    tool: Option<String>,
    #[serde(rename = "callID")]
    call_id: Option<String>,
    input: Option<serde_json::Value>,
    output: Option<String>,
    tokens: Option<OpencodeTokens>,
    cost: Option<f64>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpencodeTokens {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
}

pub struct OpencodeParser {
    base: BaseParser,
}

impl OpencodeParser {
    pub fn new(base: BaseParser) -> Self {
        Self { base }
    }
}

impl Default for OpencodeParser {
    fn default() -> Self {
        Self::new(BaseParser::default())
    }
}

impl EventParser for OpencodeParser {
    fn provider(&self) -> &'static str {
        "opencode"
    }

    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError> {
        let frame: OpencodeFrame = serde_json::from_slice(line)?;

        let (kind, subkind) = match frame.kind.as_str() {
            "session.init" => (OutputEventKind::System, Some("init")),
            "message.text" => (OutputEventKind::Assistant, None),
            "tool.start" => (OutputEventKind::ToolUse, None),
            "tool.end" => (OutputEventKind::ToolResult, None),
            "session.result" => (OutputEventKind::Result, Some("success")),
            "session.error" => (OutputEventKind::Error, None),
            other => return Err(ParseError::UnknownFrame(other.to_string())),
        };

        let mut event = OutputEvent::new(kind);
        event.subkind = subkind.map(str::to_string);
        event.session_ref = frame.session_id.filter(|s| !s.is_empty());
        event.cost_usd = frame.cost;

        if let Some(text) = frame.text {
            event.message = Some(MessageContent {
                role: "assistant".to_string(),
                model: String::new(),
                blocks: vec![ContentBlock::Text(text)],
            });
        }
        if let Some(name) = frame.tool {
            event.tool = Some(ToolContent {
                id: frame.call_id.unwrap_or_default(),
                name,
                input: frame.input.unwrap_or(serde_json::Value::Null),
                output: frame.output,
            });
        }
        if let Some(tokens) = frame.tokens {
            event.usage = Some(self.base.usage(tokens.input, tokens.output));
        }
        if let Some(raw_error) = frame.error {
            event.error = Some(self.base.parse_error_value(&raw_error));
        }

        Ok(event)
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool {
        self.base.event_exhausted(event)
    }
}
