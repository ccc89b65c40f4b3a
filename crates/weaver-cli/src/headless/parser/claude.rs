//! Parser for the Claude CLI `--output-format stream-json` frames.

use serde::Deserialize;

use super::{BaseParser, EventParser, ParseError};
use crate::headless::event::{
    ContentBlock,
    ErrorInfo,
    MessageContent,
    OutputEvent,
    OutputEventKind,
    ToolContent,
};

#[derive(Debug, Deserialize)]
struct ClaudeFrame {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    session_id: Option<String>,
    cwd: Option<String>,
    message: Option<ClaudeMessage>,
    usage: Option<ClaudeUsage>,
    error: Option<serde_json::Value>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ClaudeMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ClaudeBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct ClaudeParser {
    base: BaseParser,
}

impl ClaudeParser {
    pub fn new(base: BaseParser) -> Self {
        Self { base }
    }
}

impl Default for ClaudeParser {
    fn default() -> Self {
        Self::new(BaseParser::default())
    }
}

impl EventParser for ClaudeParser {
    fn provider(&self) -> &'static str {
        "claude"
    }

    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError> {
        let frame: ClaudeFrame = serde_json::from_slice(line)?;

        let kind = match frame.kind.as_str() {
            "system" => OutputEventKind::System,
            "assistant" => OutputEventKind::Assistant,
            "user" => OutputEventKind::ToolResult,
            "result" => OutputEventKind::Result,
            "error" => OutputEventKind::Error,
            other => return Err(ParseError::UnknownFrame(other.to_string())),
        };

        let mut event = OutputEvent::new(kind);
        event.subkind = frame.subtype;
        event.session_ref = frame.session_id.filter(|s| !s.is_empty());
        event.working_dir = frame.cwd;
        event.cost_usd = frame.total_cost_usd;
        event.duration_ms = frame.duration_ms;
        event.is_error_result = frame.is_error;

        if let Some(message) = frame.message {
            let mut blocks = Vec::new();
            let mut tool: Option<ToolContent> = None;
            for block in message.content {
                match block {
                    ClaudeBlock::Text { text } => blocks.push(ContentBlock::Text(text)),
                    ClaudeBlock::ToolUse { id, name, input } => {
                        blocks.push(ContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                        tool = Some(ToolContent {
                            id,
                            name,
                            input,
                            output: None,
                        });
                    },
                    ClaudeBlock::ToolResult { tool_use_id, content } => {
                        tool = Some(ToolContent {
                            id: tool_use_id,
                            name: String::new(),
                            input: serde_json::Value::Null,
                            output: Some(flatten_tool_result(&content)),
                        });
                    },
                    ClaudeBlock::Other => {},
                }
            }
            if event.kind == OutputEventKind::Assistant
                && blocks
                    .iter()
                    .all(|b| matches!(b, ContentBlock::ToolUse { .. }))
                && tool.is_some()
            {
                event.kind = OutputEventKind::ToolUse;
            }
            event.message = Some(MessageContent {
                role: message.role,
                model: message.model,
                blocks,
            });
            event.tool = tool;
        }

        if let Some(usage) = frame.usage {
            event.usage = Some(self.base.usage(
                usage.input_tokens + usage.cache_read_input_tokens,
                usage.output_tokens,
            ));
        }

        if let Some(raw_error) = frame.error {
            event.error = Some(self.base.parse_error_value(&raw_error));
        } else if event.is_error_result {
            // Some result frames only carry the subtype; keep a classified
            // error so consumers never have to re-derive it.
            let message = event.subkind.clone().unwrap_or_default();
            let reason = self.base.classify_reason(&message, "");
            event.error = Some(ErrorInfo {
                message,
                code: String::new(),
                reason,
            });
        }

        Ok(event)
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool {
        self.base.event_exhausted(event)
    }
}

fn flatten_tool_result(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
