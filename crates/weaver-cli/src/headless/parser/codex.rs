//! Parser for Codex CLI `exec --json` frames.
//!
//! Codex wraps every payload in `{"id": ..., "msg": {"type": ...}}` and
//! only announces the session in the `session_configured` frame.

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
struct CodexFrame {
    #[serde(default)]
    #[allow(dead_code)]
    id: String,
    msg: CodexMsg,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexMsg {
    SessionConfigured {
        session_id: String,
        #[serde(default)]
        model: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    TaskStarted,
    AgentMessage {
        message: String,
    },
    ExecCommandBegin {
        call_id: String,
        #[serde(default)]
        command: serde_json::Value,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        exit_code: i64,
    },
    TokenCount {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    TaskComplete,
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

pub struct CodexParser {
    base: BaseParser,
}

impl CodexParser {
    pub fn new(base: BaseParser) -> Self {
        Self { base }
    }
}

impl Default for CodexParser {
    fn default() -> Self {
        Self::new(BaseParser::default())
    }
}

impl EventParser for CodexParser {
    fn provider(&self) -> &'static str {
        "codex"
    }

    fn parse_event(&self, line: &[u8]) -> Result<OutputEvent, ParseError> {
        let frame: CodexFrame = serde_json::from_slice(line)?;

        let event = match frame.msg {
            CodexMsg::SessionConfigured { session_id, model, cwd } => {
                let mut event = OutputEvent::new(OutputEventKind::System);
                event.subkind = Some("init".to_string());
                event.session_ref = Some(session_id);
                event.working_dir = cwd;
                event.message = Some(MessageContent {
                    role: "system".to_string(),
                    model,
                    blocks: Vec::new(),
                });
                event
            },
            CodexMsg::TaskStarted => {
                let mut event = OutputEvent::new(OutputEventKind::System);
                event.subkind = Some("task_started".to_string());
                event
            },
            CodexMsg::AgentMessage { message } => {
                let mut event = OutputEvent::new(OutputEventKind::Assistant);
                event.message = Some(MessageContent {
                    role: "assistant".to_string(),
                    model: String::new(),
                    blocks: vec![ContentBlock::Text(message)],
                });
                event
            },
            CodexMsg::ExecCommandBegin { call_id, command } => {
                let mut event = OutputEvent::new(OutputEventKind::ToolUse);
                event.tool = Some(ToolContent {
                    id: call_id,
                    name: "exec".to_string(),
                    input: command,
                    output: None,
                });
                event
            },
            CodexMsg::ExecCommandEnd { call_id, stdout, exit_code } => {
                let mut event = OutputEvent::new(OutputEventKind::ToolResult);
                event.subkind = Some(format!("exit_{exit_code}"));
                event.tool = Some(ToolContent {
                    id: call_id,
                    name: "exec".to_string(),
                    input: serde_json::Value::Null,
                    output: Some(stdout),
                });
                event
            },
            CodexMsg::TokenCount { input_tokens, output_tokens } => {
                let mut event = OutputEvent::new(OutputEventKind::System);
                event.subkind = Some("token_count".to_string());
                event.usage = Some(self.base.usage(input_tokens, output_tokens));
                event
            },
            CodexMsg::TaskComplete => {
                let mut event = OutputEvent::new(OutputEventKind::Result);
                event.subkind = Some("success".to_string());
                event
            },
            CodexMsg::Error { message, code } => {
                let mut event = OutputEvent::new(OutputEventKind::Error);
                let code = code.unwrap_or_default();
                let reason = self.base.classify_reason(&message, &code);
                event.error = Some(crate::headless::event::ErrorInfo { message, code, reason });
                event
            },
        };

        Ok(event)
    }

    fn is_context_exhausted(&self, event: &OutputEvent) -> bool {
        self.base.event_exhausted(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::event::ErrorReason;

    #[test]
    fn test_session_configured_maps_to_init() {
        let parser = CodexParser::default();
        let line = br#"{"id":"0","msg":{"type":"session_configured","session_id":"c-9","model":"gpt-5"}}"#;
        let event = parser.parse_event(line).unwrap();
        assert!(event.is_init());
        assert_eq!(event.session_ref.as_deref(), Some("c-9"));
    }

    #[test]
    fn test_exec_round_maps_to_tool_events() {
        let parser = CodexParser::default();
        let begin = parser
            .parse_event(br#"{"id":"1","msg":{"type":"exec_command_begin","call_id":"k1","command":["ls"]}}"#)
            .unwrap();
        assert_eq!(begin.kind, OutputEventKind::ToolUse);

        let end = parser
            .parse_event(br#"{"id":"2","msg":{"type":"exec_command_end","call_id":"k1","stdout":"src\n","exit_code":0}}"#)
            .unwrap();
        assert_eq!(end.kind, OutputEventKind::ToolResult);
        assert_eq!(end.tool.as_ref().unwrap().output.as_deref(), Some("src\n"));
    }

    #[test]
    fn test_error_classification() {
        let parser = CodexParser::default();
        let event = parser
            .parse_event(br#"{"id":"3","msg":{"type":"error","message":"maximum context length reached"}}"#)
            .unwrap();
        assert_eq!(event.error.as_ref().unwrap().reason, ErrorReason::ContextExceeded);
        assert!(parser.is_context_exhausted(&event));
    }
}
