//! Normalized events yielded by every provider parser.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Kind of a normalized output event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OutputEventKind {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Result,
    Error,
}

/// Why a provider reported an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorReason {
    #[default]
    Unknown,
    ContextExceeded,
    RateLimited,
    InvalidRequest,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
    pub code: String,
    pub reason: ErrorReason,
}

/// Ordered content block inside an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MessageContent {
    pub role: String,
    pub model: String,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolContent {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
}

/// Token accounting reported by the provider. `total_tokens` is the model's
/// context window, not a running sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub tokens_used: u64,
    pub total_tokens: u64,
    pub output_tokens: u64,
}

/// Provider-agnostic event. Parsers fill in what their wire format carries;
/// `raw` always holds the exact line bytes the event was parsed from.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub kind: OutputEventKind,
    pub subkind: Option<String>,
    pub session_ref: Option<String>,
    pub working_dir: Option<String>,
    pub message: Option<MessageContent>,
    pub tool: Option<ToolContent>,
    pub usage: Option<UsageInfo>,
    pub error: Option<ErrorInfo>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub is_error_result: bool,
    pub raw: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn new(kind: OutputEventKind) -> Self {
        Self {
            kind,
            subkind: None,
            session_ref: None,
            working_dir: None,
            message: None,
            tool: None,
            usage: None,
            error: None,
            cost_usd: None,
            duration_ms: None,
            is_error_result: false,
            raw: Bytes::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutputEventKind::Error || self.error.is_some() || self.is_error_result
    }

    pub fn is_init(&self) -> bool {
        self.kind == OutputEventKind::System && self.subkind.as_deref() == Some("init")
    }

    /// Concatenated text blocks of the assistant message, if any.
    pub fn assistant_text(&self) -> Option<String> {
        let message = self.message.as_ref()?;
        let mut out = String::new();
        for block in &message.blocks {
            if let ContentBlock::Text(text) = block {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }
}
