//! MCP-facing tool verbs over the fabric service.
//!
//! Each verb takes a JSON object and returns a structured JSON response.
//! Validation problems (missing channel, missing content) and domain
//! problems (unknown channel, message not found) both surface as tool
//! errors.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::FabricError;
use super::service::FabricService;
use super::types::{SubscriptionMode, Thread};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool verb: {0}")]
    UnknownVerb(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

#[derive(Deserialize)]
struct AgentArgs {
    agent: String,
}

#[derive(Deserialize)]
struct SendArgs {
    channel: String,
    content: String,
    agent: String,
}

#[derive(Deserialize)]
struct ReplyArgs {
    message_id: Uuid,
    content: String,
    agent: String,
}

#[derive(Deserialize)]
struct AckArgs {
    message_ids: Vec<Uuid>,
    agent: String,
}

#[derive(Deserialize)]
struct SubscribeArgs {
    channel: String,
    agent: String,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_mode() -> String {
    "all".to_string()
}

#[derive(Deserialize)]
struct UnsubscribeArgs {
    channel: String,
    agent: String,
}

#[derive(Deserialize)]
struct AttachArgs {
    target_id: Uuid,
    path: String,
    name: String,
}

#[derive(Deserialize)]
struct HistoryArgs {
    channel: String,
}

#[derive(Deserialize)]
struct ReadThreadArgs {
    message_id: Uuid,
}

pub struct FabricTools {
    service: Arc<FabricService>,
}

impl FabricTools {
    pub fn new(service: Arc<FabricService>) -> Self {
        Self { service }
    }

    pub fn dispatch(&self, verb: &str, args: Value) -> Result<Value, ToolError> {
        match verb {
            "inbox" => {
                let args: AgentArgs = parse(args)?;
                let inbox = self.service.inbox(&args.agent);
                Ok(json!({
                    "channels": inbox.iter().map(|channel| json!({
                        "channel": channel.channel_slug,
                        "messages": channel.messages.iter().map(message_json).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                    "total": self.service.inbox_count(&args.agent),
                }))
            },
            "send" => {
                let args: SendArgs = parse(args)?;
                let message = self
                    .service
                    .send_message(&args.channel, &args.content, &args.agent)?;
                Ok(message_json(&message))
            },
            "reply" => {
                let args: ReplyArgs = parse(args)?;
                let message = self
                    .service
                    .reply(args.message_id, &args.content, &args.agent)?;
                Ok(message_json(&message))
            },
            "ack" => {
                let args: AckArgs = parse(args)?;
                self.service.ack(&args.message_ids, &args.agent)?;
                Ok(json!({ "acked": args.message_ids.len() }))
            },
            "subscribe" => {
                let args: SubscribeArgs = parse(args)?;
                let mode = SubscriptionMode::from_str(&args.mode)
                    .map_err(|_| ToolError::InvalidArgs(format!("unknown mode: {}", args.mode)))?;
                self.service.subscribe(&args.channel, &args.agent, mode)?;
                Ok(json!({ "subscribed": args.channel, "mode": mode.to_string() }))
            },
            "unsubscribe" => {
                let args: UnsubscribeArgs = parse(args)?;
                self.service.unsubscribe(&args.channel, &args.agent)?;
                Ok(json!({ "unsubscribed": args.channel }))
            },
            "attach" => {
                let args: AttachArgs = parse(args)?;
                let artifact = self.service.attach(args.target_id, &args.path, &args.name)?;
                let meta = artifact.artifact.as_ref();
                Ok(json!({
                    "id": artifact.id,
                    "name": meta.map(|m| m.name.clone()),
                    "size_bytes": meta.map(|m| m.size_bytes),
                }))
            },
            "history" => {
                let args: HistoryArgs = parse(args)?;
                let history = self.service.history(&args.channel)?;
                Ok(json!({
                    "channel": args.channel,
                    "messages": history.iter().map(message_json).collect::<Vec<_>>(),
                }))
            },
            "read_thread" => {
                let args: ReadThreadArgs = parse(args)?;
                let (message, replies) = self.service.read_thread(args.message_id)?;
                Ok(json!({
                    "message": message_json(&message),
                    "replies": replies.iter().map(message_json).collect::<Vec<_>>(),
                }))
            },
            other => Err(ToolError::UnknownVerb(other.to_string())),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|err| ToolError::InvalidArgs(err.to_string()))
}

fn message_json(message: &Thread) -> Value {
    json!({
        "id": message.id,
        "position": message.thread_position,
        "created_by": message.created_by,
        "content": message.content,
        "mentions": message.mentions,
        "created_at": message.created_at.to_rfc3339(),
    })
}
