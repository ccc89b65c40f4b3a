//! Inter-agent messaging: channels, threads, acks and subscriptions.

pub mod service;
pub mod store;
pub mod tools;
pub mod types;

pub use service::{ChannelInbox, FabricService};
pub use tools::{FabricTools, ToolError};
pub use types::{
    ArtifactMeta,
    FIXED_CHANNELS,
    Subscription,
    SubscriptionMode,
    Thread,
    ThreadKind,
    extract_mentions,
};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("channel slug is reserved: {0}")]
    ReservedSlug(String),
    #[error("channel already exists: {0}")]
    DuplicateChannel(String),
    #[error("message content is empty")]
    EmptyContent,
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}
