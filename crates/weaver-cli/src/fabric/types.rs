//! Thread model for inter-agent messaging.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channels every session starts with. The user-facing API refuses to
/// create channels with these slugs.
pub const FIXED_CHANNELS: &[&str] = &["root", "system", "tasks", "planning", "general", "observer"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ThreadKind {
    Channel,
    Message,
    Artifact,
}

/// A node in the fabric: a channel, a message under a channel or message,
/// or an artifact attached to one. Immutable once created, apart from
/// archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub kind: ThreadKind,
    /// Fixed slug; channels only.
    pub slug: Option<String>,
    pub parent_id: Option<Uuid>,
    /// Ordered position within the parent thread.
    pub thread_position: u64,
    pub created_by: String,
    pub content: String,
    /// @-tokens extracted from the content at creation time.
    pub mentions: Vec<String>,
    pub artifact: Option<ArtifactMeta>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn channel(slug: &str, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ThreadKind::Channel,
            slug: Some(slug.to_string()),
            parent_id: None,
            thread_position: 0,
            created_by: created_by.to_string(),
            content: String::new(),
            mentions: Vec::new(),
            artifact: None,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn message(parent_id: Uuid, content: &str, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ThreadKind::Message,
            slug: None,
            parent_id: Some(parent_id),
            thread_position: 0,
            created_by: created_by.to_string(),
            content: content.to_string(),
            mentions: extract_mentions(content),
            artifact: None,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn artifact(parent_id: Uuid, meta: ArtifactMeta, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ThreadKind::Artifact,
            slug: None,
            parent_id: Some(parent_id),
            thread_position: 0,
            created_by: created_by.to_string(),
            content: String::new(),
            mentions: Vec::new(),
            artifact: Some(meta),
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// True when `agent` appears in the mention list, with or without the
    /// leading `@`. Case-insensitive.
    pub fn mentions_agent(&self, agent: &str) -> bool {
        let agent = agent.trim_start_matches('@');
        self.mentions
            .iter()
            .any(|m| m.trim_start_matches('@').eq_ignore_ascii_case(agent))
    }
}

/// Sized, named blob reference. The bytes stay where they are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    All,
    Mentions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub channel_id: Uuid,
    pub agent: String,
    pub mode: SubscriptionMode,
}

/// Pull `@name` tokens out of message content, without the `@`.
pub fn extract_mentions(content: &str) -> Vec<String> {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let regex = MENTION.get_or_init(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_.-]*)").unwrap());
    let mut mentions = Vec::new();
    for capture in regex.captures_iter(content) {
        let name = capture[1].to_string();
        if !mentions.contains(&name) {
            mentions.push(name);
        }
    }
    mentions
}
