//! The fabric service: channels, messages, acks, subscriptions and
//! artifact attachments for inter-agent messaging.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::FabricError;
use super::store::{
    AckStore,
    MemoryAckStore,
    MemorySubscriptionStore,
    MemoryThreadStore,
    SubscriptionStore,
    ThreadStore,
};
use super::types::{
    ArtifactMeta,
    FIXED_CHANNELS,
    Subscription,
    SubscriptionMode,
    Thread,
    ThreadKind,
};

/// Unread messages in one channel, for an agent's inbox.
#[derive(Debug, Clone)]
pub struct ChannelInbox {
    pub channel_slug: String,
    pub messages: Vec<Thread>,
}

pub struct FabricService {
    threads: Arc<dyn ThreadStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    acks: Arc<dyn AckStore>,
}

impl FabricService {
    /// The fixed channels are pre-created at session init.
    pub fn new(
        threads: Arc<dyn ThreadStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        acks: Arc<dyn AckStore>,
    ) -> Result<Self, FabricError> {
        for slug in FIXED_CHANNELS {
            if threads.channel_by_slug(slug).is_none() {
                threads.insert_root(Thread::channel(slug, "system"))?;
            }
        }
        Ok(Self {
            threads,
            subscriptions,
            acks,
        })
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryThreadStore::new()),
            Arc::new(MemorySubscriptionStore::new()),
            Arc::new(MemoryAckStore::new()),
        )
        .expect("fresh in-memory store cannot have slug collisions")
    }

    /// User-facing channel creation; the fixed slugs are reserved.
    pub fn create_channel(&self, slug: &str, created_by: &str) -> Result<Thread, FabricError> {
        if FIXED_CHANNELS.contains(&slug) {
            return Err(FabricError::ReservedSlug(slug.to_string()));
        }
        self.threads.insert_root(Thread::channel(slug, created_by))
    }

    pub fn channels(&self) -> Vec<Thread> {
        self.threads.channels()
    }

    pub fn send_message(
        &self,
        channel_slug: &str,
        content: &str,
        created_by: &str,
    ) -> Result<Thread, FabricError> {
        if content.trim().is_empty() {
            return Err(FabricError::EmptyContent);
        }
        let channel = self
            .threads
            .channel_by_slug(channel_slug)
            .ok_or_else(|| FabricError::UnknownChannel(channel_slug.to_string()))?;
        let message = self
            .threads
            .append(Thread::message(channel.id, content, created_by))?;
        debug!(channel = channel_slug, message_id = %message.id, "message sent");
        Ok(message)
    }

    /// New message with a strictly increasing position under the parent.
    pub fn reply(
        &self,
        parent_id: Uuid,
        content: &str,
        created_by: &str,
    ) -> Result<Thread, FabricError> {
        if content.trim().is_empty() {
            return Err(FabricError::EmptyContent);
        }
        let parent = self
            .threads
            .get(parent_id)
            .ok_or(FabricError::MessageNotFound(parent_id))?;
        if parent.kind == ThreadKind::Artifact {
            return Err(FabricError::InvalidTarget(
                "cannot reply to an artifact".to_string(),
            ));
        }
        self.threads
            .append(Thread::message(parent.id, content, created_by))
    }

    /// Idempotent; every id must exist.
    pub fn ack(&self, message_ids: &[Uuid], agent: &str) -> Result<(), FabricError> {
        for id in message_ids {
            if self.threads.get(*id).is_none() {
                return Err(FabricError::MessageNotFound(*id));
            }
        }
        for id in message_ids {
            self.acks.ack(agent, *id);
        }
        Ok(())
    }

    pub fn subscribe(
        &self,
        channel_slug: &str,
        agent: &str,
        mode: SubscriptionMode,
    ) -> Result<(), FabricError> {
        let channel = self
            .threads
            .channel_by_slug(channel_slug)
            .ok_or_else(|| FabricError::UnknownChannel(channel_slug.to_string()))?;
        self.subscriptions.upsert(Subscription {
            channel_id: channel.id,
            agent: agent.to_string(),
            mode,
        });
        Ok(())
    }

    pub fn unsubscribe(&self, channel_slug: &str, agent: &str) -> Result<(), FabricError> {
        let channel = self
            .threads
            .channel_by_slug(channel_slug)
            .ok_or_else(|| FabricError::UnknownChannel(channel_slug.to_string()))?;
        self.subscriptions.remove(channel.id, agent);
        Ok(())
    }

    /// Unread messages from subscribed channels, grouped by channel. In
    /// `mentions` mode only messages mentioning the agent count.
    pub fn inbox(&self, agent: &str) -> Vec<ChannelInbox> {
        let mut inbox = Vec::new();
        for subscription in self.subscriptions.for_agent(agent) {
            let Some(channel) = self.threads.get(subscription.channel_id) else {
                continue;
            };
            let mut unread = Vec::new();
            self.collect_unread(channel.id, agent, subscription.mode, &mut unread);
            if !unread.is_empty() {
                inbox.push(ChannelInbox {
                    channel_slug: channel.slug.clone().unwrap_or_default(),
                    messages: unread,
                });
            }
        }
        inbox
    }

    fn collect_unread(
        &self,
        parent_id: Uuid,
        agent: &str,
        mode: SubscriptionMode,
        out: &mut Vec<Thread>,
    ) {
        for child in self.threads.children(parent_id) {
            if child.kind == ThreadKind::Message {
                let visible = child.archived_at.is_none()
                    && !self.acks.is_acked(agent, child.id)
                    && match mode {
                        SubscriptionMode::All => true,
                        SubscriptionMode::Mentions => child.mentions_agent(agent),
                    };
                if visible {
                    out.push(child.clone());
                }
                // Replies live under the message but belong to the same
                // channel view.
                self.collect_unread(child.id, agent, mode, out);
            }
        }
    }

    /// Number of unacked messages currently visible to the agent.
    pub fn inbox_count(&self, agent: &str) -> usize {
        self.inbox(agent).iter().map(|c| c.messages.len()).sum()
    }

    /// Archive a message; it drops out of inboxes but stays in history.
    pub fn archive(&self, message_id: Uuid) -> Result<(), FabricError> {
        self.threads.archive(message_id, chrono::Utc::now())
    }

    /// Record an artifact against a message or channel. Stores the size and
    /// logical name only; bytes stay on disk.
    pub fn attach(
        &self,
        target_id: Uuid,
        path: &str,
        name: &str,
    ) -> Result<Thread, FabricError> {
        let target = self
            .threads
            .get(target_id)
            .ok_or(FabricError::MessageNotFound(target_id))?;
        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.threads.append(Thread::artifact(
            target.id,
            ArtifactMeta {
                name: name.to_string(),
                path: path.to_string(),
                size_bytes,
            },
            &target.created_by,
        ))
    }

    /// Append-only message history of a channel, in thread order.
    pub fn history(&self, channel_slug: &str) -> Result<Vec<Thread>, FabricError> {
        let channel = self
            .threads
            .channel_by_slug(channel_slug)
            .ok_or_else(|| FabricError::UnknownChannel(channel_slug.to_string()))?;
        Ok(self
            .threads
            .children(channel.id)
            .into_iter()
            .filter(|t| t.kind == ThreadKind::Message)
            .collect())
    }

    /// One message plus its ordered replies.
    pub fn read_thread(&self, message_id: Uuid) -> Result<(Thread, Vec<Thread>), FabricError> {
        let message = self
            .threads
            .get(message_id)
            .ok_or(FabricError::MessageNotFound(message_id))?;
        let replies = self
            .threads
            .children(message.id)
            .into_iter()
            .filter(|t| t.kind == ThreadKind::Message)
            .collect();
        Ok((message, replies))
    }
}
