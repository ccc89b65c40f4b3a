//! Repository seams for threads, subscriptions and acks, with the
//! in-memory implementations the session-scoped fabric runs on.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use super::FabricError;
use super::types::{Subscription, Thread, ThreadKind};

pub trait ThreadStore: Send + Sync {
    /// Insert a root thread (a channel).
    fn insert_root(&self, thread: Thread) -> Result<Thread, FabricError>;
    /// Insert a child thread, assigning the next strictly increasing
    /// `thread_position` under its parent.
    fn append(&self, thread: Thread) -> Result<Thread, FabricError>;
    fn get(&self, id: Uuid) -> Option<Thread>;
    fn channel_by_slug(&self, slug: &str) -> Option<Thread>;
    fn channels(&self) -> Vec<Thread>;
    /// Direct children ordered by `thread_position`.
    fn children(&self, parent_id: Uuid) -> Vec<Thread>;
    /// Archival is the one mutation messages admit after creation.
    fn archive(&self, id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Result<(), FabricError>;
}

pub trait SubscriptionStore: Send + Sync {
    fn upsert(&self, subscription: Subscription);
    fn remove(&self, channel_id: Uuid, agent: &str);
    fn for_agent(&self, agent: &str) -> Vec<Subscription>;
}

pub trait AckStore: Send + Sync {
    /// Idempotent per (agent, message) pair. The ack set only grows.
    fn ack(&self, agent: &str, message_id: Uuid);
    fn is_acked(&self, agent: &str, message_id: Uuid) -> bool;
}

#[derive(Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<Uuid, Thread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for MemoryThreadStore {
    fn insert_root(&self, thread: Thread) -> Result<Thread, FabricError> {
        let mut threads = self.threads.lock().unwrap();
        if let Some(slug) = &thread.slug {
            let exists = threads
                .values()
                .any(|t| t.kind == ThreadKind::Channel && t.slug.as_deref() == Some(slug));
            if exists {
                return Err(FabricError::DuplicateChannel(slug.clone()));
            }
        }
        threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    fn append(&self, mut thread: Thread) -> Result<Thread, FabricError> {
        let parent_id = thread
            .parent_id
            .ok_or_else(|| FabricError::InvalidTarget("child thread without parent".to_string()))?;
        let mut threads = self.threads.lock().unwrap();
        if !threads.contains_key(&parent_id) {
            return Err(FabricError::MessageNotFound(parent_id));
        }
        let next_position = threads
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .map(|t| t.thread_position)
            .max()
            .map_or(1, |max| max + 1);
        thread.thread_position = next_position;
        threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    fn get(&self, id: Uuid) -> Option<Thread> {
        self.threads.lock().unwrap().get(&id).cloned()
    }

    fn channel_by_slug(&self, slug: &str) -> Option<Thread> {
        self.threads
            .lock()
            .unwrap()
            .values()
            .find(|t| t.kind == ThreadKind::Channel && t.slug.as_deref() == Some(slug))
            .cloned()
    }

    fn channels(&self) -> Vec<Thread> {
        let mut channels: Vec<_> = self
            .threads
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.kind == ThreadKind::Channel)
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        channels
    }

    fn children(&self, parent_id: Uuid) -> Vec<Thread> {
        let mut children: Vec<_> = self
            .threads
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.thread_position);
        children
    }

    fn archive(&self, id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Result<(), FabricError> {
        let mut threads = self.threads.lock().unwrap();
        let thread = threads.get_mut(&id).ok_or(FabricError::MessageNotFound(id))?;
        if thread.archived_at.is_none() {
            thread.archived_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn upsert(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(existing) = subscriptions
            .iter_mut()
            .find(|s| s.channel_id == subscription.channel_id && s.agent == subscription.agent)
        {
            existing.mode = subscription.mode;
        } else {
            subscriptions.push(subscription);
        }
    }

    fn remove(&self, channel_id: Uuid, agent: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|s| !(s.channel_id == channel_id && s.agent == agent));
    }

    fn for_agent(&self, agent: &str) -> Vec<Subscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.agent == agent)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryAckStore {
    acks: Mutex<HashSet<(String, Uuid)>>,
}

impl MemoryAckStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AckStore for MemoryAckStore {
    fn ack(&self, agent: &str, message_id: Uuid) {
        self.acks.lock().unwrap().insert((agent.to_string(), message_id));
    }

    fn is_acked(&self, agent: &str, message_id: Uuid) -> bool {
        self.acks.lock().unwrap().contains(&(agent.to_string(), message_id))
    }
}
