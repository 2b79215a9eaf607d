pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::poll::PollSnapshot;

pub use memory::InMemoryStore;
pub use sqlite::HostDatabase;

/// A chat message written by a user. `processed` flips to true exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
}

/// A host message. `id` is either the triggering message id or the sentinel
/// used for host-initiated prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
}

impl OutboundReply {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            timestamp: Utc::now(),
            processed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Messages currently matching `processed = false`, oldest first.
    Batch(Vec<InboundMessage>),
    /// The subscription's deadline passed. Not an error.
    DeadlineExceeded,
}

#[async_trait]
pub trait MessageSubscription: Send {
    /// Waits for the next non-empty batch or the deadline.
    async fn next_event(&mut self) -> Result<SubscriptionEvent>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Every message with `processed = false`, oldest first.
    async fn unprocessed_messages(&self) -> Result<Vec<InboundMessage>>;

    async fn mark_processed(&self, id: &str) -> Result<()>;

    async fn subscribe_unprocessed(&self) -> Result<Box<dyn MessageSubscription>>;
}

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Reads the configured poll document. A missing document is an error.
    async fn fetch_poll(&self) -> Result<PollSnapshot>;
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Insert or overwrite the reply stored under `reply.id`.
    async fn upsert_reply(&self, reply: &OutboundReply) -> Result<()>;
}
