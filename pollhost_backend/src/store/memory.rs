use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{
    InboundMessage, MessageStore, MessageSubscription, OutboundReply, PollStore, ReplySink,
    SubscriptionEvent,
};
use crate::poll::PollSnapshot;

/// Store operations in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    ReplyWritten(String),
    MarkedProcessed(String),
    PollFetched,
}

#[derive(Debug, Clone)]
enum FeedSignal {
    Changed,
    Deadline,
    Failure(String),
}

#[derive(Default)]
struct MemoryInner {
    messages: Vec<InboundMessage>,
    replies: BTreeMap<String, OutboundReply>,
    polls: Vec<PollSnapshot>,
    next_poll: usize,
    ops: Vec<StoreOp>,
    fail_replies: Option<String>,
    fail_marks: Option<String>,
    fail_polls: Option<String>,
}

/// Process-local store for tests and dry runs. The change feed is driven
/// explicitly: inserts wake subscribers, and `expire_subscriptions` /
/// `break_subscriptions` inject the deadline and transport-failure signals.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    feed_tx: flume::Sender<FeedSignal>,
    feed_rx: flume::Receiver<FeedSignal>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (feed_tx, feed_rx) = flume::unbounded();
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            feed_tx,
            feed_rx,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("In-memory store lock poisoned: {}", e))
    }

    /// Add an unprocessed message and wake the change feed.
    pub fn push_message(&self, id: &str, message: &str) -> Result<()> {
        self.lock()?.messages.push(InboundMessage {
            id: id.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            processed: false,
        });
        let _ = self.feed_tx.send(FeedSignal::Changed);
        Ok(())
    }

    /// Add a message that is already processed.
    pub fn push_processed_message(&self, id: &str, message: &str) -> Result<()> {
        self.lock()?.messages.push(InboundMessage {
            id: id.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            processed: true,
        });
        Ok(())
    }

    /// Replace the poll document.
    pub fn set_poll(&self, poll: PollSnapshot) -> Result<()> {
        self.set_poll_sequence(vec![poll])
    }

    /// Each fetch returns the next snapshot in turn, cycling.
    pub fn set_poll_sequence(&self, polls: Vec<PollSnapshot>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.polls = polls;
        inner.next_poll = 0;
        Ok(())
    }

    pub fn expire_subscriptions(&self) {
        let _ = self.feed_tx.send(FeedSignal::Deadline);
    }

    pub fn break_subscriptions(&self, reason: &str) {
        let _ = self.feed_tx.send(FeedSignal::Failure(reason.to_string()));
    }

    pub fn fail_replies_with(&self, reason: &str) -> Result<()> {
        self.lock()?.fail_replies = Some(reason.to_string());
        Ok(())
    }

    pub fn fail_marks_with(&self, reason: &str) -> Result<()> {
        self.lock()?.fail_marks = Some(reason.to_string());
        Ok(())
    }

    pub fn fail_polls_with(&self, reason: &str) -> Result<()> {
        self.lock()?.fail_polls = Some(reason.to_string());
        Ok(())
    }

    pub fn message(&self, id: &str) -> Result<Option<InboundMessage>> {
        Ok(self.lock()?.messages.iter().find(|m| m.id == id).cloned())
    }

    pub fn reply(&self, id: &str) -> Result<Option<OutboundReply>> {
        Ok(self.lock()?.replies.get(id).cloned())
    }

    pub fn replies(&self) -> Result<Vec<OutboundReply>> {
        Ok(self.lock()?.replies.values().cloned().collect())
    }

    pub fn ops(&self) -> Result<Vec<StoreOp>> {
        Ok(self.lock()?.ops.clone())
    }

    fn pending(&self) -> Result<Vec<InboundMessage>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| !m.processed)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn unprocessed_messages(&self) -> Result<Vec<InboundMessage>> {
        self.pending()
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        if let Some(reason) = inner.fail_marks.clone() {
            anyhow::bail!("error marking message as processed: {}", reason);
        }
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| anyhow::anyhow!("message '{}' not found", id))?;
        if !message.processed {
            message.processed = true;
            inner.ops.push(StoreOp::MarkedProcessed(id.to_string()));
        }
        Ok(())
    }

    async fn subscribe_unprocessed(&self) -> Result<Box<dyn MessageSubscription>> {
        Ok(Box::new(MemorySubscription {
            store: self.clone(),
        }))
    }
}

#[async_trait]
impl ReplySink for InMemoryStore {
    async fn upsert_reply(&self, reply: &OutboundReply) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(reason) = inner.fail_replies.clone() {
            anyhow::bail!("error writing reply: {}", reason);
        }
        inner.replies.insert(reply.id.clone(), reply.clone());
        inner.ops.push(StoreOp::ReplyWritten(reply.id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PollStore for InMemoryStore {
    async fn fetch_poll(&self) -> Result<PollSnapshot> {
        let mut inner = self.lock()?;
        if let Some(reason) = inner.fail_polls.clone() {
            anyhow::bail!("error fetching poll document: {}", reason);
        }
        if inner.polls.is_empty() {
            anyhow::bail!("error fetching poll document: not found");
        }
        let index = inner.next_poll % inner.polls.len();
        inner.next_poll = inner.next_poll.wrapping_add(1);
        inner.ops.push(StoreOp::PollFetched);
        Ok(inner.polls[index].clone())
    }
}

struct MemorySubscription {
    store: InMemoryStore,
}

#[async_trait]
impl MessageSubscription for MemorySubscription {
    async fn next_event(&mut self) -> Result<SubscriptionEvent> {
        loop {
            let batch = self.store.pending()?;
            if !batch.is_empty() {
                return Ok(SubscriptionEvent::Batch(batch));
            }

            match self.store.feed_rx.recv_async().await {
                Ok(FeedSignal::Changed) => continue,
                Ok(FeedSignal::Deadline) => return Ok(SubscriptionEvent::DeadlineExceeded),
                Ok(FeedSignal::Failure(reason)) => {
                    anyhow::bail!("subscription failed: {}", reason)
                }
                Err(_) => anyhow::bail!("subscription feed closed"),
            }
        }
    }
}
