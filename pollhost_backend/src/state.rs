use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::HostConfig;

/// Conversation state shared by the message worker and the monitor worker.
///
/// Both timestamps only move forward: a write older than the stored value is
/// ignored.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConversationState {
    last_user_message_at: DateTime<Utc>,
    last_response_at: DateTime<Utc>,
    summary: String,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            last_user_message_at: DateTime::<Utc>::UNIX_EPOCH,
            last_response_at: DateTime::<Utc>::UNIX_EPOCH,
            summary: String::new(),
        }
    }
}

impl ConversationState {
    pub fn last_user_message_at(&self) -> DateTime<Utc> {
        self.last_user_message_at
    }

    pub fn last_response_at(&self) -> DateTime<Utc> {
        self.last_response_at
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn record_user_message(&mut self, at: DateTime<Utc>) {
        self.last_user_message_at = self.last_user_message_at.max(at);
    }

    pub fn record_response(&mut self, at: DateTime<Utc>) {
        self.last_response_at = self.last_response_at.max(at);
    }

    pub fn set_summary(&mut self, summary: String) {
        self.summary = summary;
    }
}

/// The coordination lock. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct SharedConversation {
    inner: Arc<Mutex<ConversationState>>,
}

impl SharedConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: ConversationState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Waits for exclusive access. Hold the guard for the whole
    /// read-decide-write sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.inner.lock().await
    }

    /// Copy of the current state, taken under the lock.
    pub async fn snapshot(&self) -> ConversationState {
        self.inner.lock().await.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorThresholds {
    /// User silence required before an idle prompt (strictly greater than).
    pub idle_user: ChronoDuration,
    /// Minimum gap since the last response before an idle prompt.
    pub idle_response: ChronoDuration,
    /// Minimum gap since the last response before a poll update.
    pub poll_update: ChronoDuration,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            idle_user: ChronoDuration::seconds(30),
            idle_response: ChronoDuration::seconds(10),
            poll_update: ChronoDuration::seconds(15),
        }
    }
}

impl MonitorThresholds {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            idle_user: seconds(config.idle_user_threshold_secs),
            idle_response: seconds(config.idle_response_threshold_secs),
            poll_update: seconds(config.poll_update_threshold_secs),
        }
    }
}

/// Saturates instead of panicking; values this large never fire.
fn seconds(secs: u64) -> ChronoDuration {
    i64::try_from(secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .unwrap_or(ChronoDuration::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorDecision {
    IdlePrompt,
    PollUpdate,
    Quiet,
}

/// Idle prompt wins over a poll update when both are due.
pub fn decide(
    state: &ConversationState,
    now: DateTime<Utc>,
    thresholds: &MonitorThresholds,
) -> MonitorDecision {
    let since_user = now - state.last_user_message_at;
    let since_response = now - state.last_response_at;

    if since_user > thresholds.idle_user && since_response >= thresholds.idle_response {
        MonitorDecision::IdlePrompt
    } else if since_response >= thresholds.poll_update {
        MonitorDecision::PollUpdate
    } else {
        MonitorDecision::Quiet
    }
}
