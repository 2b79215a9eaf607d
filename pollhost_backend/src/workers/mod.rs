pub mod backlog;
pub mod listener;
pub mod monitor;

use std::fmt;
use std::sync::Arc;

use flume::Sender;
use serde::Serialize;

use crate::generator::ResponseGenerator;
use crate::state::SharedConversation;
use crate::store::{MessageStore, PollStore, ReplySink};

pub use backlog::drain_backlog;
pub use listener::MessageWorker;
pub use monitor::MonitorWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Message,
    Monitor,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Message => write!(f, "message worker"),
            WorkerKind::Monitor => write!(f, "monitor worker"),
        }
    }
}

/// How a worker ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// The subscription hit its deadline.
    DeadlineExceeded,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Idle,
    PollUpdate,
}

#[derive(Debug, Clone)]
pub enum HostEvent {
    BacklogDrained {
        count: usize,
    },
    ReplyWritten {
        message_id: String,
        reply: String,
    },
    PromptEmitted {
        kind: PromptKind,
        reply_id: String,
        text: String,
    },
    SummaryRefreshed(String),
    WorkerStopped {
        worker: WorkerKind,
        exit: WorkerExit,
    },
    WorkerFailed {
        worker: WorkerKind,
        error: String,
    },
}

/// Handles both workers need: the stores, the generator, the coordination
/// lock and the event channel.
#[derive(Clone)]
pub struct WorkerContext {
    pub messages: Arc<dyn MessageStore>,
    pub replies: Arc<dyn ReplySink>,
    pub polls: Arc<dyn PollStore>,
    pub generator: ResponseGenerator,
    pub conversation: SharedConversation,
    pub events: Sender<HostEvent>,
    /// Reply id used for host-initiated prompts.
    pub host_prompt_id: String,
}

impl WorkerContext {
    pub(crate) fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}
