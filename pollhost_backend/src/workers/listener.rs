use anyhow::{Context, Result};
use chrono::Utc;

use super::{HostEvent, WorkerContext, WorkerExit};
use crate::store::{InboundMessage, OutboundReply, SubscriptionEvent};

/// Replies to each new unprocessed message, one at a time, in delivery order.
pub struct MessageWorker {
    ctx: WorkerContext,
}

impl MessageWorker {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Runs until the subscription reports its deadline (clean exit) or any
    /// step fails (returned as an error; nothing is retried).
    pub async fn run(self) -> Result<WorkerExit> {
        tracing::info!("Message worker listening for new user messages");
        let mut subscription = self
            .ctx
            .messages
            .subscribe_unprocessed()
            .await
            .context("error subscribing to unprocessed messages")?;

        loop {
            let event = subscription
                .next_event()
                .await
                .context("error receiving message subscription event")?;
            let batch = match event {
                SubscriptionEvent::Batch(batch) => batch,
                SubscriptionEvent::DeadlineExceeded => {
                    tracing::info!("Message subscription deadline reached");
                    return Ok(WorkerExit::DeadlineExceeded);
                }
            };

            for message in batch {
                self.handle_message(&message).await?;
            }
        }
    }

    /// Holds the coordination lock from recording the user's message until
    /// the reply is stored and the message is marked processed.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<()> {
        let mut state = self.ctx.conversation.lock().await;
        state.record_user_message(Utc::now());

        let reply_text = self
            .ctx
            .generator
            .reply(&message.message, state.summary())
            .await?;

        let reply = OutboundReply::new(message.id.clone(), reply_text);
        self.ctx
            .replies
            .upsert_reply(&reply)
            .await
            .with_context(|| format!("error writing response message for {}", message.id))?;

        self.ctx
            .messages
            .mark_processed(&message.id)
            .await
            .with_context(|| format!("error marking message {} as processed", message.id))?;

        state.record_response(Utc::now());
        drop(state);

        tracing::debug!("Response written for {}: {}", message.id, reply.message);
        self.ctx.emit(HostEvent::ReplyWritten {
            message_id: message.id.clone(),
            reply: reply.message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::generator::testing::ScriptedBackend;
    use crate::store::memory::StoreOp;
    use crate::workers::testing::harness;

    #[tokio::test]
    async fn reply_is_bound_to_message_id_and_written_before_marking() {
        let h = harness(ScriptedBackend::default());
        h.store.push_message("m1", "Who's winning?").unwrap();
        h.store.expire_subscriptions();

        let exit = MessageWorker::new(h.ctx.clone()).run().await.unwrap();
        assert_eq!(exit, WorkerExit::DeadlineExceeded);

        let reply = h.store.reply("m1").unwrap().expect("reply for m1");
        assert_eq!(reply.message, "reply #1");
        assert!(!reply.processed);
        assert!(h.store.message("m1").unwrap().unwrap().processed);
        assert_eq!(
            h.store.ops().unwrap(),
            vec![
                StoreOp::ReplyWritten("m1".to_string()),
                StoreOp::MarkedProcessed("m1".to_string()),
            ]
        );

        let state = h.ctx.conversation.snapshot().await;
        assert!(state.last_response_at() >= state.last_user_message_at());
    }

    #[tokio::test]
    async fn failed_reply_write_leaves_message_unprocessed_and_stops_worker() {
        let h = harness(ScriptedBackend::default());
        h.store.push_message("m1", "hello").unwrap();
        h.store.fail_replies_with("quota exceeded").unwrap();

        let err = MessageWorker::new(h.ctx.clone()).run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("quota exceeded"));
        assert!(!h.store.message("m1").unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn failed_mark_after_reply_keeps_reply_and_stops_worker() {
        let h = harness(ScriptedBackend::default());
        h.store.push_message("m1", "hello").unwrap();
        h.store.fail_marks_with("permission denied").unwrap();

        let err = MessageWorker::new(h.ctx.clone()).run().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("error marking message m1 as processed"));
        assert!(message.contains("permission denied"));

        assert_eq!(h.store.reply("m1").unwrap().unwrap().message, "reply #1");
        assert!(!h.store.message("m1").unwrap().unwrap().processed);
        assert_eq!(
            h.store.ops().unwrap(),
            vec![StoreOp::ReplyWritten("m1".to_string())]
        );

        let state = h.ctx.conversation.snapshot().await;
        assert_eq!(
            state.last_response_at(),
            chrono::DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn generation_error_is_fatal() {
        let h = harness(ScriptedBackend::failing("model offline"));
        h.store.push_message("m1", "hello").unwrap();

        let err = MessageWorker::new(h.ctx.clone()).run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("model offline"));
        assert!(h.store.reply("m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn subscription_failure_is_fatal() {
        let h = harness(ScriptedBackend::default());
        h.store.break_subscriptions("stream reset");

        let err = MessageWorker::new(h.ctx.clone()).run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("stream reset"));
    }

    #[tokio::test]
    async fn messages_are_handled_one_at_a_time_in_order() {
        let h = harness(ScriptedBackend::with_delay(Duration::from_millis(5)));
        for id in ["m1", "m2", "m3"] {
            h.store.push_message(id, id).unwrap();
        }
        h.store.expire_subscriptions();

        MessageWorker::new(h.ctx.clone()).run().await.unwrap();

        let prompts = h.backend.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("User said: m1"));
        assert!(prompts[2].contains("User said: m3"));
        assert_eq!(
            h.backend
                .max_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let written: Vec<String> = h
            .events
            .drain()
            .filter_map(|event| match event {
                HostEvent::ReplyWritten { message_id, .. } => Some(message_id),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn reply_uses_current_shared_summary() {
        let h = harness(ScriptedBackend::default());
        h.ctx
            .conversation
            .lock()
            .await
            .set_summary("Current poll status:\nQuestion: Cats or dogs?\n".to_string());

        let message = InboundMessage {
            id: "m9".to_string(),
            message: "dogs!".to_string(),
            timestamp: Utc::now(),
            processed: false,
        };
        h.store.push_message("m9", "dogs!").unwrap();
        MessageWorker::new(h.ctx.clone())
            .handle_message(&message)
            .await
            .unwrap();

        let prompts = h.backend.prompts();
        assert!(prompts[0].contains("Question: Cats or dogs?"));
        assert!(prompts[0].contains("User said: dogs!"));
    }
}
