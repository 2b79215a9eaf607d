use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::{HostEvent, PromptKind, WorkerContext, WorkerExit};
use crate::poll::conversation_summary;
use crate::state::{decide, ConversationState, MonitorDecision, MonitorThresholds};
use crate::store::OutboundReply;

/// Refreshes the shared summary from the poll on every tick and decides
/// whether the host should speak up.
pub struct MonitorWorker {
    ctx: WorkerContext,
    tick: Duration,
    thresholds: MonitorThresholds,
}

impl MonitorWorker {
    pub fn new(ctx: WorkerContext, tick: Duration, thresholds: MonitorThresholds) -> Self {
        Self {
            ctx,
            tick,
            thresholds,
        }
    }

    /// Ticks until a tick fails. The first tick fires one period after start.
    pub async fn run(self) -> Result<WorkerExit> {
        tracing::info!("Monitor worker ticking every {:?}", self.tick);
        let start = Instant::now()
            .checked_add(self.tick)
            .ok_or_else(|| anyhow::anyhow!("monitor tick {:?} is out of range", self.tick))?;
        let mut ticker = interval_at(start, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let mut state = self.ctx.conversation.lock().await;
            let now = Utc::now();
            let decision = self.evaluate(&mut state, now).await?;
            tracing::debug!("Monitor tick decision: {:?}", decision);
        }
    }

    /// One tick evaluated at `now`, entirely under the coordination lock.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<MonitorDecision> {
        let mut state = self.ctx.conversation.lock().await;
        self.evaluate(&mut state, now).await
    }

    async fn evaluate(
        &self,
        state: &mut ConversationState,
        now: DateTime<Utc>,
    ) -> Result<MonitorDecision> {
        let poll = self
            .ctx
            .polls
            .fetch_poll()
            .await
            .context("error fetching poll status")?;
        let poll_summary = poll.summary();
        state.set_summary(conversation_summary(&poll_summary));

        let decision = decide(state, now, &self.thresholds);
        let (kind, text) = match decision {
            MonitorDecision::IdlePrompt => (
                PromptKind::Idle,
                self.ctx.generator.idle_prompt(state.summary()).await?,
            ),
            MonitorDecision::PollUpdate => (
                PromptKind::PollUpdate,
                self.ctx.generator.poll_update_prompt(&poll_summary).await?,
            ),
            MonitorDecision::Quiet => {
                self.ctx
                    .emit(HostEvent::SummaryRefreshed(state.summary().to_string()));
                return Ok(decision);
            }
        };

        let reply = OutboundReply::new(self.ctx.host_prompt_id.clone(), text);
        self.ctx
            .replies
            .upsert_reply(&reply)
            .await
            .context("error writing prompt message")?;
        state.record_response(now);

        tracing::info!("Host prompt ({:?}) written: {}", kind, reply.message);
        self.ctx
            .emit(HostEvent::SummaryRefreshed(state.summary().to_string()));
        self.ctx.emit(HostEvent::PromptEmitted {
            kind,
            reply_id: reply.id,
            text: reply.message,
        });
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::generator::testing::ScriptedBackend;
    use crate::poll::{PollOption, PollSnapshot};
    use crate::workers::testing::{harness, Harness};
    use crate::workers::MessageWorker;

    fn poll(question: &str, voters: &[&str]) -> PollSnapshot {
        let mut options = BTreeMap::new();
        options.insert(
            "a".to_string(),
            PollOption {
                label: "A".to_string(),
                text: "Yes".to_string(),
                voters: voters.iter().map(|v| v.to_string()).collect(),
            },
        );
        PollSnapshot {
            question: question.to_string(),
            options,
        }
    }

    async fn seed_times(h: &Harness, now: DateTime<Utc>, user_ago_ms: i64, response_ago_ms: i64) {
        let mut state = h.ctx.conversation.lock().await;
        state.record_user_message(now - ChronoDuration::milliseconds(user_ago_ms));
        state.record_response(now - ChronoDuration::milliseconds(response_ago_ms));
    }

    fn monitor(h: &Harness) -> MonitorWorker {
        MonitorWorker::new(
            h.ctx.clone(),
            Duration::from_millis(10),
            MonitorThresholds::default(),
        )
    }

    #[tokio::test]
    async fn silent_user_gets_idle_prompt_on_sentinel() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Ready?", &["a", "b", "a"])).unwrap();
        let now = Utc::now();
        seed_times(&h, now, 40_000, 20_000).await;

        let decision = monitor(&h).tick_at(now).await.unwrap();
        assert_eq!(decision, MonitorDecision::IdlePrompt);

        let reply = h.store.reply("host-prompt").unwrap().expect("host prompt");
        assert_eq!(reply.message, "reply #1");
        let prompts = h.backend.prompts();
        assert!(prompts[0].contains("User said: prompt"));
        assert!(prompts[0].contains("A - Yes: 3 votes"));

        let state = h.ctx.conversation.snapshot().await;
        assert_eq!(state.last_response_at(), now);
    }

    #[tokio::test]
    async fn poll_update_at_boundary_and_quiet_just_before() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Ready?", &["a"])).unwrap();

        let now = Utc::now();
        seed_times(&h, now, 10_000, 14_990).await;
        assert_eq!(
            monitor(&h).tick_at(now).await.unwrap(),
            MonitorDecision::Quiet
        );
        assert!(h.store.reply("host-prompt").unwrap().is_none());

        let later = now + ChronoDuration::milliseconds(10);
        assert_eq!(
            monitor(&h).tick_at(later).await.unwrap(),
            MonitorDecision::PollUpdate
        );
        let prompts = h.backend.prompts();
        assert!(prompts[0].contains("Poll update: Question: Ready?"));
        assert!(prompts[0].contains("User said: poll-update"));
    }

    #[tokio::test]
    async fn summary_is_refreshed_even_when_quiet() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Lunch?", &[])).unwrap();
        let now = Utc::now();
        seed_times(&h, now, 1_000, 1_000).await;

        monitor(&h).tick_at(now).await.unwrap();
        let state = h.ctx.conversation.snapshot().await;
        assert_eq!(
            state.summary(),
            "Current poll status:\nQuestion: Lunch?\nA - Yes: 0 votes\n"
        );
    }

    #[tokio::test]
    async fn sentinel_prompt_is_overwritten_each_emission() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Ready?", &[])).unwrap();
        let start = Utc::now();
        let worker = monitor(&h);

        worker.tick_at(start).await.unwrap();
        worker
            .tick_at(start + ChronoDuration::seconds(15))
            .await
            .unwrap();

        let replies = h.store.replies().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message, "reply #2");
    }

    #[tokio::test]
    async fn tick_clock_is_read_after_waiting_for_the_lock() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Ready?", &[])).unwrap();
        let thresholds = MonitorThresholds {
            idle_user: ChronoDuration::hours(1),
            idle_response: ChronoDuration::hours(1),
            poll_update: ChronoDuration::milliseconds(100),
        };

        let guard = {
            let mut state = h.ctx.conversation.lock().await;
            let now = Utc::now();
            state.record_user_message(now);
            state.record_response(now);
            state
        };
        let worker = MonitorWorker::new(h.ctx.clone(), Duration::from_millis(20), thresholds);
        let ticker = tokio::spawn(worker.run());

        // The first tick fires while the lock is held; by the time it gets
        // the lock the poll update is due.
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(guard);

        let first = tokio::time::timeout(Duration::from_secs(2), h.events.recv_async())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), h.events.recv_async())
            .await
            .unwrap()
            .unwrap();
        ticker.abort();

        assert!(matches!(first, HostEvent::SummaryRefreshed(_)));
        assert!(
            matches!(
                second,
                HostEvent::PromptEmitted {
                    kind: PromptKind::PollUpdate,
                    ..
                }
            ),
            "unexpected event: {:?}",
            second
        );
    }

    #[tokio::test]
    async fn generation_failure_is_fatal_and_leaves_sentinel_untouched() {
        let h = harness(ScriptedBackend::failing("model offline"));
        h.store.set_poll(poll("Ready?", &[])).unwrap();

        let err = monitor(&h).tick_at(Utc::now()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("model offline"));
        assert!(h.store.reply("host-prompt").unwrap().is_none());

        let state = h.ctx.conversation.snapshot().await;
        assert_eq!(state.last_response_at(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn prompt_write_failure_is_fatal_and_keeps_response_time() {
        let h = harness(ScriptedBackend::default());
        h.store.set_poll(poll("Ready?", &[])).unwrap();
        h.store.fail_replies_with("sink unavailable").unwrap();

        let err = monitor(&h).run().await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("error writing prompt message"));
        assert!(message.contains("sink unavailable"));

        let state = h.ctx.conversation.snapshot().await;
        assert_eq!(state.last_response_at(), DateTime::<Utc>::UNIX_EPOCH);
        assert!(!state.summary().is_empty());
    }

    #[tokio::test]
    async fn poll_fetch_failure_stops_the_monitor() {
        let h = harness(ScriptedBackend::default());
        h.store.fail_polls_with("document missing").unwrap();

        let err = monitor(&h).run().await.unwrap_err();
        assert!(format!("{:#}", err).contains("document missing"));
    }

    #[tokio::test]
    async fn concurrent_ticks_and_messages_never_tear_the_summary() {
        let h = harness(ScriptedBackend::with_delay(Duration::from_millis(2)));
        let first = poll("First question?", &["a"]);
        let second = poll("Second question?", &["a", "b"]);
        let valid = [
            conversation_summary(&first.summary()),
            conversation_summary(&second.summary()),
        ];
        h.store.set_poll_sequence(vec![first, second]).unwrap();

        let ticker = {
            let worker = MonitorWorker::new(
                h.ctx.clone(),
                Duration::from_millis(3),
                MonitorThresholds {
                    idle_user: ChronoDuration::zero(),
                    idle_response: ChronoDuration::zero(),
                    poll_update: ChronoDuration::zero(),
                },
            );
            tokio::spawn(worker.run())
        };

        for i in 0..20 {
            h.store.push_message(&format!("m{}", i), "hi").unwrap();
        }
        h.store.expire_subscriptions();
        let listener = tokio::spawn(MessageWorker::new(h.ctx.clone()).run());
        let exit = listener.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::DeadlineExceeded);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ticker.is_finished(), "monitor keeps running after listener exits");
        ticker.abort();

        assert_eq!(h.backend.max_in_flight.load(Ordering::SeqCst), 1);
        let state = h.ctx.conversation.snapshot().await;
        assert!(valid.contains(&state.summary().to_string()));
        for prompt in h.backend.prompts() {
            if prompt.contains("User said: hi") && prompt.contains("Current poll status") {
                assert!(
                    valid.iter().any(|summary| prompt.contains(summary.as_str())),
                    "torn summary in prompt: {}",
                    prompt
                );
            }
        }
    }
}
