use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::task::{JoinError, JoinHandle};

use crate::config::{FailurePolicy, HostConfig};
use crate::generator::ResponseGenerator;
use crate::llm_client::{GenerationBackend, LlmClient};
use crate::state::{MonitorThresholds, SharedConversation};
use crate::store::HostDatabase;
use crate::workers::{
    drain_backlog, HostEvent, MessageWorker, MonitorWorker, WorkerContext, WorkerExit, WorkerKind,
};

/// Everything the two workers need, wired from one config.
pub struct HostRuntime {
    pub config: HostConfig,
    pub database: HostDatabase,
    pub conversation: SharedConversation,
    ctx: WorkerContext,
}

pub struct HostRuntimeBuilder {
    config: HostConfig,
    event_tx: Sender<HostEvent>,
    backend: Option<Arc<dyn GenerationBackend>>,
    database: Option<HostDatabase>,
}

impl HostRuntimeBuilder {
    pub fn new(config: HostConfig, event_tx: Sender<HostEvent>) -> Self {
        Self {
            config,
            event_tx,
            backend: None,
            database: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_database(mut self, database: HostDatabase) -> Self {
        self.database = Some(database);
        self
    }

    pub fn build(self) -> Result<HostRuntime> {
        let config = self.config;
        config.validate().context("invalid configuration")?;

        let database = match self.database {
            Some(database) => database,
            None => HostDatabase::open(&config)
                .with_context(|| format!("error opening store at {}", config.database_path))?,
        };
        tracing::info!(
            "Store ready: {} (messages: {}, replies: {}, poll: {}/{})",
            config.database_path,
            config.user_collection,
            config.reply_collection,
            config.poll_collection,
            config.poll_document_id
        );

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                if config.llm_api_url.trim().is_empty() {
                    anyhow::bail!("llm_api_url must be set");
                }
                let client = LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                )
                .with_max_tokens(config.max_tokens);
                tracing::info!("LLM backend: {} ({})", config.llm_api_url, client.model());
                Arc::new(client)
            }
        };

        let generator =
            ResponseGenerator::new(backend, config.persona.clone(), config.temperature);
        let conversation = SharedConversation::new();
        let ctx = WorkerContext {
            messages: Arc::new(database.clone()),
            replies: Arc::new(database.clone()),
            polls: Arc::new(database.clone()),
            generator,
            conversation: conversation.clone(),
            events: self.event_tx,
            host_prompt_id: config.host_prompt_id.clone(),
        };

        Ok(HostRuntime {
            config,
            database,
            conversation,
            ctx,
        })
    }
}

impl HostRuntime {
    pub fn bootstrap(config: HostConfig, event_tx: Sender<HostEvent>) -> Result<Self> {
        HostRuntimeBuilder::new(config, event_tx).build()
    }

    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings::from_config(&self.config)
    }

    /// Drain the backlog, then run both workers until they end or `shutdown`
    /// resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        run_workers(self.ctx.clone(), self.settings(), shutdown).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub monitor_tick: Duration,
    pub thresholds: MonitorThresholds,
    pub failure_policy: FailurePolicy,
}

impl SupervisorSettings {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            monitor_tick: config.monitor_tick(),
            thresholds: MonitorThresholds::from_config(config),
            failure_policy: config.failure_policy,
        }
    }
}

/// The backlog drain must finish before either worker starts; a drain failure
/// is returned without spawning anything.
pub async fn run_workers<F>(
    ctx: WorkerContext,
    settings: SupervisorSettings,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let drained = drain_backlog(ctx.messages.as_ref())
        .await
        .context("error marking existing messages")?;
    ctx.emit(HostEvent::BacklogDrained { count: drained });

    let mut message_task = tokio::spawn(MessageWorker::new(ctx.clone()).run());
    let mut monitor_task = tokio::spawn(
        MonitorWorker::new(ctx.clone(), settings.monitor_tick, settings.thresholds).run(),
    );

    tokio::pin!(shutdown);
    let mut message_done = false;
    let mut monitor_done = false;
    let mut first_error: Option<anyhow::Error> = None;

    while !(message_done && monitor_done) {
        let (worker, outcome) = tokio::select! {
            result = &mut message_task, if !message_done => {
                message_done = true;
                (WorkerKind::Message, settle(&ctx, WorkerKind::Message, result))
            }
            result = &mut monitor_task, if !monitor_done => {
                monitor_done = true;
                (WorkerKind::Monitor, settle(&ctx, WorkerKind::Monitor, result))
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping workers");
                abort_unfinished(&message_task, message_done);
                abort_unfinished(&monitor_task, monitor_done);
                return Ok(());
            }
        };

        let Err(error) = outcome else {
            continue;
        };

        match settings.failure_policy {
            FailurePolicy::Cascade => {
                tracing::error!("{} failed, stopping the other worker", worker);
                abort_unfinished(&message_task, message_done);
                abort_unfinished(&monitor_task, monitor_done);
                return Err(error);
            }
            FailurePolicy::Isolate => {
                tracing::warn!("{} failed, the other worker keeps running", worker);
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn abort_unfinished<T>(task: &JoinHandle<T>, done: bool) {
    if !done {
        task.abort();
    }
}

fn settle(
    ctx: &WorkerContext,
    worker: WorkerKind,
    result: std::result::Result<Result<WorkerExit>, JoinError>,
) -> Result<()> {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(join_error) => Err(anyhow::anyhow!("{} task aborted: {}", worker, join_error)),
    };

    match outcome {
        Ok(exit) => {
            tracing::info!("{} stopped: {:?}", worker, exit);
            ctx.emit(HostEvent::WorkerStopped { worker, exit });
            Ok(())
        }
        Err(error) => {
            let error = error.context(format!("{} failed", worker));
            tracing::error!("{:#}", error);
            ctx.emit(HostEvent::WorkerFailed {
                worker,
                error: format!("{:#}", error),
            });
            Err(error)
        }
    }
}
